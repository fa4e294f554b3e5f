//! 重试策略与时钟
//!
//! 指数退避：第 n 次重试前等待 initial * 2^(n-1)，不超过 max_delay；
//! 等待通过 Clock trait 完成，测试中换成 ManualClock 即可不真正睡眠。

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ExecutorSection;

/// 重试预算与退避参数
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &ExecutorSection) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: cfg.max_retries,
            initial_delay: secs_or(cfg.retry_delay_secs, defaults.initial_delay),
            max_delay: secs_or(cfg.max_retry_delay_secs, defaults.max_delay),
        }
    }

    /// attempts 次尝试之后是否还允许再试
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// 第 retry 次重试（从 1 开始）前的等待时间；retry_after 为服务端提示
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let backoff = self
            .initial_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay);
        backoff.max(retry_after.unwrap_or_default()).min(self.max_delay)
    }
}

/// 负数记为 0；NaN、无穷或超出 Duration 范围的值回落到默认值
fn secs_or(secs: f64, fallback: Duration) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
        tracing::warn!(secs, fallback_secs = fallback.as_secs_f64(), "invalid retry delay, using default");
        fallback
    })
}

/// 可替换的时钟：当前时间与异步等待
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// 真实时钟（tokio::time::sleep）
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 测试用时钟：sleep 立即返回并记录请求的时长，同时推进虚拟时间
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// 迄今所有 sleep 请求
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        if let Ok(mut now) = self.now.lock() {
            if let Ok(d) = chrono::Duration::from_std(duration) {
                *now += d;
            }
        }
        tokio::task::yield_now().await;
    }
}
