//! 关闭信号：Ctrl+C / SIGTERM -> 会话取消
//!
//! 触发后编排器不再派发新任务，执行中的尝试完成当前调用后结束，会话以 Cancelled 收尾。

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserInitiated => f.write_str("ctrl-c"),
            ShutdownReason::Signal => f.write_str("sigterm"),
        }
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 交给 Orchestrator::with_cancellation 的令牌
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.shutdown_token.is_cancelled() {
            tracing::warn!(reason = %reason, "cancelling session");
        }
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clones_share_the_token() {
        let manager = ShutdownManager::new();
        let handle = manager.clone();
        handle.shutdown(ShutdownReason::Signal);
        handle.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
        assert_eq!(ShutdownReason::Signal.to_string(), "sigterm");
    }
}
