//! 用量与性能指标：每次尝试一条记录，会话级求和
//!
//! 记录只追加、不修改；token 与成本在会话内单调不减。规划调用不属于任何任务，单独记录但计入会话汇总。

use serde::{Deserialize, Serialize};

use crate::core::graph::TaskGraph;
use crate::core::task::{TaskId, TaskStatus};

/// 单次能力调用的用量记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub execution_time_ms: u64,
    pub provider: String,
    pub model: String,
}

impl MetricsRecord {
    /// 非 LLM 能力（抓取、回显等）的零用量记录
    pub fn zero(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Self::default()
        }
    }

    pub fn from_usage(
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_usd: f64,
    ) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_usd,
            execution_time_ms: 0,
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// 带任务 ID 与尝试序号的记录（按尝试完成时间追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: TaskId,
    pub attempt: u32,
    pub success: bool,
    #[serde(flatten)]
    pub metrics: MetricsRecord,
}

/// 会话汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub execution_time_ms: u64,
    pub attempts: usize,
    pub planning_calls: usize,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
}

/// 指标汇总器：只追加
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    records: Vec<AttemptRecord>,
    planning: Vec<MetricsRecord>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, task_id: TaskId, attempt: u32, success: bool, metrics: MetricsRecord) {
        tracing::debug!(
            task_id,
            attempt,
            success,
            total_tokens = metrics.total_tokens,
            cost_usd = metrics.cost_usd,
            execution_time_ms = metrics.execution_time_ms,
            "metrics recorded"
        );
        self.records.push(AttemptRecord {
            task_id,
            attempt,
            success,
            metrics,
        });
    }

    /// 规划调用的用量
    pub fn record_planning(&mut self, metrics: MetricsRecord) {
        tracing::debug!(
            total_tokens = metrics.total_tokens,
            cost_usd = metrics.cost_usd,
            "planning metrics recorded"
        );
        self.planning.push(metrics);
    }

    pub fn planning_records(&self) -> &[MetricsRecord] {
        &self.planning
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn records_for(&self, task_id: TaskId) -> impl Iterator<Item = &AttemptRecord> {
        self.records.iter().filter(move |r| r.task_id == task_id)
    }

    /// 所有尝试与规划调用求和；任务计数取自任务图的最终状态
    pub fn session_totals(&self, graph: &TaskGraph) -> SessionTotals {
        let mut totals = SessionTotals {
            attempts: self.records.len(),
            planning_calls: self.planning.len(),
            ..SessionTotals::default()
        };
        let usage = self.records.iter().map(|r| &r.metrics).chain(self.planning.iter());
        for m in usage {
            totals.prompt_tokens += m.prompt_tokens;
            totals.completion_tokens += m.completion_tokens;
            totals.total_tokens += m.total_tokens;
            totals.cost_usd += m.cost_usd;
            totals.execution_time_ms += m.execution_time_ms;
        }
        totals.tasks_total = graph.len();
        totals.tasks_completed = graph.count_with_status(TaskStatus::Completed);
        totals.tasks_failed = graph.count_with_status(TaskStatus::Failed);
        totals
    }

    /// tokens / ms，仅用于报告；没有计时数据时为 None
    pub fn efficiency(&self, task_id: TaskId) -> Option<f64> {
        let (tokens, ms) = self
            .records_for(task_id)
            .fold((0u64, 0u64), |(t, m), r| {
                (t + r.metrics.total_tokens, m + r.metrics.execution_time_ms)
            });
        (ms > 0).then(|| tokens as f64 / ms as f64)
    }
}
