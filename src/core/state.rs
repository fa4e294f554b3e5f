//! 会话状态：编排阶段与共享的任务图 + 指标
//!
//! 任务图与指标放在同一把 tokio Mutex 之后，并发完成的任务对下游的提升是原子的。

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::graph::TaskGraph;
use crate::core::metrics::MetricsAggregator;

/// 编排阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Initializing,
    Running,
    /// 没有 Ready 任务但仍有执行中的任务
    Draining,
    Complete,
    /// 仍有未终结任务，但既无 Ready 也无执行中的任务
    FailedIncomplete,
    Cancelled,
    Fatal,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Complete
                | SessionPhase::FailedIncomplete
                | SessionPhase::Cancelled
                | SessionPhase::Fatal
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Initializing => "initializing",
            SessionPhase::Running => "running",
            SessionPhase::Draining => "draining",
            SessionPhase::Complete => "complete",
            SessionPhase::FailedIncomplete => "failed_incomplete",
            SessionPhase::Cancelled => "cancelled",
            SessionPhase::Fatal => "fatal",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个会话内可变的全部状态
#[derive(Debug, Default)]
pub struct SessionState {
    pub graph: TaskGraph,
    pub metrics: MetricsAggregator,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个任务一行，供调试日志输出任务列表
    pub fn task_list(&self) -> Vec<String> {
        self.graph.tasks().map(|t| t.to_string()).collect()
    }
}

pub type SharedSessionState = Arc<Mutex<SessionState>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;

    #[test]
    fn test_phase_terminality() {
        assert!(!SessionPhase::Running.is_terminal());
        assert!(!SessionPhase::Draining.is_terminal());
        assert!(SessionPhase::Complete.is_terminal());
        assert!(SessionPhase::Cancelled.is_terminal());
        assert_eq!(
            serde_json::to_string(&SessionPhase::FailedIncomplete).unwrap(),
            "\"failed_incomplete\""
        );
    }

    #[test]
    fn test_task_list_lines() {
        let mut state = SessionState::new();
        state.graph.add_task(Task::new(1, "Outline", "echo")).unwrap();
        state
            .graph
            .add_task(Task::new(2, "Write", "echo").with_dependencies([1]))
            .unwrap();
        let lines = state.task_list();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("depends on: 1"));
    }
}
