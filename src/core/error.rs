//! 错误分类：任务级 / 图操作 / 编排器级
//!
//! 任务级错误（TaskError）记录在任务上并级联到下游，不会抛出主循环；
//! 只有 OrchestratorError 会返回给调用方。

use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};

/// 任务的终态失败原因（写入 Task.error 与会话报告）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// 注册表中不存在该能力（永久，不重试）
    #[error("Unknown ability: {0}")]
    UnknownAbility(String),

    /// 能力返回永久失败（参数、校验等）
    #[error("Ability failed: {0}")]
    AbilityFailed(String),

    /// 瞬时失败超过重试预算
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// 上游依赖失败，级联而来
    #[error("Upstream dependency #{upstream} failed")]
    UpstreamDependencyFailed { upstream: TaskId },

    /// 会话取消时仍在重试等待中的任务
    #[error("Cancelled before completion")]
    Cancelled,
}

impl TaskError {
    /// 报告中使用的稳定类别名
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::UnknownAbility(_) => "UnknownAbility",
            TaskError::AbilityFailed(_) => "AbilityFailed",
            TaskError::RetriesExhausted { .. } => "RetriesExhausted",
            TaskError::UpstreamDependencyFailed { .. } => "UpstreamDependencyFailed",
            TaskError::Cancelled => "Cancelled",
        }
    }
}

/// 任务图操作与任务列表导入错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(TaskId),

    #[error("Task #{task} references unknown dependency #{dependency}")]
    InvalidDependencyReference { task: TaskId, dependency: TaskId },

    #[error("Malformed task list: {0}")]
    MalformedTaskList(String),

    #[error("Task not found: #{0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task #{task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task #{0} is not waiting for a retry")]
    NotAwaitingRetry(TaskId),
}

/// 编排器级错误：只有这些会中止整个会话
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Fatal orchestrator error: {0}")]
    Fatal(String),

    #[error("Planner error: {0}")]
    Planner(#[from] crate::core::planner::PlannerError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
