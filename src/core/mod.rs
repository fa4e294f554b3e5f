//! 核心编排层：任务模型与依赖图、调度、执行与重试、指标、Planner、主控循环、报告

pub mod error;
pub mod executor;
pub mod graph;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod report;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod task;
pub mod task_scheduler;

pub use error::{GraphError, OrchestratorError, TaskError};
pub use executor::{Dispatch, ExecutionOutcome, TaskExecutor};
pub use graph::TaskGraph;
pub use metrics::{AttemptRecord, MetricsAggregator, MetricsRecord, SessionTotals};
pub use orchestrator::Orchestrator;
pub use planner::{
    build_planning_prompt, descriptors_to_tasks, extract_task_list, LlmTaskPlanner, Plan, PlannerError,
    StaticPlanner, TaskPlanner,
};
pub use report::{session_summary, ReportError, SessionReport, TaskErrorReport, TaskReport};
pub use retry::{Clock, ManualClock, RetryPolicy, SystemClock};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{SessionPhase, SessionState, SharedSessionState};
pub use task::{AgentRole, Task, TaskDescriptor, TaskId, TaskStatus};
pub use task_scheduler::TaskScheduler;
