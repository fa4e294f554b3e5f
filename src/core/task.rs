//! 任务模型：Task、状态、Planner 输出的任务描述符
//!
//! 状态只能前进：Pending → Ready → InProgress → Completed | Failed；
//! Pending / Ready → Failed 只用于上游失败的级联。

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::TaskError;

/// 会话内唯一的任务 ID（Planner 从 1 开始顺序分配）
pub type TaskId = u64;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待依赖完成
    Pending,
    /// 依赖全部完成，可被调度
    Ready,
    /// 已派发给执行器
    InProgress,
    /// 成功完成（终态）
    Completed,
    /// 失败（终态）
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{Completed, Failed, InProgress, Pending, Ready};
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Failed)
                | (Ready, InProgress)
                | (Ready, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 任务角色：供能力实现选择模型，对调度器不透明
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Executor,
    Reviewer,
    Orchestrator,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Executor => "executor",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Orchestrator => "orchestrator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "planner" => Some(AgentRole::Planner),
            "executor" => Some(AgentRole::Executor),
            "reviewer" => Some(AgentRole::Reviewer),
            "orchestrator" => Some(AgentRole::Orchestrator),
            _ => None,
        }
    }

    /// 按任务描述中的关键词推断角色
    pub fn classify(description: &str) -> Self {
        let lower = description.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if has_any(&["plan", "design", "outline", "structure"]) {
            AgentRole::Planner
        } else if has_any(&["review", "analyze", "evaluate", "check"]) {
            AgentRole::Reviewer
        } else if has_any(&["execute", "implement", "generate", "write"]) {
            AgentRole::Executor
        } else {
            AgentRole::Orchestrator
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务实体
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub ability: String,
    pub dependent_task_ids: BTreeSet<TaskId>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<TaskError>,
    pub attempt_count: u32,
    pub role: Option<AgentRole>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 下一次重试的时间（仅在退避等待期间有值）
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, description: impl Into<String>, ability: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            ability: ability.into(),
            dependent_task_ids: BTreeSet::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempt_count: 0,
            role: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_retry_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependent_task_ids = deps.into_iter().collect();
        self
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 未显式指定角色时按描述推断
    pub fn effective_role(&self) -> AgentRole {
        self.role
            .unwrap_or_else(|| AgentRole::classify(&self.description))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task #{}: {} [{}] [{}]",
            self.id, self.description, self.status, self.ability
        )?;
        if !self.dependent_task_ids.is_empty() {
            let deps: Vec<String> = self.dependent_task_ids.iter().map(|d| d.to_string()).collect();
            write!(f, " (depends on: {})", deps.join(", "))?;
        }
        Ok(())
    }
}

/// Planner 产出的任务描述符（JSON 任务列表中的一项）
///
/// 字段全部可选，以便导入时给出 MalformedTaskList 而不是反序列化错误。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(default)]
    pub id: Option<TaskId>,
    #[serde(default, alias = "description")]
    pub task: Option<String>,
    #[serde(default)]
    pub ability: Option<String>,
    #[serde(default)]
    pub dependent_task_ids: Option<Vec<TaskId>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl TaskDescriptor {
    pub fn new(id: TaskId, task: impl Into<String>, ability: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            task: Some(task.into()),
            ability: Some(ability.into()),
            dependent_task_ids: Some(Vec::new()),
            status: Some("incomplete".to_string()),
            role: None,
        }
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependent_task_ids = Some(deps.into_iter().collect());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Ready.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn test_role_classification() {
        assert_eq!(AgentRole::classify("Outline the report"), AgentRole::Planner);
        assert_eq!(AgentRole::classify("Review the draft"), AgentRole::Reviewer);
        assert_eq!(AgentRole::classify("Write the summary"), AgentRole::Executor);
        assert_eq!(AgentRole::classify("Collect numbers"), AgentRole::Orchestrator);
    }

    #[test]
    fn test_descriptor_accepts_description_alias() {
        let json = r#"{"id": 1, "description": "Do it", "ability": "echo", "dependent_task_ids": []}"#;
        let d: TaskDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.task.as_deref(), Some("Do it"));
        assert_eq!(d.id, Some(1));
    }

    #[test]
    fn test_display_lists_dependencies() {
        let task = Task::new(3, "Merge", "echo").with_dependencies([1, 2]);
        assert_eq!(task.to_string(), "Task #3: Merge [pending] [echo] (depends on: 1, 2)");
    }
}
