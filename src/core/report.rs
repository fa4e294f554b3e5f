//! 会话报告：每个任务的终态、每次尝试的指标与会话汇总
//!
//! 落盘文件名为 `{session_id}_{YYYYmmdd_HHMMSS}.json`。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::metrics::{AttemptRecord, MetricsRecord, SessionTotals};
use crate::core::state::{SessionPhase, SessionState};
use crate::core::task::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorReport {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub description: String,
    pub ability: String,
    pub role: String,
    pub dependent_task_ids: Vec<TaskId>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<TaskErrorReport>,
    pub attempts: u32,
    /// tokens / ms
    pub efficiency: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub objective: String,
    pub state: SessionPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<TaskReport>,
    pub attempts: Vec<AttemptRecord>,
    /// 规划调用的用量
    #[serde(default)]
    pub planning: Vec<MetricsRecord>,
    pub totals: SessionTotals,
    /// 已完成任务的输出，按 ID 拼接
    #[serde(default)]
    pub summary: String,
}

/// 会话摘要：每个已完成任务一段 "Task #id: 描述" 加输出
pub fn session_summary(state: &SessionState) -> String {
    state
        .graph
        .tasks()
        .filter(|t| t.status == TaskStatus::Completed)
        .filter_map(|t| {
            t.result
                .as_deref()
                .map(|r| format!("Task #{}: {}\n{}", t.id, t.description, r.trim()))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl SessionReport {
    pub fn build(
        session_id: &str,
        objective: &str,
        phase: SessionPhase,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        state: &SessionState,
    ) -> Self {
        let tasks = state
            .graph
            .tasks()
            .map(|t| TaskReport {
                id: t.id,
                description: t.description.clone(),
                ability: t.ability.clone(),
                role: t.effective_role().to_string(),
                dependent_task_ids: t.dependent_task_ids.iter().copied().collect(),
                status: t.status,
                result: t.result.clone(),
                error: t.error.as_ref().map(|e| TaskErrorReport {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }),
                attempts: t.attempt_count,
                efficiency: state.metrics.efficiency(t.id),
                started_at: t.started_at,
                completed_at: t.completed_at,
            })
            .collect();

        Self {
            session_id: session_id.to_string(),
            objective: objective.to_string(),
            state: phase,
            started_at,
            finished_at,
            tasks,
            attempts: state.metrics.records().to_vec(),
            planning: state.metrics.planning_records().to_vec(),
            totals: state.metrics.session_totals(&state.graph),
            summary: session_summary(state),
        }
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.json", self.session_id, self.finished_at.format("%Y%m%d_%H%M%S"))
    }

    pub fn to_json_pretty(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 写入目录（不存在则创建），返回文件路径
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf, ReportError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, self.to_json_pretty()?)?;
        tracing::info!(path = %path.display(), "session report saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::core::error::TaskError;
    use crate::core::metrics::MetricsRecord;
    use crate::core::task::Task;

    fn sample_state() -> SessionState {
        let mut state = SessionState::new();
        state.graph.add_task(Task::new(1, "Fetch", "echo")).unwrap();
        state
            .graph
            .add_task(Task::new(2, "Summarize", "echo").with_dependencies([1]))
            .unwrap();
        state.graph.mark_in_progress(1).unwrap();
        state.graph.record_attempt(1).unwrap();
        state.metrics.record(
            1,
            1,
            false,
            MetricsRecord::from_usage("mock", "m", 3, 4, 0.5),
        );
        state
            .graph
            .mark_failed(1, TaskError::AbilityFailed("bad".into()))
            .unwrap();
        state
    }

    #[test]
    fn test_report_lists_every_task_with_error_kind() {
        let now = Utc::now();
        let report = SessionReport::build("sid", "obj", SessionPhase::Complete, now, now, &sample_state());
        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.task(1).unwrap().error.as_ref().unwrap().kind, "AbilityFailed");
        assert_eq!(
            report.task(2).unwrap().error.as_ref().unwrap().kind,
            "UpstreamDependencyFailed"
        );
        assert_eq!(report.totals.total_tokens, 7);
        assert_eq!(report.totals.tasks_failed, 2);

        let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["state"], "complete");
        assert_eq!(json["tasks"][1]["status"], "failed");
    }

    #[test]
    fn test_summary_joins_completed_outputs() {
        let mut state = SessionState::new();
        state.graph.add_task(Task::new(1, "Outline", "echo")).unwrap();
        state.graph.add_task(Task::new(2, "Draft", "echo")).unwrap();
        state.graph.add_task(Task::new(3, "Polish", "echo")).unwrap();
        for (id, out) in [(1, "three sections\n"), (2, "the draft")] {
            state.graph.mark_in_progress(id).unwrap();
            state.graph.mark_completed(id, out.to_string()).unwrap();
        }
        state.graph.mark_in_progress(3).unwrap();
        state
            .graph
            .mark_failed(3, TaskError::AbilityFailed("x".into()))
            .unwrap();

        assert_eq!(
            session_summary(&state),
            "Task #1: Outline\nthree sections\n\nTask #2: Draft\nthe draft"
        );
    }

    #[test]
    fn test_write_to_dir_uses_session_and_timestamp() {
        let finished = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let report = SessionReport::build("abc", "obj", SessionPhase::Complete, finished, finished, &SessionState::new());
        assert_eq!(report.file_name(), "abc_20240506_070809.json");

        let dir = tempfile::tempdir().unwrap();
        let path = report.write_to_dir(dir.path().join("metrics")).unwrap();
        let saved: SessionReport = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(saved, report);
    }
}
