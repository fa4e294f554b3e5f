//! 任务执行器
//!
//! 每次 execute 只做一次尝试：按名查找能力，在单次超时内调用，追加一条指标记录并输出一行
//! JSON 审计日志（event = "ability_audit"）。瞬时失败且预算未用完时，任务保持 InProgress 并
//! 写入 next_retry_at，执行许可随之释放；到期后由编排器经 resume 重新派发。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::abilities::{Ability, AbilityError, AbilityOutput, AbilityRegistry, AbilityRequest};
use crate::core::error::{GraphError, TaskError};
use crate::core::metrics::MetricsRecord;
use crate::core::retry::{Clock, RetryPolicy};
use crate::core::state::{SessionState, SharedSessionState};
use crate::core::task::{TaskId, TaskStatus};

/// 已派发的任务：ID、能力名与调用参数
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub ability: String,
    pub request: AbilityRequest,
}

/// 一次尝试之后的结果；status 为 InProgress 表示已安排重试
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<TaskError>,
    /// 下次重试时间
    pub retry_at: Option<DateTime<Utc>>,
    /// 完成后变为 Ready 的下游
    pub promoted: Vec<TaskId>,
    /// 失败后被级联的下游
    pub cascaded: Vec<TaskId>,
}

pub struct TaskExecutor {
    registry: AbilityRegistry,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    state: SharedSessionState,
    cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new(
        registry: AbilityRegistry,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        timeout_secs: u64,
        state: SharedSessionState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            policy,
            clock,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            state,
            cancel,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ready -> InProgress 并构造调用参数；须在会话锁内调用，保证同一任务只派发一次
    pub fn dispatch(state: &mut SessionState, task_id: TaskId, objective: &str) -> Result<Dispatch, GraphError> {
        state.graph.mark_in_progress(task_id)?;
        Self::build_dispatch(state, task_id, objective)
    }

    /// 认领退避到期的任务并重新构造调用参数
    pub fn resume(state: &mut SessionState, task_id: TaskId, objective: &str) -> Result<Dispatch, GraphError> {
        state.graph.resume_retry(task_id)?;
        Self::build_dispatch(state, task_id, objective)
    }

    fn build_dispatch(state: &SessionState, task_id: TaskId, objective: &str) -> Result<Dispatch, GraphError> {
        let upstream = state.graph.upstream_results(task_id);
        let task = state.graph.get(task_id).ok_or(GraphError::TaskNotFound(task_id))?;
        let request = AbilityRequest {
            task_id,
            instruction: task.description.clone(),
            role: Some(task.effective_role()),
            objective: objective.to_string(),
            upstream,
        };
        Ok(Dispatch {
            task_id,
            ability: task.ability.clone(),
            request,
        })
    }

    /// 执行一次尝试；图操作失败说明状态被破坏，交给编排器作为致命错误处理
    pub async fn execute(&self, dispatch: Dispatch) -> Result<ExecutionOutcome, GraphError> {
        let Dispatch {
            task_id,
            ability: ability_name,
            request,
        } = dispatch;

        let Some(ability) = self.registry.get(&ability_name) else {
            let attempt = self.state.lock().await.graph.record_attempt(task_id)?;
            self.audit(task_id, &ability_name, attempt, "unknown_ability", 0, None);
            self.state.lock().await.metrics.record(
                task_id,
                attempt,
                false,
                MetricsRecord::zero(ability_name.clone()),
            );
            tracing::warn!(task_id, ability = %ability_name, "unknown ability");
            return self
                .finish_failed(task_id, attempt, TaskError::UnknownAbility(ability_name))
                .await;
        };

        let attempt = self.state.lock().await.graph.record_attempt(task_id)?;
        tracing::debug!(task_id, attempt, ability = %ability_name, "invoking ability");

        let start = Instant::now();
        let result = match timeout(self.timeout, ability.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(AbilityError::transient(format!(
                "Ability '{}' timed out after {}s",
                ability_name,
                self.timeout.as_secs_f64()
            ))),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let metrics = attempt_metrics(ability.as_ref(), &result, elapsed_ms);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_transient() => "transient_error",
            Err(_) => "permanent_error",
        };
        self.audit(task_id, &ability_name, attempt, outcome, elapsed_ms, Some(metrics.total_tokens));
        self.state
            .lock()
            .await
            .metrics
            .record(task_id, attempt, result.is_ok(), metrics);

        let err = match result {
            Ok(AbilityOutput { content, .. }) => {
                let promoted = self.state.lock().await.graph.mark_completed(task_id, content)?;
                tracing::info!(task_id, attempt, promoted = ?promoted, "task completed");
                return Ok(ExecutionOutcome {
                    task_id,
                    status: TaskStatus::Completed,
                    attempts: attempt,
                    error: None,
                    retry_at: None,
                    promoted,
                    cascaded: Vec::new(),
                });
            }
            Err(AbilityError::Permanent(message)) => {
                return self
                    .finish_failed(task_id, attempt, TaskError::AbilityFailed(message))
                    .await;
            }
            Err(err) => err,
        };

        if !self.policy.allows_retry(attempt) {
            let error = TaskError::RetriesExhausted {
                attempts: attempt,
                last_error: err.to_string(),
            };
            return self.finish_failed(task_id, attempt, error).await;
        }
        if self.cancel.is_cancelled() {
            return self.finish_failed(task_id, attempt, TaskError::Cancelled).await;
        }

        let delay = self.policy.delay_for(attempt, err.retry_after());
        let retry_at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.state.lock().await.graph.schedule_retry(task_id, retry_at)?;
        tracing::warn!(
            task_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retry scheduled"
        );
        Ok(ExecutionOutcome {
            task_id,
            status: TaskStatus::InProgress,
            attempts: attempt,
            error: None,
            retry_at: Some(retry_at),
            promoted: Vec::new(),
            cascaded: Vec::new(),
        })
    }

    /// 会话取消时仍在等待重试的任务直接失败
    pub async fn cancel_retry(&self, task_id: TaskId) -> Result<ExecutionOutcome, GraphError> {
        let attempts = {
            let mut state = self.state.lock().await;
            state.graph.resume_retry(task_id)?;
            state.graph.get(task_id).map(|t| t.attempt_count).unwrap_or_default()
        };
        self.finish_failed(task_id, attempts, TaskError::Cancelled).await
    }

    async fn finish_failed(
        &self,
        task_id: TaskId,
        attempts: u32,
        error: TaskError,
    ) -> Result<ExecutionOutcome, GraphError> {
        tracing::warn!(task_id, attempts, error = %error, "task failed");
        let cascaded = self.state.lock().await.graph.mark_failed(task_id, error.clone())?;
        Ok(ExecutionOutcome {
            task_id,
            status: TaskStatus::Failed,
            attempts,
            error: Some(error),
            retry_at: None,
            promoted: Vec::new(),
            cascaded,
        })
    }

    fn audit(
        &self,
        task_id: TaskId,
        ability: &str,
        attempt: u32,
        outcome: &str,
        duration_ms: u64,
        total_tokens: Option<u64>,
    ) {
        let audit = serde_json::json!({
            "event": "ability_audit",
            "task_id": task_id,
            "ability": ability,
            "attempt": attempt,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": duration_ms,
            "total_tokens": total_tokens,
        });
        tracing::info!(audit = %audit.to_string(), "ability");
    }
}

/// 能力上报了用量就用它（缺计时则补上实测值），否则是带实测耗时的零记录
fn attempt_metrics(
    ability: &dyn Ability,
    result: &Result<AbilityOutput, AbilityError>,
    elapsed_ms: u64,
) -> MetricsRecord {
    let reported = match result {
        Ok(output) => output.usage.clone(),
        Err(err) => err.usage().cloned(),
    };
    let mut record = reported.unwrap_or_else(|| MetricsRecord::zero(ability.provider()));
    if record.execution_time_ms == 0 {
        record.execution_time_ms = elapsed_ms;
    }
    record
}
