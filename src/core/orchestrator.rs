//! 编排器：主控循环
//!
//! Initializing：取得任务列表（预先 ingest 的，或由 Planner 生成）并整批导入任务图；
//! Running / Draining：在许可允许时派发退避到期的重试与 Ready 任务到 JoinSet，等待任一尝试结束或
//! 轮询间隔后重新检查；没有执行中的尝试、只剩等待重试的任务时，经 Clock 等到最早的重试时间。
//! 终态：Complete（无未终结任务）、FailedIncomplete（停滞保护）、Cancelled、Fatal。
//! 任务级失败只记录在任务上，只有 OrchestratorError 会返回给调用方。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::abilities::AbilityRegistry;
use crate::config::AppConfig;
use crate::core::error::{GraphError, OrchestratorError};
use crate::core::executor::{ExecutionOutcome, TaskExecutor};
use crate::core::planner::{descriptors_to_tasks, TaskPlanner};
use crate::core::report::SessionReport;
use crate::core::retry::{Clock, RetryPolicy, SystemClock};
use crate::core::state::{SessionPhase, SessionState, SharedSessionState};
use crate::core::task::{Task, TaskDescriptor, TaskId, TaskStatus};
use crate::core::task_scheduler::TaskScheduler;

pub struct Orchestrator {
    session_id: String,
    registry: AbilityRegistry,
    planner: Arc<dyn TaskPlanner>,
    scheduler: TaskScheduler,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    state: SharedSessionState,
    phase: SessionPhase,
    ability_timeout: Duration,
    poll_interval: Duration,
    report_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(cfg: &AppConfig, registry: AbilityRegistry, planner: Arc<dyn TaskPlanner>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            registry,
            planner,
            scheduler: TaskScheduler::new(cfg.executor.max_workers),
            policy: RetryPolicy::from_config(&cfg.executor),
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(SessionState::new())),
            phase: SessionPhase::Initializing,
            ability_timeout: Duration::from_secs(cfg.executor.ability_timeout_secs.max(1)),
            poll_interval: Duration::from_millis(cfg.executor.poll_interval_ms.max(1)),
            report_dir: cfg.report.output_dir.clone(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 使用外部的取消令牌（例如由信号处理器触发）
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.scheduler = TaskScheduler::new(max_workers);
        self
    }

    pub fn with_ability_timeout(mut self, timeout: Duration) -> Self {
        self.ability_timeout = timeout;
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SharedSessionState {
        self.state.clone()
    }

    /// 导入 Planner 格式的任务列表：先校验形状与能力名，再整批加入（任一失败则一个都不加）
    pub async fn ingest(&mut self, descriptors: &[TaskDescriptor]) -> Result<Vec<TaskId>, OrchestratorError> {
        let tasks = descriptors_to_tasks(descriptors, &self.registry)?;
        self.ingest_tasks(tasks).await
    }

    /// 直接导入已构造的任务；能力名在执行时才检查
    pub async fn ingest_tasks(&mut self, tasks: Vec<Task>) -> Result<Vec<TaskId>, OrchestratorError> {
        if self.phase != SessionPhase::Initializing {
            return Err(OrchestratorError::Fatal(format!(
                "cannot ingest tasks in phase {}",
                self.phase
            )));
        }
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        self.state.lock().await.graph.add_batch(tasks)?;
        tracing::info!(count = ids.len(), "tasks ingested");
        Ok(ids)
    }

    /// 运行会话直到终态，返回报告
    pub async fn run(&mut self, objective: &str) -> Result<SessionReport, OrchestratorError> {
        if self.phase != SessionPhase::Initializing {
            return Err(OrchestratorError::Fatal(format!(
                "session already in phase {}",
                self.phase
            )));
        }
        let started_at = Utc::now();
        tracing::info!(session_id = %self.session_id, objective = %objective, "session started");

        match self.drive(objective).await {
            Ok(phase) => self.phase = phase,
            Err(err) => {
                self.phase = SessionPhase::Fatal;
                tracing::error!(session_id = %self.session_id, error = %err, "session aborted");
                return Err(err);
            }
        }

        let report = {
            let state = self.state.lock().await;
            SessionReport::build(&self.session_id, objective, self.phase, started_at, Utc::now(), &state)
        };
        tracing::info!(
            session_id = %self.session_id,
            state = %self.phase,
            completed = report.totals.tasks_completed,
            failed = report.totals.tasks_failed,
            total_tokens = report.totals.total_tokens,
            cost_usd = report.totals.cost_usd,
            "session finished"
        );
        tracing::debug!(summary = %report.summary, "session summary");
        if let Some(dir) = &self.report_dir {
            if let Err(e) = report.write_to_dir(dir) {
                tracing::warn!(error = %e, "failed to save session report");
            }
        }
        Ok(report)
    }

    async fn drive(&mut self, objective: &str) -> Result<SessionPhase, OrchestratorError> {
        if self.registry.is_empty() {
            return Err(OrchestratorError::Fatal("ability registry is empty".to_string()));
        }

        let needs_plan = self.state.lock().await.graph.is_empty();
        if needs_plan {
            let plan = self
                .planner
                .plan(objective, &self.registry.descriptions())
                .await?;
            if let Some(usage) = plan.usage {
                self.state.lock().await.metrics.record_planning(usage);
            }
            self.ingest(&plan.tasks).await?;
        } else {
            tracing::info!("using pre-ingested task list");
        }
        self.set_phase(SessionPhase::Running);

        let executor = Arc::new(
            TaskExecutor::new(
                self.registry.clone(),
                self.policy.clone(),
                self.clock.clone(),
                self.ability_timeout.as_secs(),
                self.state.clone(),
                self.cancel.clone(),
            )
            .with_timeout(self.ability_timeout),
        );
        let mut in_flight: JoinSet<Result<ExecutionOutcome, GraphError>> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                self.cancel_waiting_retries(&executor).await?;
            } else {
                self.dispatch_ready(&executor, &mut in_flight, objective).await?;
            }

            if in_flight.is_empty() {
                let next_retry = {
                    let state = self.state.lock().await;
                    if self.cancel.is_cancelled() {
                        tracing::warn!("session cancelled, no further tasks dispatched");
                        return Ok(SessionPhase::Cancelled);
                    }
                    if !state.graph.has_unresolved_tasks() {
                        return Ok(SessionPhase::Complete);
                    }
                    if self.scheduler.next_ready_task(&state.graph).is_some() {
                        continue;
                    }
                    state.graph.earliest_retry_at()
                };
                match next_retry {
                    Some(at) => {
                        self.set_phase(SessionPhase::Draining);
                        self.wait_until(at).await;
                        continue;
                    }
                    None => {
                        let state = self.state.lock().await;
                        tracing::warn!(
                            pending = state.graph.count_with_status(TaskStatus::Pending),
                            "unresolved tasks remain but none can become ready"
                        );
                        return Ok(SessionPhase::FailedIncomplete);
                    }
                }
            }

            let (has_work, next_retry) = {
                let state = self.state.lock().await;
                let due = self.scheduler.next_due_retry(&state.graph, self.clock.now()).is_some();
                let ready = self.scheduler.next_ready_task(&state.graph).is_some();
                (due || ready, state.graph.earliest_retry_at())
            };
            self.set_phase(if has_work && !self.cancel.is_cancelled() {
                SessionPhase::Running
            } else {
                SessionPhase::Draining
            });

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok(Ok(outcome))) => self.on_outcome(&outcome).await,
                    Some(Ok(Err(err))) => {
                        in_flight.abort_all();
                        return Err(err.into());
                    }
                    Some(Err(join_err)) => {
                        in_flight.abort_all();
                        return Err(OrchestratorError::Fatal(format!("executor task failed: {join_err}")));
                    }
                    None => {}
                },
                _ = tokio::time::sleep(self.poll_wait(next_retry)) => {}
            }
        }
    }

    /// 在会话锁内认领到期的重试或把 Ready 任务标记为 InProgress 并派发，直到没有许可或没有可派发的任务
    async fn dispatch_ready(
        &self,
        executor: &Arc<TaskExecutor>,
        in_flight: &mut JoinSet<Result<ExecutionOutcome, GraphError>>,
        objective: &str,
    ) -> Result<(), OrchestratorError> {
        while let Some(permit) = self.scheduler.try_acquire_worker() {
            let dispatch = {
                let mut state = self.state.lock().await;
                if let Some(id) = self.scheduler.next_due_retry(&state.graph, self.clock.now()) {
                    TaskExecutor::resume(&mut state, id, objective)?
                } else if let Some(id) = self.scheduler.next_ready_task(&state.graph) {
                    TaskExecutor::dispatch(&mut state, id, objective)?
                } else {
                    break;
                }
            };
            tracing::info!(task_id = dispatch.task_id, ability = %dispatch.ability, "dispatching task");
            let executor = Arc::clone(executor);
            in_flight.spawn(async move {
                let _permit = permit;
                executor.execute(dispatch).await
            });
        }
        Ok(())
    }

    /// 取消后，所有等待重试的任务以 Cancelled 失败并级联
    async fn cancel_waiting_retries(&self, executor: &TaskExecutor) -> Result<(), OrchestratorError> {
        loop {
            let waiting = {
                let state = self.state.lock().await;
                state
                    .graph
                    .earliest_retry_at()
                    .and_then(|at| state.graph.next_due_retry(at))
            };
            let Some(id) = waiting else {
                return Ok(());
            };
            let outcome = executor.cancel_retry(id).await?;
            self.on_outcome(&outcome).await;
        }
    }

    /// 等到最早的重试时间（或会话被取消）
    async fn wait_until(&self, at: DateTime<Utc>) {
        let wait = (at - self.clock.now()).to_std().unwrap_or_default();
        if wait.is_zero() {
            return;
        }
        tracing::debug!(wait_ms = wait.as_millis() as u64, "waiting for retry backoff");
        tokio::select! {
            _ = self.clock.sleep(wait) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// 有尝试在执行时的轮询间隔，不晚于下一次重试到期
    fn poll_wait(&self, next_retry: Option<DateTime<Utc>>) -> Duration {
        next_retry
            .and_then(|at| (at - self.clock.now()).to_std().ok())
            .filter(|d| !d.is_zero())
            .map_or(self.poll_interval, |d| d.min(self.poll_interval))
    }

    async fn on_outcome(&self, outcome: &ExecutionOutcome) {
        match &outcome.error {
            None if outcome.status == TaskStatus::InProgress => tracing::info!(
                task_id = outcome.task_id,
                attempts = outcome.attempts,
                retry_at = ?outcome.retry_at,
                "task waiting for retry"
            ),
            None => tracing::info!(
                task_id = outcome.task_id,
                attempts = outcome.attempts,
                "task finished"
            ),
            Some(err) => tracing::warn!(
                task_id = outcome.task_id,
                attempts = outcome.attempts,
                error = %err,
                cascaded = ?outcome.cascaded,
                "task finished with failure"
            ),
        }
        let state = self.state.lock().await;
        for line in state.task_list() {
            tracing::debug!("{}", line);
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            tracing::debug!(from = %self.phase, to = %phase, "session phase");
            self.phase = phase;
        }
    }
}
