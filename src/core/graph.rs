//! 任务依赖图
//!
//! 任务按 ID 有序存放（BTreeMap，ID 即创建顺序）；反向邻接表（dependents）在
//! add_task 时增量维护，完成时据此提升下游、失败时据此做广度优先级联。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::core::error::{GraphError, TaskError};
use crate::core::task::{Task, TaskId, TaskStatus};

/// 任务图：任务表 + 反向邻接表 + Ready 索引
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    /// 依赖 ID -> 直接依赖它的任务
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// 当前处于 Ready 的任务（有序，便于取最小 ID）
    ready: BTreeSet<TaskId>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入任务并计算初始状态；依赖必须是已存在的任务
    pub fn add_task(&mut self, mut task: Task) -> Result<TaskStatus, GraphError> {
        if self.tasks.contains_key(&task.id) {
            return Err(GraphError::DuplicateTaskId(task.id));
        }
        if let Some(&missing) = task
            .dependent_task_ids
            .iter()
            .find(|dep| **dep == task.id || !self.tasks.contains_key(*dep))
        {
            return Err(GraphError::InvalidDependencyReference {
                task: task.id,
                dependency: missing,
            });
        }

        let failed_dep = task
            .dependent_task_ids
            .iter()
            .copied()
            .find(|dep| self.status_of(*dep) == Some(TaskStatus::Failed));
        let all_done = task
            .dependent_task_ids
            .iter()
            .all(|dep| self.status_of(*dep) == Some(TaskStatus::Completed));

        task.status = if let Some(upstream) = failed_dep {
            task.error = Some(TaskError::UpstreamDependencyFailed { upstream });
            task.completed_at = Some(Utc::now());
            TaskStatus::Failed
        } else if all_done {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };

        for dep in &task.dependent_task_ids {
            self.dependents.entry(*dep).or_default().push(task.id);
        }
        if task.status == TaskStatus::Ready {
            self.ready.insert(task.id);
        }
        let status = task.status;
        tracing::debug!(task_id = task.id, status = %status, "task added");
        self.tasks.insert(task.id, task);
        Ok(status)
    }

    /// 整批加入：先按顺序校验（依赖只能指向图中或批内靠前的任务），全部通过才逐个加入
    pub fn add_batch(&mut self, tasks: Vec<Task>) -> Result<Vec<TaskStatus>, GraphError> {
        let mut known: HashSet<TaskId> = self.tasks.keys().copied().collect();
        for task in &tasks {
            if !known.insert(task.id) {
                return Err(GraphError::DuplicateTaskId(task.id));
            }
            if let Some(&missing) = task
                .dependent_task_ids
                .iter()
                .find(|dep| **dep == task.id || !known.contains(*dep))
            {
                return Err(GraphError::InvalidDependencyReference {
                    task: task.id,
                    dependency: missing,
                });
            }
        }
        tasks.into_iter().map(|task| self.add_task(task)).collect()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|t| t.status)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// 按 ID 顺序遍历
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// ID 最小的 Ready 任务
    pub fn first_ready(&self) -> Option<TaskId> {
        self.ready.iter().next().copied()
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// 是否还有未进入终态的任务
    pub fn has_unresolved_tasks(&self) -> bool {
        self.tasks.values().any(|t| !t.is_terminal())
    }

    /// 直接依赖的结果（按依赖 ID 顺序），用于构造下游任务的上下文
    pub fn upstream_results(&self, id: TaskId) -> Vec<(TaskId, String)> {
        let Some(task) = self.tasks.get(&id) else {
            return Vec::new();
        };
        task.dependent_task_ids
            .iter()
            .filter_map(|dep| {
                self.tasks
                    .get(dep)
                    .and_then(|t| t.result.clone())
                    .map(|r| (*dep, r))
            })
            .collect()
    }

    /// Ready -> InProgress（派发前调用，防止重复派发）
    pub fn mark_in_progress(&mut self, id: TaskId) -> Result<(), GraphError> {
        let task = self.transition(id, TaskStatus::InProgress)?;
        task.started_at = Some(Utc::now());
        self.ready.remove(&id);
        Ok(())
    }

    /// 记录一次执行尝试，返回新的尝试次数
    pub fn record_attempt(&mut self, id: TaskId) -> Result<u32, GraphError> {
        let task = self.in_progress_mut(id)?;
        task.attempt_count += 1;
        task.next_retry_at = None;
        Ok(task.attempt_count)
    }

    /// 设置退避等待中的下次重试时间
    pub fn schedule_retry(&mut self, id: TaskId, at: DateTime<Utc>) -> Result<(), GraphError> {
        let task = self.in_progress_mut(id)?;
        task.next_retry_at = Some(at);
        Ok(())
    }

    /// 退避到期、可以再次派发的任务（ID 最小者）
    pub fn next_due_retry(&self, now: DateTime<Utc>) -> Option<TaskId> {
        self.retry_waiting()
            .find(|(_, at)| *at <= now)
            .map(|(id, _)| id)
    }

    /// 最早的重试时间；没有等待重试的任务时为 None
    pub fn earliest_retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_waiting().map(|(_, at)| at).min()
    }

    /// 认领一个等待重试的任务（清除 next_retry_at），防止重复派发
    pub fn resume_retry(&mut self, id: TaskId) -> Result<(), GraphError> {
        let task = self.in_progress_mut(id)?;
        if task.next_retry_at.take().is_none() {
            return Err(GraphError::NotAwaitingRetry(id));
        }
        Ok(())
    }

    fn retry_waiting(&self) -> impl Iterator<Item = (TaskId, DateTime<Utc>)> + '_ {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter_map(|t| t.next_retry_at.map(|at| (t.id, at)))
    }

    /// InProgress -> Completed，返回因此变为 Ready 的下游任务
    pub fn mark_completed(&mut self, id: TaskId, result: String) -> Result<Vec<TaskId>, GraphError> {
        let task = self.transition(id, TaskStatus::Completed)?;
        task.result = Some(result);
        task.completed_at = Some(Utc::now());
        task.next_retry_at = None;

        let mut promoted = Vec::new();
        let dependents = self.dependents.get(&id).cloned().unwrap_or_default();
        for dependent in dependents {
            let satisfied = match self.tasks.get(&dependent) {
                Some(t) if t.status == TaskStatus::Pending => t
                    .dependent_task_ids
                    .iter()
                    .all(|dep| self.status_of(*dep) == Some(TaskStatus::Completed)),
                _ => false,
            };
            if satisfied {
                self.transition(dependent, TaskStatus::Ready)?;
                self.ready.insert(dependent);
                promoted.push(dependent);
            }
        }
        Ok(promoted)
    }

    /// InProgress -> Failed，并把 UpstreamDependencyFailed 广度优先级联到所有未终结的下游
    pub fn mark_failed(&mut self, id: TaskId, error: TaskError) -> Result<Vec<TaskId>, GraphError> {
        let task = self.transition(id, TaskStatus::Failed)?;
        task.error = Some(error);
        task.completed_at = Some(Utc::now());
        task.next_retry_at = None;
        Ok(self.cascade_failure(id))
    }

    fn cascade_failure(&mut self, root: TaskId) -> Vec<TaskId> {
        let mut cascaded = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(upstream) = queue.pop_front() {
            let dependents = self.dependents.get(&upstream).cloned().unwrap_or_default();
            for dependent in dependents {
                let Some(task) = self.tasks.get_mut(&dependent) else {
                    continue;
                };
                if task.is_terminal() {
                    continue;
                }
                task.status = TaskStatus::Failed;
                task.error = Some(TaskError::UpstreamDependencyFailed { upstream });
                task.completed_at = Some(Utc::now());
                self.ready.remove(&dependent);
                cascaded.push(dependent);
                queue.push_back(dependent);
            }
        }
        if !cascaded.is_empty() {
            tracing::info!(task_id = root, cascaded = ?cascaded, "failure cascaded to dependents");
        }
        cascaded
    }

    fn transition(&mut self, id: TaskId, to: TaskStatus) -> Result<&mut Task, GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::TaskNotFound(id))?;
        if !task.status.can_transition_to(to) {
            return Err(GraphError::InvalidTransition {
                task: id,
                from: task.status,
                to,
            });
        }
        task.status = to;
        Ok(task)
    }

    fn in_progress_mut(&mut self, id: TaskId) -> Result<&mut Task, GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::TaskNotFound(id))?;
        if task.status != TaskStatus::InProgress {
            return Err(GraphError::InvalidTransition {
                task: id,
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan_in_graph() -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new(1, "a", "echo")).unwrap();
        graph.add_task(Task::new(2, "b", "echo")).unwrap();
        graph
            .add_task(Task::new(3, "c", "echo").with_dependencies([1, 2]))
            .unwrap();
        graph
    }

    #[test]
    fn test_initial_status() {
        let graph = fan_in_graph();
        assert_eq!(graph.status_of(1), Some(TaskStatus::Ready));
        assert_eq!(graph.status_of(2), Some(TaskStatus::Ready));
        assert_eq!(graph.status_of(3), Some(TaskStatus::Pending));
        assert_eq!(graph.first_ready(), Some(1));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut graph = fan_in_graph();
        let err = graph.add_task(Task::new(2, "again", "echo")).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTaskId(2));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut graph = TaskGraph::new();
        let err = graph
            .add_task(Task::new(1, "a", "echo").with_dependencies([99]))
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::InvalidDependencyReference { task: 1, dependency: 99 }
        );
        assert!(graph.is_empty());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut graph = TaskGraph::new();
        let err = graph
            .add_task(Task::new(1, "a", "echo").with_dependencies([1]))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidDependencyReference { .. }));
    }

    #[test]
    fn test_fan_in_promotion_requires_all_dependencies() {
        let mut graph = fan_in_graph();
        graph.mark_in_progress(1).unwrap();
        let promoted = graph.mark_completed(1, "A".into()).unwrap();
        assert!(promoted.is_empty());
        assert_eq!(graph.status_of(3), Some(TaskStatus::Pending));

        graph.mark_in_progress(2).unwrap();
        let promoted = graph.mark_completed(2, "B".into()).unwrap();
        assert_eq!(promoted, vec![3]);
        assert_eq!(graph.status_of(3), Some(TaskStatus::Ready));
        assert_eq!(graph.upstream_results(3), vec![(1, "A".into()), (2, "B".into())]);
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let mut graph = fan_in_graph();
        let err = graph.mark_completed(1, "x".into()).unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { task: 1, .. }));
        let err = graph.mark_in_progress(3).unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { task: 3, .. }));
    }

    #[test]
    fn test_no_backward_transition_after_terminal() {
        let mut graph = fan_in_graph();
        graph.mark_in_progress(1).unwrap();
        graph.mark_completed(1, "A".into()).unwrap();
        assert!(graph.mark_in_progress(1).is_err());
        assert!(graph.mark_failed(1, TaskError::Cancelled).is_err());
        assert_eq!(graph.status_of(1), Some(TaskStatus::Completed));
    }

    #[test]
    fn test_failure_cascades_transitively() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new(1, "root", "echo")).unwrap();
        graph.add_task(Task::new(2, "mid", "echo").with_dependencies([1])).unwrap();
        graph.add_task(Task::new(3, "leaf", "echo").with_dependencies([2])).unwrap();
        graph.add_task(Task::new(4, "free", "echo")).unwrap();

        graph.mark_in_progress(1).unwrap();
        let cascaded = graph
            .mark_failed(1, TaskError::UnknownAbility("nope".into()))
            .unwrap();
        assert_eq!(cascaded, vec![2, 3]);
        assert_eq!(
            graph.get(2).unwrap().error,
            Some(TaskError::UpstreamDependencyFailed { upstream: 1 })
        );
        assert_eq!(
            graph.get(3).unwrap().error,
            Some(TaskError::UpstreamDependencyFailed { upstream: 2 })
        );
        assert_eq!(graph.status_of(4), Some(TaskStatus::Ready));
        assert!(graph.has_unresolved_tasks());
    }

    #[test]
    fn test_cascade_removes_ready_dependents() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new(1, "a", "echo")).unwrap();
        graph.add_task(Task::new(2, "b", "echo")).unwrap();
        graph.add_task(Task::new(3, "c", "echo").with_dependencies([1])).unwrap();
        graph.mark_in_progress(1).unwrap();
        graph.mark_completed(1, "ok".into()).unwrap();
        assert_eq!(graph.status_of(3), Some(TaskStatus::Ready));

        graph.add_task(Task::new(4, "d", "echo").with_dependencies([2, 3])).unwrap();
        graph.mark_in_progress(2).unwrap();
        graph.mark_failed(2, TaskError::AbilityFailed("bad".into())).unwrap();
        assert_eq!(graph.status_of(4), Some(TaskStatus::Failed));
        assert_eq!(graph.status_of(3), Some(TaskStatus::Ready));
        assert_eq!(graph.first_ready(), Some(3));
    }

    #[test]
    fn test_task_added_after_failed_dependency_fails_immediately() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new(1, "a", "echo")).unwrap();
        graph.mark_in_progress(1).unwrap();
        graph.mark_failed(1, TaskError::Cancelled).unwrap();
        let status = graph
            .add_task(Task::new(2, "b", "echo").with_dependencies([1]))
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert!(!graph.has_unresolved_tasks());
    }

    #[test]
    fn test_attempts_and_retry_state() {
        let mut graph = fan_in_graph();
        assert!(graph.record_attempt(1).is_err());
        graph.mark_in_progress(1).unwrap();
        assert_eq!(graph.record_attempt(1).unwrap(), 1);
        graph.schedule_retry(1, Utc::now()).unwrap();
        assert!(graph.get(1).unwrap().next_retry_at.is_some());
        assert_eq!(graph.record_attempt(1).unwrap(), 2);
        assert!(graph.get(1).unwrap().next_retry_at.is_none());
    }

    #[test]
    fn test_due_retries_are_claimed_once() {
        let mut graph = fan_in_graph();
        let now = Utc::now();
        graph.mark_in_progress(1).unwrap();
        graph.mark_in_progress(2).unwrap();
        graph.record_attempt(1).unwrap();
        graph.record_attempt(2).unwrap();
        graph.schedule_retry(2, now + chrono::Duration::seconds(4)).unwrap();
        graph.schedule_retry(1, now + chrono::Duration::seconds(2)).unwrap();

        assert_eq!(graph.next_due_retry(now), None);
        assert_eq!(graph.earliest_retry_at(), Some(now + chrono::Duration::seconds(2)));
        assert_eq!(graph.next_due_retry(now + chrono::Duration::seconds(3)), Some(1));

        graph.resume_retry(1).unwrap();
        assert_eq!(graph.resume_retry(1), Err(GraphError::NotAwaitingRetry(1)));
        assert_eq!(graph.next_due_retry(now + chrono::Duration::seconds(3)), None);
        assert_eq!(graph.next_due_retry(now + chrono::Duration::seconds(5)), Some(2));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let mut graph = TaskGraph::new();
        let batch = vec![
            Task::new(1, "a", "echo"),
            Task::new(2, "b", "echo").with_dependencies([1]),
            Task::new(3, "c", "echo").with_dependencies([99]),
        ];
        let err = graph.add_batch(batch).unwrap_err();
        assert_eq!(
            err,
            GraphError::InvalidDependencyReference {
                task: 3,
                dependency: 99
            }
        );
        assert!(graph.is_empty());

        let statuses = graph
            .add_batch(vec![
                Task::new(1, "a", "echo"),
                Task::new(2, "b", "echo").with_dependencies([1]),
            ])
            .unwrap();
        assert_eq!(statuses, vec![TaskStatus::Ready, TaskStatus::Pending]);
    }

    #[test]
    fn test_batch_rejects_forward_reference() {
        let mut graph = TaskGraph::new();
        let err = graph
            .add_batch(vec![
                Task::new(1, "a", "echo").with_dependencies([2]),
                Task::new(2, "b", "echo"),
            ])
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidDependencyReference { task: 1, dependency: 2 }));
        assert!(graph.is_empty());
    }
}
