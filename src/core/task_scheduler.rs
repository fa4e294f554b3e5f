//! 任务调度：选出下一个 Ready 任务，用 Semaphore 限制并发执行数
//!
//! 选择是纯函数（同一状态下重复调用结果相同）；真正的派发由编排器在会话锁内完成。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::graph::TaskGraph;
use crate::core::task::TaskId;

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 执行许可（默认 1 = 串行）
    worker_permits: Arc<Semaphore>,
    max_workers: usize,
}

impl TaskScheduler {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            worker_permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// ID 最小的 Ready 任务；没有则为 None
    pub fn next_ready_task(&self, graph: &TaskGraph) -> Option<TaskId> {
        graph.first_ready()
    }

    /// 退避已到期、可重新派发的任务（ID 最小者）；等待中的任务不占执行许可
    pub fn next_due_retry(&self, graph: &TaskGraph, now: DateTime<Utc>) -> Option<TaskId> {
        graph.next_due_retry(now)
    }

    /// 立即获取一个执行许可；已满时返回 None
    pub fn try_acquire_worker(&self) -> Option<OwnedSemaphorePermit> {
        self.worker_permits.clone().try_acquire_owned().ok()
    }

    pub fn available_workers(&self) -> usize {
        self.worker_permits.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;

    #[test]
    fn test_next_ready_is_lowest_id_and_idempotent() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new(1, "a", "echo")).unwrap();
        graph.add_task(Task::new(2, "b", "echo")).unwrap();
        graph
            .add_task(Task::new(3, "c", "echo").with_dependencies([1]))
            .unwrap();

        let scheduler = TaskScheduler::default();
        assert_eq!(scheduler.next_ready_task(&graph), Some(1));
        assert_eq!(scheduler.next_ready_task(&graph), Some(1));

        graph.mark_in_progress(1).unwrap();
        assert_eq!(scheduler.next_ready_task(&graph), Some(2));
    }

    #[test]
    fn test_due_retry_respects_retry_time() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new(1, "a", "echo")).unwrap();
        graph.mark_in_progress(1).unwrap();
        graph.record_attempt(1).unwrap();
        let now = Utc::now();
        graph.schedule_retry(1, now + chrono::Duration::seconds(2)).unwrap();

        let scheduler = TaskScheduler::default();
        assert_eq!(scheduler.next_due_retry(&graph, now), None);
        assert_eq!(scheduler.next_due_retry(&graph, now + chrono::Duration::seconds(2)), Some(1));
        assert_eq!(scheduler.next_ready_task(&graph), None);
    }

    #[test]
    fn test_none_when_nothing_ready() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new(1, "a", "echo")).unwrap();
        graph.mark_in_progress(1).unwrap();
        assert_eq!(TaskScheduler::default().next_ready_task(&graph), None);
    }

    #[test]
    fn test_worker_permits_bound_concurrency() {
        let scheduler = TaskScheduler::new(2);
        let a = scheduler.try_acquire_worker();
        let b = scheduler.try_acquire_worker();
        assert!(a.is_some() && b.is_some());
        assert!(scheduler.try_acquire_worker().is_none());
        drop(a);
        assert_eq!(scheduler.available_workers(), 1);
        assert!(scheduler.try_acquire_worker().is_some());
    }

    #[test]
    fn test_zero_workers_means_one() {
        assert_eq!(TaskScheduler::new(0).max_workers(), 1);
    }
}
