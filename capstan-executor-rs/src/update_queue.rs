//! Repository refresh tasks, deduplicated across concurrent builds on one
//! executor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capstan_rs::types::RepoState;
use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct UpdateTask {
    pub connection: String,
    pub project: String,
    pub repo_state: Option<RepoState>,
    /// Trace annotations only.
    pub event_id: Option<String>,
    pub build: Option<String>,

    done: AtomicBool,
    event: Notify,
    success: AtomicBool,
    canonical_name: Mutex<Option<String>>,
    branches: Mutex<Option<Vec<String>>>,
}

impl UpdateTask {
    pub fn new(
        connection: impl Into<String>,
        project: impl Into<String>,
        repo_state: Option<RepoState>,
    ) -> Self {
        Self {
            connection: connection.into(),
            project: project.into(),
            repo_state,
            event_id: None,
            build: None,
            done: AtomicBool::new(false),
            event: Notify::new(),
            success: AtomicBool::new(false),
            canonical_name: Mutex::new(None),
            branches: Mutex::new(None),
        }
    }

    /// Two tasks are the same work if they refresh the same repo to the
    /// same state.
    fn same_work(&self, other: &UpdateTask) -> bool {
        self.connection == other.connection
            && self.project == other.project
            && self.repo_state == other.repo_state
    }

    pub async fn wait(&self) {
        while !self.done.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.event.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }
    }

    pub fn set_complete(&self, success: bool) {
        self.success.store(success, Ordering::SeqCst);
        self.done.store(true, Ordering::SeqCst);
        self.event.notify_waiters();
    }

    pub fn succeeded(&self) -> bool {
        self.success.load(Ordering::SeqCst)
    }

    pub fn set_discovered(&self, canonical_name: String, branches: Vec<String>) {
        *self.canonical_name.lock() = Some(canonical_name);
        *self.branches.lock() = Some(branches);
    }

    pub fn branches(&self) -> Option<Vec<String>> {
        self.branches.lock().clone()
    }

    pub fn canonical_name(&self) -> Option<String> {
        self.canonical_name.lock().clone()
    }
}

#[derive(Default)]
pub struct DeduplicateQueue {
    queue: Mutex<VecDeque<Arc<UpdateTask>>>,
    available: Notify,
}

impl DeduplicateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Enqueue, returning the already-queued equivalent task if one exists
    /// so callers share a single completion signal.
    pub fn put(&self, task: Arc<UpdateTask>) -> Arc<UpdateTask> {
        let mut queue = self.queue.lock();
        for queued in queue.iter() {
            if queued.same_work(&task) {
                return queued.clone();
            }
        }
        queue.push_back(task.clone());
        drop(queue);
        self.available.notify_one();
        task
    }

    pub async fn get(&self) -> Arc<UpdateTask> {
        loop {
            if let Some(task) = self.queue.lock().pop_front() {
                return task;
            }
            tokio::select! {
                _ = self.available.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_equal_task_returns_existing() {
        let queue = DeduplicateQueue::new();
        let first = queue.put(Arc::new(UpdateTask::new("gerrit", "demo/project", None)));
        let second = queue.put(Arc::new(UpdateTask::new("gerrit", "demo/project", None)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_different_state_not_deduplicated() {
        let queue = DeduplicateQueue::new();
        let mut state = RepoState::new();
        state.set("gerrit", "demo/project", "refs/heads/main", "aaaa");
        let first = queue.put(Arc::new(UpdateTask::new("gerrit", "demo/project", None)));
        let second =
            queue.put(Arc::new(UpdateTask::new("gerrit", "demo/project", Some(state))));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_returns_after_complete() {
        let task = Arc::new(UpdateTask::new("gerrit", "demo/project", None));
        let waiter = task.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            waiter.succeeded()
        });
        tokio::task::yield_now().await;
        task.set_complete(true);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_get_pops_in_order() {
        let queue = DeduplicateQueue::new();
        queue.put(Arc::new(UpdateTask::new("gerrit", "a", None)));
        queue.put(Arc::new(UpdateTask::new("gerrit", "b", None)));
        assert_eq!(queue.get().await.project, "a");
        assert_eq!(queue.get().await.project, "b");
    }
}
