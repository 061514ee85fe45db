//! In-memory registry of in-flight builds and the per-build control
//! handle shared between the service, the sensors and the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capstan_rs::types::ResultKind;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub struct BuildHandle {
    pub uuid: String,
    /// Set once the startup phase (repo prep, playbook prep) is over.
    started: AtomicBool,
    paused: AtomicBool,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<ResultKind>>,
    resume_requested: AtomicBool,
    /// Fires on external resume or cancel while paused.
    pub resume: Notify,
    /// Process group of the currently running subprocess, if any.
    process_group: Mutex<Option<i32>>,
}

impl BuildHandle {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            resume_requested: AtomicBool::new(false),
            resume: Notify::new(),
            process_group: Mutex::new(None),
        }
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<ResultKind> {
        *self.abort_reason.lock()
    }

    /// Flag the build as aborted, kill its subprocess group and wake any
    /// paused wait. Safe to call more than once; the first reason wins.
    pub fn abort(&self, reason: Option<ResultKind>) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            let mut stored = self.abort_reason.lock();
            if stored.is_none() {
                *stored = reason;
            }
        }
        self.kill_process_group();
        self.resume.notify_waiters();
    }

    /// Honor an external resume while the build is paused.
    pub fn request_resume(&self) {
        self.resume_requested.store(true, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    pub fn is_resume_requested(&self) -> bool {
        self.resume_requested.load(Ordering::SeqCst)
    }

    pub fn set_process_group(&self, pgid: Option<i32>) {
        *self.process_group.lock() = pgid;
    }

    pub fn kill_process_group(&self) {
        let pgid = *self.process_group.lock();
        if let Some(pgid) = pgid {
            debug!(build = %self.uuid, pgid, "sending SIGKILL to process group");
            if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                // ESRCH just means the process already exited.
                if err != nix::errno::Errno::ESRCH {
                    warn!(build = %self.uuid, pgid, %err, "could not kill process group");
                }
            }
        }
    }
}

#[derive(Default)]
pub struct BuildRegistry {
    builds: Mutex<HashMap<String, Arc<BuildHandle>>>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<BuildHandle>) {
        self.builds.lock().insert(handle.uuid.clone(), handle);
    }

    pub fn remove(&self, uuid: &str) -> Option<Arc<BuildHandle>> {
        self.builds.lock().remove(uuid)
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<BuildHandle>> {
        self.builds.lock().get(uuid).cloned()
    }

    pub fn running(&self) -> usize {
        self.builds.lock().len()
    }

    pub fn starting(&self) -> usize {
        self.builds.lock().values().filter(|b| !b.is_started()).count()
    }

    pub fn paused(&self) -> usize {
        self.builds.lock().values().filter(|b| b.is_paused()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.lock().is_empty()
    }

    pub fn uuids(&self) -> Vec<String> {
        self.builds.lock().keys().cloned().collect()
    }

    /// Abort every in-flight build (hard stop).
    pub fn abort_all(&self) {
        for handle in self.builds.lock().values() {
            handle.abort(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_keeps_first_reason() {
        let handle = BuildHandle::new("abc123");
        handle.abort(Some(ResultKind::DiskFull));
        handle.abort(Some(ResultKind::Aborted));
        assert!(handle.is_aborted());
        assert_eq!(handle.abort_reason(), Some(ResultKind::DiskFull));
    }

    #[test]
    fn test_registry_counts() {
        let registry = BuildRegistry::new();
        let a = Arc::new(BuildHandle::new("aa"));
        let b = Arc::new(BuildHandle::new("bb"));
        registry.insert(a.clone());
        registry.insert(b.clone());
        assert_eq!(registry.running(), 2);
        assert_eq!(registry.starting(), 2);
        a.mark_started();
        assert_eq!(registry.starting(), 1);
        b.mark_started();
        b.set_paused(true);
        assert_eq!(registry.paused(), 1);
        registry.remove("aa");
        assert_eq!(registry.running(), 1);
    }
}
