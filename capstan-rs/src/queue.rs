//! Contract of the shared build-request queue, plus an in-process
//! implementation used by tests and single-node deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::types::{
    BuildCompletedEvent, BuildParams, BuildRequest, BuildRequestState, BuildResult,
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("build request not found")]
    NotFound,
    #[error("queue lock no longer held")]
    LockLost,
    #[error("transient queue failure: {0}")]
    Transient(String),
}

impl QueueError {
    /// Callers must retry transient errors until success or a definitive
    /// not-found.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Event callbacks from the queue, delivered over a channel instead of the
/// source's observer pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A request entered REQUESTED in a subscribed zone.
    NewRequest,
    /// External cancel directed at a running build.
    Cancel(String),
    /// External resume directed at a paused build.
    Resume(String),
    /// The request was deleted out from under us.
    Delete(String),
}

/// The zone filter of one consumer: named zones plus optionally the
/// unzoned pool.
#[derive(Default, Debug, Clone)]
pub struct ZoneFilter {
    pub zones: Vec<String>,
    pub unzoned: bool,
}

impl ZoneFilter {
    pub fn matches(&self, zone: Option<&str>) -> bool {
        match zone {
            Some(z) => self.zones.iter().any(|s| s == z),
            None => self.unzoned,
        }
    }
}

#[async_trait]
pub trait BuildQueue: Send + Sync {
    /// Requests currently in REQUESTED matching the filter, in best-effort
    /// submission order. The view is cached: re-check state after locking.
    async fn next(&self, zones: &ZoneFilter) -> Result<Vec<BuildRequest>, QueueError>;

    /// Exclusive lease. `Ok(false)` when somebody else holds it.
    async fn lock(&self, request: &BuildRequest, blocking: bool) -> Result<bool, QueueError>;

    async fn unlock(&self, request: &BuildRequest) -> Result<(), QueueError>;

    /// Whether our lease on the request is still valid.
    async fn lock_valid(&self, request: &BuildRequest) -> bool;

    /// Re-read the authoritative state into `request`.
    async fn refresh(&self, request: &mut BuildRequest) -> Result<(), QueueError>;

    async fn get_params(&self, request: &BuildRequest) -> Result<BuildParams, QueueError>;

    /// Drop the params blob to reduce queue size. Reads afterwards return
    /// an empty blob, not an error.
    async fn clear_params(&self, request: &BuildRequest) -> Result<(), QueueError>;

    /// Persist state and worker info. Requires the lock.
    async fn update(&self, request: &BuildRequest) -> Result<(), QueueError>;

    /// Acknowledge that an external cancel has been honored.
    async fn fulfill_cancel(&self, request: &BuildRequest) -> Result<(), QueueError>;

    /// Acknowledge that an external resume has been honored.
    async fn fulfill_resume(&self, request: &BuildRequest) -> Result<(), QueueError>;

    /// Publish a completion event on the `(tenant, pipeline)` substream.
    async fn submit_completed_event(
        &self,
        request: &BuildRequest,
        result: &BuildResult,
    ) -> Result<(), QueueError>;

    /// Fetch a request by build id regardless of zone; used by streaming
    /// gateways to locate the owning executor.
    async fn lookup(&self, uuid: &str) -> Result<Option<BuildRequest>, QueueError>;

    /// Subscribe to queue events for the given zones.
    fn subscribe(&self, zones: ZoneFilter) -> mpsc::UnboundedReceiver<QueueEvent>;
}

struct StoredRequest {
    request: BuildRequest,
    params: Option<BuildParams>,
    lock: Option<String>,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<String, StoredRequest>,
    next_sequence: u64,
    subscribers: Vec<(ZoneFilter, mpsc::UnboundedSender<QueueEvent>)>,
    result_subscribers: HashMap<(String, String), Vec<mpsc::UnboundedSender<BuildCompletedEvent>>>,
    completed_events: Vec<BuildCompletedEvent>,
}

impl Inner {
    fn notify(&mut self, zone: Option<&str>, event: QueueEvent) {
        self.subscribers.retain(|(filter, tx)| {
            if !filter.matches(zone) {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

/// In-process queue sharing one store across any number of session handles.
///
/// A session models one coordination-service connection; locks are owned by
/// sessions, so two executors in a test get separate handles from
/// [`MemoryQueue::for_session`].
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    session: String,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), session: "default".to_string() }
    }

    /// Another handle on the same store with its own lock identity.
    pub fn for_session(&self, session: impl Into<String>) -> Self {
        Self { inner: self.inner.clone(), session: session.into() }
    }

    /// Scheduler side: enqueue a new request with its params.
    pub fn submit(&self, mut request: BuildRequest, params: BuildParams) {
        let mut inner = self.inner.lock();
        request.state = BuildRequestState::Requested;
        request.sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let zone = request.zone.clone();
        inner.requests.insert(
            request.uuid.clone(),
            StoredRequest { request, params: Some(params), lock: None },
        );
        inner.notify(zone.as_deref(), QueueEvent::NewRequest);
    }

    /// Scheduler side: direct a cancel at a request.
    pub fn request_cancel(&self, uuid: &str) {
        let mut inner = self.inner.lock();
        let zone = match inner.requests.get(uuid) {
            Some(stored) => stored.request.zone.clone(),
            None => return,
        };
        inner.notify(zone.as_deref(), QueueEvent::Cancel(uuid.to_string()));
    }

    /// Scheduler side: direct a resume at a paused request.
    pub fn request_resume(&self, uuid: &str) {
        let mut inner = self.inner.lock();
        let zone = match inner.requests.get(uuid) {
            Some(stored) => stored.request.zone.clone(),
            None => return,
        };
        inner.notify(zone.as_deref(), QueueEvent::Resume(uuid.to_string()));
    }

    /// Scheduler side: delete a request (normally after processing its
    /// completion event).
    pub fn remove(&self, uuid: &str) {
        let mut inner = self.inner.lock();
        if let Some(stored) = inner.requests.remove(uuid) {
            let zone = stored.request.zone.clone();
            inner.notify(zone.as_deref(), QueueEvent::Delete(uuid.to_string()));
        }
    }

    /// Scheduler side: follow the result substream of one pipeline.
    pub fn subscribe_results(
        &self,
        tenant: &str,
        pipeline: &str,
    ) -> mpsc::UnboundedReceiver<BuildCompletedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .result_subscribers
            .entry((tenant.to_string(), pipeline.to_string()))
            .or_default()
            .push(tx);
        rx
    }

    /// All completion events observed so far, oldest first.
    pub fn completed_events(&self) -> Vec<BuildCompletedEvent> {
        self.inner.lock().completed_events.clone()
    }

    fn try_lock(&self, uuid: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        let stored = inner.requests.get_mut(uuid).ok_or(QueueError::NotFound)?;
        match &stored.lock {
            Some(owner) if owner != &self.session => Ok(false),
            _ => {
                stored.lock = Some(self.session.clone());
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl BuildQueue for MemoryQueue {
    async fn next(&self, zones: &ZoneFilter) -> Result<Vec<BuildRequest>, QueueError> {
        let inner = self.inner.lock();
        let mut matching: Vec<BuildRequest> = inner
            .requests
            .values()
            .filter(|stored| stored.request.state == BuildRequestState::Requested)
            .filter(|stored| zones.matches(stored.request.zone.as_deref()))
            .map(|stored| stored.request.clone())
            .collect();
        matching.sort_by_key(|request| request.sequence);
        Ok(matching)
    }

    async fn lock(&self, request: &BuildRequest, blocking: bool) -> Result<bool, QueueError> {
        if !blocking {
            return self.try_lock(&request.uuid);
        }
        loop {
            if self.try_lock(&request.uuid)? {
                return Ok(true);
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    async fn unlock(&self, request: &BuildRequest) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let stored = inner.requests.get_mut(&request.uuid).ok_or(QueueError::NotFound)?;
        if stored.lock.as_deref() == Some(self.session.as_str()) {
            stored.lock = None;
        }
        Ok(())
    }

    async fn lock_valid(&self, request: &BuildRequest) -> bool {
        let inner = self.inner.lock();
        inner
            .requests
            .get(&request.uuid)
            .map(|stored| stored.lock.as_deref() == Some(self.session.as_str()))
            .unwrap_or(false)
    }

    async fn refresh(&self, request: &mut BuildRequest) -> Result<(), QueueError> {
        let inner = self.inner.lock();
        let stored = inner.requests.get(&request.uuid).ok_or(QueueError::NotFound)?;
        *request = stored.request.clone();
        Ok(())
    }

    async fn get_params(&self, request: &BuildRequest) -> Result<BuildParams, QueueError> {
        let inner = self.inner.lock();
        let stored = inner.requests.get(&request.uuid).ok_or(QueueError::NotFound)?;
        Ok(stored.params.clone().unwrap_or_default())
    }

    async fn clear_params(&self, request: &BuildRequest) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let stored = inner.requests.get_mut(&request.uuid).ok_or(QueueError::NotFound)?;
        stored.params = None;
        Ok(())
    }

    async fn update(&self, request: &BuildRequest) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let stored = inner.requests.get_mut(&request.uuid).ok_or(QueueError::NotFound)?;
        if stored.lock.as_deref() != Some(self.session.as_str()) {
            return Err(QueueError::LockLost);
        }
        stored.request.state = request.state;
        stored.request.worker_info = request.worker_info.clone();
        stored.request.attempts = request.attempts;
        Ok(())
    }

    async fn fulfill_cancel(&self, request: &BuildRequest) -> Result<(), QueueError> {
        let inner = self.inner.lock();
        inner.requests.get(&request.uuid).ok_or(QueueError::NotFound)?;
        Ok(())
    }

    async fn fulfill_resume(&self, request: &BuildRequest) -> Result<(), QueueError> {
        let inner = self.inner.lock();
        inner.requests.get(&request.uuid).ok_or(QueueError::NotFound)?;
        Ok(())
    }

    async fn submit_completed_event(
        &self,
        request: &BuildRequest,
        result: &BuildResult,
    ) -> Result<(), QueueError> {
        let event = BuildCompletedEvent {
            uuid: request.uuid.clone(),
            build_set_uuid: request.build_set_uuid.clone(),
            job_name: request.job_name.clone(),
            event_id: request.event_id.clone(),
            result: result.clone(),
        };
        let mut inner = self.inner.lock();
        inner.completed_events.push(event.clone());
        let key = (request.tenant.clone(), request.pipeline.clone());
        if let Some(subscribers) = inner.result_subscribers.get_mut(&key) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        Ok(())
    }

    async fn lookup(&self, uuid: &str) -> Result<Option<BuildRequest>, QueueError> {
        let inner = self.inner.lock();
        Ok(inner.requests.get(uuid).map(|stored| stored.request.clone()))
    }

    fn subscribe(&self, zones: ZoneFilter) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push((zones, tx));
        rx
    }
}
