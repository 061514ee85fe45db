//! Contract of the external node allocator, which also stores autohold
//! requests alongside the node records.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::types::{AutoholdRequest, NodeSet};

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("node allocation {0} not found")]
    NotFound(String),
    #[error("node allocation {0} could not be locked")]
    LockFailed(String),
    #[error("transient allocator failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait NodeAllocator: Send + Sync {
    /// Lock and accept a node allocation the scheduler already submitted,
    /// marking the nodes in-use. Failure here is retriable (NODE_FAILURE).
    async fn lock_nodeset(&self, request_id: &str) -> Result<NodeSet, AllocatorError>;

    /// Return the nodes to the pool.
    async fn return_nodeset(&self, nodeset: NodeSet) -> Result<(), AllocatorError>;

    /// Retain the nodes under an autohold request instead of returning
    /// them, and bump the request's use count.
    async fn hold_nodeset(
        &self,
        nodeset: NodeSet,
        request: &AutoholdRequest,
        build_uuid: &str,
    ) -> Result<(), AllocatorError>;

    /// All current autohold requests.
    async fn hold_requests(&self) -> Result<Vec<AutoholdRequest>, AllocatorError>;
}

#[derive(Default)]
struct Inner {
    allocations: BTreeMap<String, NodeSet>,
    returned: Vec<NodeSet>,
    held: Vec<(String, String, NodeSet)>,
    hold_requests: BTreeMap<String, AutoholdRequest>,
}

/// In-memory allocator with pre-seeded allocations; the test stand-in for
/// the external service.
#[derive(Default, Clone)]
pub struct StaticAllocator {
    inner: Arc<Mutex<Inner>>,
}

impl StaticAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_allocation(&self, request_id: impl Into<String>, nodeset: NodeSet) {
        self.inner.lock().allocations.insert(request_id.into(), nodeset);
    }

    pub fn add_hold_request(&self, request: AutoholdRequest) {
        self.inner.lock().hold_requests.insert(request.id.clone(), request);
    }

    /// `(autohold id, build uuid)` pairs of every held nodeset.
    pub fn held(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .held
            .iter()
            .map(|(hold, build, _)| (hold.clone(), build.clone()))
            .collect()
    }

    pub fn returned_count(&self) -> usize {
        self.inner.lock().returned.len()
    }
}

#[async_trait]
impl NodeAllocator for StaticAllocator {
    async fn lock_nodeset(&self, request_id: &str) -> Result<NodeSet, AllocatorError> {
        self.inner
            .lock()
            .allocations
            .remove(request_id)
            .ok_or_else(|| AllocatorError::NotFound(request_id.to_string()))
    }

    async fn return_nodeset(&self, nodeset: NodeSet) -> Result<(), AllocatorError> {
        self.inner.lock().returned.push(nodeset);
        Ok(())
    }

    async fn hold_nodeset(
        &self,
        nodeset: NodeSet,
        request: &AutoholdRequest,
        build_uuid: &str,
    ) -> Result<(), AllocatorError> {
        let mut inner = self.inner.lock();
        inner
            .held
            .push((request.id.clone(), build_uuid.to_string(), nodeset));
        if let Some(stored) = inner.hold_requests.get_mut(&request.id) {
            stored.current_count += 1;
        }
        Ok(())
    }

    async fn hold_requests(&self) -> Result<Vec<AutoholdRequest>, AllocatorError> {
        Ok(self.inner.lock().hold_requests.values().cloned().collect())
    }
}
