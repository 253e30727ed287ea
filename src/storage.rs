//! Storage seam for the request queue
//!
//! The queue core is a client of an external storage service. This module
//! defines that capability set as a trait plus an in-process reference
//! implementation used by tests and local runs. The in-memory store
//! mirrors the remote service's semantics: `get_head` is non-destructive,
//! handled requests leave the pending order, and forefront inserts go to
//! the front.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{CrawlError, Request};

/// Largest serialized request the storage accepts.
pub const MAX_PAYLOAD_SIZE_BYTES: usize = 9 * 1024 * 1024;

/// Result of an `add_request`/`update_request` storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOperationInfo {
    pub request_id: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// One entry of the queue head as reported by the storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHeadItem {
    pub id: String,
    pub unique_key: String,
}

/// A non-destructive view of the next requests in the queue.
#[derive(Debug, Clone, Default)]
pub struct QueueHead {
    pub items: Vec<QueueHeadItem>,
}

/// Capability set the request queue consumes.
///
/// Implementations must deduplicate by `unique_key`: adding a request
/// whose key already exists returns the existing id with
/// `was_already_present = true` and must not create a second copy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestQueueStorage: Send + Sync {
    async fn add_request(
        &self,
        queue_id: &str,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, CrawlError>;

    async fn get_request(
        &self,
        queue_id: &str,
        request_id: &str,
    ) -> Result<Option<Request>, CrawlError>;

    async fn update_request(
        &self,
        queue_id: &str,
        request: &Request,
        forefront: Option<bool>,
    ) -> Result<QueueOperationInfo, CrawlError>;

    async fn get_head(&self, queue_id: &str, limit: usize) -> Result<QueueHead, CrawlError>;

    async fn delete_queue(&self, queue_id: &str) -> Result<(), CrawlError>;

    /// Per-retry-bucket counts of rate-limit errors this client has seen,
    /// read by the snapshotter's client dimension. Bucket `i` counts
    /// errors that persisted through `i` retries.
    fn rate_limit_error_counts(&self) -> Vec<u64> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
struct StoredRequest {
    request: Request,
    handled: bool,
}

#[derive(Default)]
struct QueueData {
    // authoritative store, indexed by id and by unique_key
    by_id: HashMap<String, StoredRequest>,
    id_by_unique_key: HashMap<String, String>,
    // ids still waiting to be handled, in emission order
    pending: VecDeque<String>,
}

/// In-process implementation of [`RequestQueueStorage`].
///
/// Holds any number of named queues. All operations are synchronous under
/// one lock; the async trait surface exists for parity with remote
/// implementations.
pub struct InMemoryRequestQueueStorage {
    queues: Mutex<HashMap<String, QueueData>>,
    rate_limit_errors: Vec<AtomicU64>,
}

const RATE_LIMIT_BUCKETS: usize = 10;

impl InMemoryRequestQueueStorage {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            rate_limit_errors: (0..RATE_LIMIT_BUCKETS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Record a rate-limit error observed after `retry` retries. Test and
    /// instrumentation hook feeding the snapshotter's client dimension.
    pub fn record_rate_limit_error(&self, retry: usize) {
        let bucket = retry.min(RATE_LIMIT_BUCKETS - 1);
        self.rate_limit_errors[bucket].fetch_add(1, Ordering::Relaxed);
    }

    fn check_payload_size(request: &Request) -> Result<(), CrawlError> {
        let size = serde_json::to_vec(request).map(|b| b.len()).unwrap_or(0);
        if size > MAX_PAYLOAD_SIZE_BYTES {
            return Err(CrawlError::PayloadTooLarge(format!(
                "request {} serializes to {size} bytes, limit is {MAX_PAYLOAD_SIZE_BYTES}",
                request.unique_key
            )));
        }
        Ok(())
    }

    fn lock_queues(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, QueueData>>, CrawlError> {
        self.queues
            .lock()
            .map_err(|e| CrawlError::Storage(format!("storage lock poisoned: {e}")))
    }
}

impl Default for InMemoryRequestQueueStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestQueueStorage for InMemoryRequestQueueStorage {
    async fn add_request(
        &self,
        queue_id: &str,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, CrawlError> {
        Self::check_payload_size(request)?;

        let mut queues = self.lock_queues()?;
        let queue = queues.entry(queue_id.to_string()).or_default();

        if let Some(existing_id) = queue.id_by_unique_key.get(&request.unique_key) {
            let stored = &queue.by_id[existing_id];
            return Ok(QueueOperationInfo {
                request_id: existing_id.clone(),
                was_already_present: true,
                was_already_handled: stored.handled,
            });
        }

        let id = Uuid::new_v4().to_string();
        let mut stored = request.clone();
        stored.id = Some(id.clone());

        queue.id_by_unique_key.insert(request.unique_key.clone(), id.clone());
        queue.by_id.insert(
            id.clone(),
            StoredRequest {
                request: stored,
                handled: false,
            },
        );
        if forefront {
            queue.pending.push_front(id.clone());
        } else {
            queue.pending.push_back(id.clone());
        }

        debug!(
            "Stored request {} in queue {} (forefront: {})",
            request.unique_key, queue_id, forefront
        );

        Ok(QueueOperationInfo {
            request_id: id,
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn get_request(
        &self,
        queue_id: &str,
        request_id: &str,
    ) -> Result<Option<Request>, CrawlError> {
        let queues = self.lock_queues()?;
        Ok(queues
            .get(queue_id)
            .and_then(|q| q.by_id.get(request_id))
            .map(|stored| stored.request.clone()))
    }

    async fn update_request(
        &self,
        queue_id: &str,
        request: &Request,
        forefront: Option<bool>,
    ) -> Result<QueueOperationInfo, CrawlError> {
        Self::check_payload_size(request)?;

        let id = request.id.clone().ok_or_else(|| {
            CrawlError::InvalidArgument("cannot update a request without an id".to_string())
        })?;

        let mut queues = self.lock_queues()?;
        let queue = queues.entry(queue_id.to_string()).or_default();

        let stored = queue.by_id.get_mut(&id).ok_or_else(|| {
            CrawlError::Storage(format!("request {id} not found in queue {queue_id}"))
        })?;

        let was_already_handled = stored.handled;
        stored.request = request.clone();

        if request.is_handled() {
            stored.handled = true;
            queue.pending.retain(|pending_id| pending_id != &id);
        } else if !was_already_handled {
            // reclaim: reposition within the pending order
            queue.pending.retain(|pending_id| pending_id != &id);
            if forefront.unwrap_or(false) {
                queue.pending.push_front(id.clone());
            } else {
                queue.pending.push_back(id.clone());
            }
        }

        Ok(QueueOperationInfo {
            request_id: id,
            was_already_present: true,
            was_already_handled,
        })
    }

    async fn get_head(&self, queue_id: &str, limit: usize) -> Result<QueueHead, CrawlError> {
        let queues = self.lock_queues()?;
        let Some(queue) = queues.get(queue_id) else {
            return Ok(QueueHead::default());
        };

        let items = queue
            .pending
            .iter()
            .take(limit)
            .filter_map(|id| {
                queue.by_id.get(id).map(|stored| QueueHeadItem {
                    id: id.clone(),
                    unique_key: stored.request.unique_key.clone(),
                })
            })
            .collect();

        Ok(QueueHead { items })
    }

    async fn delete_queue(&self, queue_id: &str) -> Result<(), CrawlError> {
        let mut queues = self.lock_queues()?;
        queues.remove(queue_id);
        Ok(())
    }

    fn rate_limit_error_counts(&self) -> Vec<u64> {
        self.rate_limit_errors
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect()
    }
}
