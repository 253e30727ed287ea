//! Dynamic deduplicated work queue
//!
//! The [`RequestQueue`] is a client of an external
//! [`RequestQueueStorage`] service plus local caches: a bounded head
//! cache of next-to-process items, a dedup map short-circuiting duplicate
//! inserts, and handled/in-progress sets implementing the at-least-once
//! fetch/handle/reclaim discipline.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{CrawlError, QueueHeadItem, QueueOperationInfo, Request, RequestQueueStorage};

/// Head items requested from the storage per refill.
pub const QUERY_HEAD_MIN_LENGTH: usize = 100;

/// Capacity of the local dedup cache of known unique keys.
const MAX_CACHED_UNIQUE_KEYS: usize = 1_000_000;

#[derive(Debug, Clone)]
struct CachedRequestInfo {
    id: String,
    was_already_handled: bool,
}

/// Durable, deduplicated queue for dynamically discovered requests.
///
/// The queue persists across crawler restarts through its storage; the
/// local caches only ever short-circuit work the storage would confirm.
/// A request fetched here is considered in flight until it is either
/// marked handled or reclaimed.
///
/// # Examples
///
/// ```rust
/// use crawl_runtime::{InMemoryRequestQueueStorage, Request, RequestQueue};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), crawl_runtime::CrawlError> {
/// let storage = Arc::new(InMemoryRequestQueueStorage::new());
/// let queue = RequestQueue::new(storage, "my-crawl");
///
/// queue.add_request(&Request::new("https://example.com")?, false).await?;
/// let request = queue.fetch_next_request().await?.unwrap();
/// queue.mark_request_handled(&request).await?;
/// assert!(queue.is_finished().await?);
/// # Ok(())
/// # }
/// ```
pub struct RequestQueue {
    storage: Arc<dyn RequestQueueStorage>,
    queue_id: String,
    head_cache: Mutex<VecDeque<QueueHeadItem>>,
    requests_cache: DashMap<String, CachedRequestInfo>,
    cache_eviction_order: std::sync::Mutex<VecDeque<String>>,
    handled: DashSet<String>,
    in_progress: DashSet<String>,
    handled_count: AtomicUsize,
}

impl RequestQueue {
    pub fn new(storage: Arc<dyn RequestQueueStorage>, queue_id: impl Into<String>) -> Self {
        Self {
            storage,
            queue_id: queue_id.into(),
            head_cache: Mutex::new(VecDeque::new()),
            requests_cache: DashMap::new(),
            cache_eviction_order: std::sync::Mutex::new(VecDeque::new()),
            handled: DashSet::new(),
            in_progress: DashSet::new(),
            handled_count: AtomicUsize::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<dyn RequestQueueStorage> {
        &self.storage
    }

    /// Enqueue a request, deduplicating by unique key.
    ///
    /// A locally known key short-circuits without a storage call.
    /// `forefront` inserts at the head of the queue so the request is
    /// returned by the next fetch.
    pub async fn add_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, CrawlError> {
        if let Some(cached) = self.requests_cache.get(&request.unique_key) {
            return Ok(QueueOperationInfo {
                request_id: cached.id.clone(),
                was_already_present: true,
                was_already_handled: cached.was_already_handled,
            });
        }

        let info = self
            .storage
            .add_request(&self.queue_id, request, forefront)
            .await?;
        self.cache_known_request(
            &request.unique_key,
            &info.request_id,
            info.was_already_handled,
        );

        // A forefront insert must be the next request out; mirror it at
        // the front of the local head view.
        if forefront && !info.was_already_handled && !self.in_progress.contains(&info.request_id) {
            let mut head = self.head_cache.lock().await;
            head.retain(|item| item.id != info.request_id);
            head.push_front(QueueHeadItem {
                id: info.request_id.clone(),
                unique_key: request.unique_key.clone(),
            });
        }

        Ok(info)
    }

    /// Return the next request to process, or `None` when the queue is
    /// currently empty.
    ///
    /// The returned request counts as in progress until it is marked
    /// handled or reclaimed.
    pub async fn fetch_next_request(&self) -> Result<Option<Request>, CrawlError> {
        loop {
            let item = {
                let mut head = self.head_cache.lock().await;
                head.pop_front()
            };

            let item = match item {
                Some(item) => item,
                None => {
                    self.refill_head_cache().await?;
                    let mut head = self.head_cache.lock().await;
                    match head.pop_front() {
                        Some(item) => item,
                        None => return Ok(None),
                    }
                }
            };

            // The storage may re-serve items this client already dealt
            // with; the local sets guard against processing them twice.
            if self.handled.contains(&item.unique_key) {
                continue;
            }
            if !self.in_progress.insert(item.id.clone()) {
                continue;
            }

            match self.storage.get_request(&self.queue_id, &item.id).await {
                Ok(Some(request)) => return Ok(Some(request)),
                Ok(None) => {
                    // Head knows an id the store cannot resolve yet; give
                    // it a chance to catch up on a later tick.
                    self.in_progress.remove(&item.id);
                    warn!(
                        "Request {} from the queue head was not found, will retry later",
                        item.id
                    );
                    return Ok(None);
                }
                Err(error) => {
                    self.in_progress.remove(&item.id);
                    return Err(error);
                }
            }
        }
    }

    /// Record a terminal outcome for a fetched request.
    pub async fn mark_request_handled(
        &self,
        request: &Request,
    ) -> Result<QueueOperationInfo, CrawlError> {
        let id = Self::require_id(request)?;
        if !self.in_progress.contains(&id) {
            return Err(CrawlError::InvalidArgument(format!(
                "cannot mark {} handled, it is not in progress",
                request.unique_key
            )));
        }

        let mut updated = request.clone();
        if updated.handled_at.is_none() {
            updated.handled_at = Some(Utc::now());
        }

        let info = self
            .storage
            .update_request(&self.queue_id, &updated, None)
            .await?;

        self.in_progress.remove(&id);
        self.handled.insert(request.unique_key.clone());
        self.handled_count.fetch_add(1, Ordering::Relaxed);
        self.cache_known_request(&request.unique_key, &id, true);

        debug!("Request {} marked handled", request.unique_key);
        Ok(info)
    }

    /// Release a fetched request back to the queue for another attempt.
    pub async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, CrawlError> {
        let id = Self::require_id(request)?;
        if !self.in_progress.contains(&id) {
            return Err(CrawlError::InvalidArgument(format!(
                "cannot reclaim {}, it is not in progress",
                request.unique_key
            )));
        }

        let info = self
            .storage
            .update_request(&self.queue_id, request, Some(forefront))
            .await?;

        self.in_progress.remove(&id);

        let mut head = self.head_cache.lock().await;
        head.retain(|item| item.id != id);
        let item = QueueHeadItem {
            id,
            unique_key: request.unique_key.clone(),
        };
        if forefront {
            head.push_front(item);
        } else {
            head.push_back(item);
        }

        Ok(info)
    }

    /// True iff the queue has nothing to fetch right now. The local head
    /// view is not authoritative, so an empty cache is confirmed against
    /// the storage first.
    pub async fn is_empty(&self) -> Result<bool, CrawlError> {
        {
            let head = self.head_cache.lock().await;
            if !head.is_empty() {
                return Ok(false);
            }
        }
        self.refill_head_cache().await?;
        Ok(self.head_cache.lock().await.is_empty())
    }

    /// True iff the queue is empty and this client has nothing in flight.
    pub async fn is_finished(&self) -> Result<bool, CrawlError> {
        if !self.in_progress.is_empty() {
            return Ok(false);
        }
        self.is_empty().await
    }

    /// Purge all remote and local state.
    pub async fn delete(&self) -> Result<(), CrawlError> {
        self.storage.delete_queue(&self.queue_id).await?;
        self.head_cache.lock().await.clear();
        self.requests_cache.clear();
        if let Ok(mut order) = self.cache_eviction_order.lock() {
            order.clear();
        }
        self.handled.clear();
        self.in_progress.clear();
        Ok(())
    }

    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    pub fn handled_count(&self) -> usize {
        self.handled_count.load(Ordering::Relaxed)
    }

    async fn refill_head_cache(&self) -> Result<(), CrawlError> {
        let head = self
            .storage
            .get_head(&self.queue_id, QUERY_HEAD_MIN_LENGTH)
            .await?;

        let mut cache = self.head_cache.lock().await;
        for item in head.items {
            if self.handled.contains(&item.unique_key) {
                continue;
            }
            if self.in_progress.contains(&item.id) {
                continue;
            }
            if cache.iter().any(|cached| cached.id == item.id) {
                continue;
            }
            self.cache_known_request(&item.unique_key, &item.id, false);
            cache.push_back(item);
        }

        Ok(())
    }

    fn cache_known_request(&self, unique_key: &str, id: &str, was_already_handled: bool) {
        let info = CachedRequestInfo {
            id: id.to_string(),
            was_already_handled,
        };
        if self
            .requests_cache
            .insert(unique_key.to_string(), info)
            .is_none()
        {
            if let Ok(mut order) = self.cache_eviction_order.lock() {
                order.push_back(unique_key.to_string());
                if order.len() > MAX_CACHED_UNIQUE_KEYS {
                    if let Some(oldest) = order.pop_front() {
                        self.requests_cache.remove(&oldest);
                    }
                }
            }
        }
    }

    fn require_id(request: &Request) -> Result<String, CrawlError> {
        request.id.clone().ok_or_else(|| {
            CrawlError::InvalidArgument(format!(
                "request {} has no id, it never passed through the queue",
                request.unique_key
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockRequestQueueStorage;
    use crate::{InMemoryRequestQueueStorage, QueueHead};

    fn queue() -> RequestQueue {
        RequestQueue::new(Arc::new(InMemoryRequestQueueStorage::new()), "test")
    }

    fn request(url: &str) -> Request {
        Request::new(url).unwrap()
    }

    #[tokio::test]
    async fn test_add_fetch_handle_cycle() {
        let queue = queue();
        let info = queue
            .add_request(&request("https://example.com/a"), false)
            .await
            .unwrap();
        assert!(!info.was_already_present);

        let fetched = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(fetched.unique_key, "https://example.com/a");
        assert_eq!(fetched.id.as_deref(), Some(info.request_id.as_str()));
        assert_eq!(queue.in_progress_count(), 1);

        queue.mark_request_handled(&fetched).await.unwrap();
        assert_eq!(queue.in_progress_count(), 0);
        assert_eq!(queue.handled_count(), 1);
        assert!(queue.is_finished().await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_add_returns_same_id() {
        let queue = queue();
        let req = request("https://example.com/a");

        let first = queue.add_request(&req, false).await.unwrap();
        assert!(!first.was_already_present);

        let second = queue.add_request(&req, false).await.unwrap();
        assert!(second.was_already_present);
        assert_eq!(second.request_id, first.request_id);
    }

    #[tokio::test]
    async fn test_dedup_short_circuits_storage() {
        let mut mock = MockRequestQueueStorage::new();
        mock.expect_add_request().times(1).returning(|_, _, _| {
            Ok(QueueOperationInfo {
                request_id: "r1".to_string(),
                was_already_present: false,
                was_already_handled: false,
            })
        });

        let queue = RequestQueue::new(Arc::new(mock), "test");
        let req = request("https://example.com/a");

        queue.add_request(&req, false).await.unwrap();
        // the second add never reaches the storage
        let info = queue.add_request(&req, false).await.unwrap();
        assert!(info.was_already_present);
        assert_eq!(info.request_id, "r1");
    }

    #[tokio::test]
    async fn test_head_refill_batches_storage_calls() {
        let mut mock = MockRequestQueueStorage::new();
        mock.expect_get_head()
            .times(1)
            .withf(|_, limit| *limit == QUERY_HEAD_MIN_LENGTH)
            .returning(|_, _| {
                Ok(QueueHead {
                    items: vec![
                        QueueHeadItem {
                            id: "r1".to_string(),
                            unique_key: "https://example.com/1".to_string(),
                        },
                        QueueHeadItem {
                            id: "r2".to_string(),
                            unique_key: "https://example.com/2".to_string(),
                        },
                    ],
                })
            });
        mock.expect_get_request().times(2).returning(|_, id| {
            let mut req = Request::new(&format!(
                "https://example.com/{}",
                id.trim_start_matches('r')
            ))
            .unwrap();
            req.id = Some(id.to_string());
            Ok(Some(req))
        });

        let queue = RequestQueue::new(Arc::new(mock), "test");
        // one get_head serves both fetches
        let first = queue.fetch_next_request().await.unwrap().unwrap();
        let second = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(first.id.as_deref(), Some("r1"));
        assert_eq!(second.id.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_forefront_add_is_fetched_next() {
        let queue = queue();
        queue
            .add_request(&request("https://example.com/old"), false)
            .await
            .unwrap();
        // warm the head cache so the forefront insert has to beat it
        assert!(!queue.is_empty().await.unwrap());

        queue
            .add_request(&request("https://example.com/urgent"), true)
            .await
            .unwrap();

        let next = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(next.unique_key, "https://example.com/urgent");
    }

    #[tokio::test]
    async fn test_reclaim_forefront_returns_request_next() {
        let queue = queue();
        queue
            .add_request(&request("https://example.com/1"), false)
            .await
            .unwrap();
        queue
            .add_request(&request("https://example.com/2"), false)
            .await
            .unwrap();

        let mut fetched = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(fetched.unique_key, "https://example.com/1");

        fetched.retry_count += 1;
        queue.reclaim_request(&fetched, true).await.unwrap();
        assert_eq!(queue.in_progress_count(), 0);

        // forefront reclaim beats /2
        let again = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(again.unique_key, "https://example.com/1");
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn test_reclaim_back_preserves_fifo() {
        let queue = queue();
        queue
            .add_request(&request("https://example.com/1"), false)
            .await
            .unwrap();
        queue
            .add_request(&request("https://example.com/2"), false)
            .await
            .unwrap();

        let fetched = queue.fetch_next_request().await.unwrap().unwrap();
        queue.reclaim_request(&fetched, false).await.unwrap();

        let next = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(next.unique_key, "https://example.com/2");
        let next = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(next.unique_key, "https://example.com/1");
    }

    #[tokio::test]
    async fn test_handled_request_never_re_emitted() {
        let storage = Arc::new(InMemoryRequestQueueStorage::new());
        let queue = RequestQueue::new(storage.clone(), "test");

        queue
            .add_request(&request("https://example.com/a"), false)
            .await
            .unwrap();
        let fetched = queue.fetch_next_request().await.unwrap().unwrap();
        queue.mark_request_handled(&fetched).await.unwrap();

        assert!(queue.fetch_next_request().await.unwrap().is_none());

        // a restarted client on the same storage sees it handled too
        let restarted = RequestQueue::new(storage, "test");
        assert!(restarted.fetch_next_request().await.unwrap().is_none());
        assert!(restarted.is_finished().await.unwrap());
    }

    #[tokio::test]
    async fn test_unfinished_request_survives_restart() {
        let storage = Arc::new(InMemoryRequestQueueStorage::new());
        let queue = RequestQueue::new(storage.clone(), "test");

        queue
            .add_request(&request("https://example.com/a"), false)
            .await
            .unwrap();
        // fetched but neither handled nor reclaimed: the client dies here
        let fetched = queue.fetch_next_request().await.unwrap().unwrap();

        let restarted = RequestQueue::new(storage, "test");
        let again = restarted.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(again.unique_key, fetched.unique_key);
    }

    #[tokio::test]
    async fn test_mark_handled_requires_fetch() {
        let queue = queue();
        let info = queue
            .add_request(&request("https://example.com/a"), false)
            .await
            .unwrap();

        let mut never_fetched = request("https://example.com/a");
        never_fetched.id = Some(info.request_id);
        assert!(queue.mark_request_handled(&never_fetched).await.is_err());

        let no_id = request("https://example.com/b");
        assert!(queue.mark_request_handled(&no_id).await.is_err());
    }

    #[tokio::test]
    async fn test_is_empty_confirms_with_storage() {
        let mut mock = MockRequestQueueStorage::new();
        // both is_empty calls must hit the storage while the local cache
        // is drained
        mock.expect_get_head()
            .times(2)
            .returning(|_, _| Ok(QueueHead::default()));

        let queue = RequestQueue::new(Arc::new(mock), "test");
        assert!(queue.is_empty().await.unwrap());
        assert!(queue.is_finished().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_purges_state() {
        let queue = queue();
        queue
            .add_request(&request("https://example.com/a"), false)
            .await
            .unwrap();
        queue.delete().await.unwrap();

        assert!(queue.fetch_next_request().await.unwrap().is_none());
        assert_eq!(queue.in_progress_count(), 0);
    }
}
