//! Crawler driving request sources through the autoscaled pool
//!
//! [`BasicCrawler`] wires a [`RequestList`] and/or a [`RequestQueue`]
//! behind an [`AutoscaledPool`] by supplying the pool's three functions,
//! and implements per-request retry, failed-request reporting, and the
//! optional per-crawl request cap on top.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::utils::format_duration;
use crate::{
    AutoscaledPool, AutoscaledPoolOptions, CrawlError, CrawlerMetrics, EventBus, Request,
    RequestList, RequestListState, RequestQueue, RetryConfig, Snapshotter, SystemEvent,
    SystemStatus,
};

/// The view of a request a user handler receives.
pub struct CrawlingContext {
    pub request: Request,
}

/// Handed to the failed-request handler once a request is terminally
/// failed.
pub struct FailedRequestContext {
    pub request: Request,
    pub error: CrawlError,
}

pub type HandleRequestFn =
    Arc<dyn Fn(CrawlingContext) -> BoxFuture<'static, Result<(), CrawlError>> + Send + Sync>;
pub type HandleFailedRequestFn =
    Arc<dyn Fn(FailedRequestContext) -> BoxFuture<'static, ()> + Send + Sync>;
pub type PersistStateFn =
    Arc<dyn Fn(RequestListState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Tunables for [`BasicCrawler`].
#[derive(Debug, Clone)]
pub struct BasicCrawlerOptions {
    /// Processing retries per request before it fails terminally
    /// (default: 3)
    pub max_request_retries: u32,

    /// Soft cap on terminal outcomes for the whole crawl; the crawler
    /// reports finished once reached, without draining the sources.
    pub max_requests_per_crawl: Option<usize>,

    /// Deadline for one invocation of the request handler (default: 60
    /// seconds)
    pub handle_request_timeout: Duration,

    /// Options forwarded to the pool the crawler constructs.
    pub pool_options: AutoscaledPoolOptions,

    /// Backoff policy for transient source-bookkeeping failures.
    pub bookkeeping_retry: RetryConfig,
}

impl Default for BasicCrawlerOptions {
    fn default() -> Self {
        Self {
            max_request_retries: 3,
            max_requests_per_crawl: None,
            handle_request_timeout: Duration::from_secs(60),
            pool_options: AutoscaledPoolOptions::default(),
            bookkeeping_retry: RetryConfig::default(),
        }
    }
}

/// Final accounting of one crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlerStats {
    /// Requests with any terminal outcome.
    pub requests_handled: usize,
    /// Requests that succeeded.
    pub requests_finished: usize,
    /// Requests that exhausted their retries (or were `no_retry`).
    pub requests_failed: usize,
    /// Total retry attempts across all requests.
    pub retries: usize,
    pub elapsed: Duration,
}

/// Generic crawler over a static list and/or a dynamic queue.
///
/// When both sources are configured, each list request is first enqueued
/// to the queue with forefront priority and then processed from there, so
/// retries live in the durable store.
///
/// # Examples
///
/// ```rust
/// use crawl_runtime::{
///     BasicCrawler, BasicCrawlerOptions, RequestList, RequestListSource,
/// };
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), crawl_runtime::CrawlError> {
/// let list = Arc::new(RequestList::new(vec![
///     RequestListSource::from_url("https://example.com")?,
/// ]));
///
/// let crawler = Arc::new(BasicCrawler::new(
///     BasicCrawlerOptions::default(),
///     Some(list),
///     None,
///     Arc::new(|context| {
///         Box::pin(async move {
///             println!("crawling {}", context.request.url);
///             Ok(())
///         })
///     }),
///     None,
/// )?);
///
/// let stats = crawler.run().await?;
/// assert_eq!(stats.requests_finished, 1);
/// # Ok(())
/// # }
/// ```
pub struct BasicCrawler {
    options: BasicCrawlerOptions,
    request_list: Option<Arc<RequestList>>,
    request_queue: Option<Arc<RequestQueue>>,
    handle_request: HandleRequestFn,
    handle_failed_request: Option<HandleFailedRequestFn>,
    event_bus: Option<Arc<EventBus>>,
    persist_state: Option<PersistStateFn>,
    pool: std::sync::Mutex<Option<Arc<AutoscaledPool>>>,
    handled_count: AtomicUsize,
    finished_count: AtomicUsize,
    failed_count: AtomicUsize,
    retry_count: AtomicUsize,
    metrics: CrawlerMetrics,
}

impl BasicCrawler {
    pub fn new(
        options: BasicCrawlerOptions,
        request_list: Option<Arc<RequestList>>,
        request_queue: Option<Arc<RequestQueue>>,
        handle_request: HandleRequestFn,
        handle_failed_request: Option<HandleFailedRequestFn>,
    ) -> Result<Self, CrawlError> {
        if request_list.is_none() && request_queue.is_none() {
            return Err(CrawlError::InvalidArgument(
                "at least one of request_list and request_queue is required".to_string(),
            ));
        }
        options.pool_options.validate()?;

        Ok(Self {
            options,
            request_list,
            request_queue,
            handle_request,
            handle_failed_request,
            event_bus: None,
            persist_state: None,
            pool: std::sync::Mutex::new(None),
            handled_count: AtomicUsize::new(0),
            finished_count: AtomicUsize::new(0),
            failed_count: AtomicUsize::new(0),
            retry_count: AtomicUsize::new(0),
            metrics: CrawlerMetrics::new(),
        })
    }

    /// Attach a system-event channel; the pool's snapshotter then runs
    /// its CPU dimension in platform mode.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Save request-list progress through this callback on every
    /// persist-state event. Requires an attached event bus and a request
    /// list to have any effect.
    pub fn with_persist_state_handler(mut self, handler: PersistStateFn) -> Self {
        self.persist_state = Some(handler);
        self
    }

    /// Run the crawl to completion and return the final accounting.
    pub async fn run(self: &Arc<Self>) -> Result<CrawlerStats, CrawlError> {
        let start = Instant::now();

        if let Some(list) = &self.request_list {
            list.initialize().await?;
        }

        let pool = Arc::new(self.build_pool()?);
        {
            let mut slot = self
                .pool
                .lock()
                .map_err(|e| CrawlError::Fatal(format!("pool slot lock poisoned: {e}")))?;
            *slot = Some(pool.clone());
        }

        info!(
            "BasicCrawler starting (list: {}, queue: {})",
            self.request_list.is_some(),
            self.request_queue.is_some()
        );

        let persist_listener = self.spawn_persist_listener();

        let result = pool.run().await;

        if let Some(listener) = persist_listener {
            listener.abort();
        }

        let stats = CrawlerStats {
            requests_handled: self.handled_count.load(Ordering::SeqCst),
            requests_finished: self.finished_count.load(Ordering::SeqCst),
            requests_failed: self.failed_count.load(Ordering::SeqCst),
            retries: self.retry_count.load(Ordering::SeqCst),
            elapsed: start.elapsed(),
        };

        match &result {
            Ok(()) => info!(
                "Crawl finished in {}: {} handled, {} failed, {} retries",
                format_duration(stats.elapsed),
                stats.requests_handled,
                stats.requests_failed,
                stats.retries
            ),
            Err(e) => warn!(
                "Crawl did not complete after {}: {e}",
                format_duration(stats.elapsed)
            ),
        }

        result.map(|()| stats)
    }

    /// Forward to the pool: stop accepting work, settle in-flight tasks.
    pub async fn abort(&self) {
        if let Some(pool) = self.current_pool() {
            pool.abort().await;
        }
    }

    pub fn pause(&self) {
        if let Some(pool) = self.current_pool() {
            pool.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(pool) = self.current_pool() {
            pool.resume();
        }
    }

    /// Requests with a terminal outcome so far.
    pub fn handled_requests_count(&self) -> usize {
        self.handled_count.load(Ordering::SeqCst)
    }

    fn current_pool(&self) -> Option<Arc<AutoscaledPool>> {
        self.pool.lock().ok().and_then(|slot| slot.clone())
    }

    /// Persist list progress on every persist-state event from the bus.
    fn spawn_persist_listener(&self) -> Option<tokio::task::JoinHandle<()>> {
        let list = self.request_list.clone()?;
        let persist = self.persist_state.clone()?;
        let mut events = self.event_bus.as_ref()?.subscribe();

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SystemEvent::PersistState) => match list.get_state() {
                        Ok(state) => persist(state).await,
                        Err(error) => warn!("Could not snapshot list state: {error}"),
                    },
                    Ok(SystemEvent::Shutdown) => break,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    fn build_pool(self: &Arc<Self>) -> Result<AutoscaledPool, CrawlError> {
        let pool_options = self.options.pool_options.clone();

        // The snapshotter reads rate-limit pressure from the queue's
        // storage client when there is one.
        let client_stats = self
            .request_queue
            .as_ref()
            .map(|queue| queue.storage().clone());
        let snapshotter = Arc::new(Snapshotter::with_collaborators(
            pool_options.snapshotter_options.clone(),
            client_stats,
            self.event_bus.clone(),
        ));
        let system_status = Arc::new(SystemStatus::new(
            snapshotter.clone(),
            pool_options.system_status_options.clone(),
        ));

        let run_task: crate::RunTaskFn = {
            let crawler = self.clone();
            Arc::new(move || {
                let crawler = crawler.clone();
                Box::pin(async move { crawler.run_task().await })
            })
        };
        let is_task_ready: crate::IsTaskReadyFn = {
            let crawler = self.clone();
            Arc::new(move || {
                let crawler = crawler.clone();
                Box::pin(async move { crawler.is_task_ready().await })
            })
        };
        let is_finished: crate::IsFinishedFn = {
            let crawler = self.clone();
            Arc::new(move || {
                let crawler = crawler.clone();
                Box::pin(async move { crawler.is_finished().await })
            })
        };

        AutoscaledPool::with_system(
            pool_options,
            snapshotter,
            system_status,
            run_task,
            is_task_ready,
            is_finished,
        )
    }

    fn cap_reached(&self) -> bool {
        match self.options.max_requests_per_crawl {
            Some(cap) => self.handled_count.load(Ordering::SeqCst) >= cap,
            None => false,
        }
    }

    async fn is_task_ready(&self) -> Result<bool, CrawlError> {
        if self.cap_reached() {
            return Ok(false);
        }
        if let Some(list) = &self.request_list {
            if !list.is_empty()? {
                return Ok(true);
            }
        }
        if let Some(queue) = &self.request_queue {
            if !queue.is_empty().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn is_finished(&self) -> Result<bool, CrawlError> {
        if self.cap_reached() {
            debug!("Request cap reached, reporting the crawl finished");
            return Ok(true);
        }
        if let Some(list) = &self.request_list {
            if !list.is_finished()? {
                return Ok(false);
            }
        }
        if let Some(queue) = &self.request_queue {
            if !queue.is_finished().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One pool task: fetch, invoke the handler under its deadline, then
    /// settle the outcome against the owning source.
    async fn run_task(self: Arc<Self>) -> Result<Option<()>, CrawlError> {
        let Some(request) = self.fetch_next_request().await? else {
            return Ok(None);
        };

        let started = Instant::now();
        let context = CrawlingContext {
            request: request.clone(),
        };

        let outcome = match timeout(
            self.options.handle_request_timeout,
            (self.handle_request)(context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CrawlError::TaskTimeout(self.options.handle_request_timeout)),
        };
        let duration = started.elapsed();

        match outcome {
            Ok(()) => {
                self.mark_terminal(&request).await?;
                self.finished_count.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_request(duration, true);
                debug!("Request {} succeeded", request.unique_key);
            }
            Err(error) => {
                self.handle_request_failure(request, error, duration).await?;
            }
        }

        if let Some(queue) = &self.request_queue {
            self.metrics.record_queue_in_progress(queue.in_progress_count());
        }

        Ok(Some(()))
    }

    /// Pick the next request, funneling list requests through the queue
    /// when both sources exist so retries live in the durable store.
    async fn fetch_next_request(&self) -> Result<Option<Request>, CrawlError> {
        match (&self.request_list, &self.request_queue) {
            (Some(list), Some(queue)) => {
                let from_list = if list.is_empty()? {
                    None
                } else {
                    list.fetch_next_request()?
                };

                match from_list {
                    Some(request) => {
                        match self
                            .with_bookkeeping_retry("enqueueing list request", || {
                                queue.add_request(&request, true)
                            })
                            .await
                        {
                            Ok(_) => {
                                // The queue owns it from here on.
                                list.mark_request_handled(&request)?;
                                queue.fetch_next_request().await
                            }
                            Err(error) => {
                                list.reclaim_request(&request)?;
                                Err(error)
                            }
                        }
                    }
                    None => queue.fetch_next_request().await,
                }
            }
            (Some(list), None) => list.fetch_next_request(),
            (None, Some(queue)) => queue.fetch_next_request().await,
            (None, None) => Ok(None),
        }
    }

    async fn handle_request_failure(
        &self,
        mut request: Request,
        error: CrawlError,
        duration: Duration,
    ) -> Result<(), CrawlError> {
        request.push_error_message(error.to_string());

        let terminal =
            request.no_retry || request.retry_count >= self.options.max_request_retries;

        if terminal {
            warn!(
                "Request {} failed terminally after {} retries: {error}",
                request.unique_key, request.retry_count
            );
            self.metrics.record_request(duration, false);

            // Report every terminal failure, including first-failure
            // no-retry requests.
            if let Some(handler) = &self.handle_failed_request {
                handler(FailedRequestContext {
                    request: request.clone(),
                    error,
                })
                .await;
            }

            self.mark_terminal(&request).await?;
            self.failed_count.fetch_add(1, Ordering::SeqCst);
        } else {
            request.retry_count += 1;
            self.retry_count.fetch_add(1, Ordering::SeqCst);
            self.metrics.record_retry();
            debug!(
                "Reclaiming request {} for retry {}/{}: {error}",
                request.unique_key, request.retry_count, self.options.max_request_retries
            );

            match &self.request_queue {
                Some(queue) => {
                    self.with_bookkeeping_retry("reclaiming request", || {
                        queue.reclaim_request(&request, false)
                    })
                    .await?;
                }
                None => {
                    if let Some(list) = &self.request_list {
                        list.reclaim_request(&request)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Mark a terminal outcome in whichever source owns the request and
    /// bump the crawl-wide counter.
    async fn mark_terminal(&self, request: &Request) -> Result<(), CrawlError> {
        match &self.request_queue {
            Some(queue) => {
                self.with_bookkeeping_retry("marking request handled", || {
                    queue.mark_request_handled(request)
                })
                .await?;
            }
            None => {
                if let Some(list) = &self.request_list {
                    list.mark_request_handled(request)?;
                }
            }
        }
        self.handled_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Retry a transient bookkeeping failure with backoff before
    /// escalating it as fatal.
    async fn with_bookkeeping_retry<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> Result<T, CrawlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CrawlError>>,
    {
        let retry = &self.options.bookkeeping_retry;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt + 1 < retry.max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!("{operation} failed ({error}), retrying in {delay:?}");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(CrawlError::Fatal(format!(
                        "{operation} failed after {} attempts: {error}",
                        attempt + 1
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryRequestQueueStorage, RequestListSource};
    use std::sync::Mutex;

    fn noop_handler() -> HandleRequestFn {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    fn list_of(urls: &[&str]) -> Arc<RequestList> {
        Arc::new(RequestList::new(
            urls.iter()
                .map(|url| RequestListSource::from_url(url).unwrap())
                .collect(),
        ))
    }

    fn fast_options() -> BasicCrawlerOptions {
        BasicCrawlerOptions {
            pool_options: AutoscaledPoolOptions {
                maybe_run_interval: Duration::from_millis(10),
                autoscale_interval: Duration::from_millis(100),
                logging_interval: None,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_at_least_one_source() {
        let result = BasicCrawler::new(
            BasicCrawlerOptions::default(),
            None,
            None,
            noop_handler(),
            None,
        );
        assert!(matches!(result, Err(CrawlError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_list_only_crawl() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let handler: HandleRequestFn = {
            let visited = visited.clone();
            Arc::new(move |context| {
                let visited = visited.clone();
                Box::pin(async move {
                    visited.lock().unwrap().push(context.request.url.clone());
                    Ok(())
                })
            })
        };

        let crawler = Arc::new(
            BasicCrawler::new(
                fast_options(),
                Some(list_of(&["https://example.com/1", "https://example.com/2"])),
                None,
                handler,
                None,
            )
            .unwrap(),
        );

        let stats = crawler.run().await.unwrap();
        assert_eq!(stats.requests_finished, 2);
        assert_eq!(stats.requests_failed, 0);
        assert_eq!(stats.requests_handled, 2);
        assert_eq!(
            *visited.lock().unwrap(),
            vec!["https://example.com/1", "https://example.com/2"]
        );
    }

    #[tokio::test]
    async fn test_queue_only_crawl() {
        let storage = Arc::new(InMemoryRequestQueueStorage::new());
        let queue = Arc::new(RequestQueue::new(storage, "crawl"));
        queue
            .add_request(&Request::new("https://example.com/a").unwrap(), false)
            .await
            .unwrap();

        let crawler = Arc::new(
            BasicCrawler::new(fast_options(), None, Some(queue.clone()), noop_handler(), None)
                .unwrap(),
        );

        let stats = crawler.run().await.unwrap();
        assert_eq!(stats.requests_finished, 1);
        assert_eq!(queue.handled_count(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_fails_terminally_on_first_failure() {
        let failed: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));
        let handler: HandleRequestFn =
            Arc::new(|_| Box::pin(async { Err(CrawlError::Handler("always fails".to_string())) }));
        let failed_handler: HandleFailedRequestFn = {
            let failed = failed.clone();
            Arc::new(move |context| {
                let failed = failed.clone();
                Box::pin(async move {
                    failed.lock().unwrap().push(context.request);
                })
            })
        };

        let list = Arc::new(RequestList::new(vec![RequestListSource::Request(
            Request::new("https://example.com/poison")
                .unwrap()
                .with_no_retry(true),
        )]));

        let crawler = Arc::new(
            BasicCrawler::new(fast_options(), Some(list), None, handler, Some(failed_handler))
                .unwrap(),
        );

        let stats = crawler.run().await.unwrap();
        assert_eq!(stats.requests_failed, 1);
        assert_eq!(stats.retries, 0);

        let failed = failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 0);
        assert_eq!(failed[0].error_messages.len(), 1);
    }

    #[tokio::test]
    async fn test_request_cap_stops_crawl_early() {
        let options = BasicCrawlerOptions {
            max_requests_per_crawl: Some(3),
            ..fast_options()
        };
        let crawler = Arc::new(
            BasicCrawler::new(
                options,
                Some(list_of(&[
                    "https://example.com/1",
                    "https://example.com/2",
                    "https://example.com/3",
                    "https://example.com/4",
                    "https://example.com/5",
                ])),
                None,
                noop_handler(),
                None,
            )
            .unwrap(),
        );

        let stats = crawler.run().await.unwrap();
        assert_eq!(stats.requests_handled, 3);
        assert_eq!(crawler.handled_requests_count(), 3);
    }

    #[tokio::test]
    async fn test_persist_state_events_snapshot_list_progress() {
        let bus = Arc::new(EventBus::new());
        bus.start_persist_emitter(Duration::from_millis(15));

        let states: Arc<Mutex<Vec<crate::RequestListState>>> = Arc::new(Mutex::new(Vec::new()));
        let persist: PersistStateFn = {
            let states = states.clone();
            Arc::new(move |state| {
                let states = states.clone();
                Box::pin(async move {
                    states.lock().unwrap().push(state);
                })
            })
        };

        let handler: HandleRequestFn = Arc::new(|_| {
            Box::pin(async {
                sleep(Duration::from_millis(20)).await;
                Ok(())
            })
        });

        let crawler = Arc::new(
            BasicCrawler::new(
                fast_options(),
                Some(list_of(&[
                    "https://example.com/1",
                    "https://example.com/2",
                    "https://example.com/3",
                    "https://example.com/4",
                    "https://example.com/5",
                ])),
                None,
                handler,
                None,
            )
            .unwrap()
            .with_event_bus(bus.clone())
            .with_persist_state_handler(persist),
        );

        let stats = crawler.run().await.unwrap();
        assert_eq!(stats.requests_finished, 5);

        let states = states.lock().unwrap();
        assert!(!states.is_empty(), "progress persisted during the crawl");
        // snapshots advance monotonically through the list
        for pair in states.windows(2) {
            assert!(pair[0].next_index <= pair[1].next_index);
        }

        bus.shutdown();
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_failure() {
        let options = BasicCrawlerOptions {
            handle_request_timeout: Duration::from_millis(20),
            max_request_retries: 1,
            ..fast_options()
        };
        let handler: HandleRequestFn = Arc::new(|_| {
            Box::pin(async {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            })
        });

        let crawler = Arc::new(
            BasicCrawler::new(
                options,
                Some(list_of(&["https://example.com/slow"])),
                None,
                handler,
                None,
            )
            .unwrap(),
        );

        let stats = crawler.run().await.unwrap();
        assert_eq!(stats.requests_failed, 1);
        // one original attempt plus one retry, both timed out
        assert_eq!(stats.retries, 1);
    }
}
