//! Static, ordered, deduplicated seed-request source
//!
//! A [`RequestList`] delivers a finite set of requests exactly once each,
//! modulo reclaims. Sources are either inline requests or remote text
//! documents from which URLs are extracted. The list lives in memory
//! only; its [`RequestListState`] snapshot makes a crawl resumable.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::utils::{default_url_regex, extract_urls};
use crate::{CrawlError, HttpMethod, Request};

/// One entry of the ordered source list.
#[derive(Debug, Clone)]
pub enum RequestListSource {
    /// An inline, fully formed request.
    Request(Request),
    /// A remote text document to extract request URLs from.
    RemoteUrl {
        requests_from_url: String,
        /// Extraction pattern; the default absolute-URL matcher when
        /// `None`.
        regex: Option<String>,
        /// Method assigned to every extracted request.
        method: Option<HttpMethod>,
    },
}

impl RequestListSource {
    /// Inline source from a plain URL.
    pub fn from_url(url: &str) -> Result<Self, CrawlError> {
        Ok(Self::Request(Request::new(url)?))
    }

    /// Remote document source with default extraction.
    pub fn remote(requests_from_url: &str) -> Self {
        Self::RemoteUrl {
            requests_from_url: requests_from_url.to_string(),
            regex: None,
            method: None,
        }
    }
}

/// Serializable snapshot of list progress for resumption.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequestListState {
    /// Next unvisited position.
    pub next_index: usize,
    /// Unique key expected at `next_index`; consistency check on restore.
    pub next_unique_key: Option<String>,
    /// Keys fetched but not handled when the state was taken.
    pub in_progress: HashSet<String>,
}

struct ListInner {
    requests: Vec<Request>,
    index_by_unique_key: HashMap<String, usize>,
    next_index: usize,
    in_progress: HashSet<String>,
    // fetched, released, awaiting re-fetch; FIFO
    reclaimed: VecDeque<String>,
}

/// Finite ordered request source with resumable iteration.
///
/// # Examples
///
/// ```rust,no_run
/// use crawl_runtime::{RequestList, RequestListSource};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), crawl_runtime::CrawlError> {
/// let list = RequestList::new(vec![
///     RequestListSource::from_url("https://example.com/1")?,
///     RequestListSource::from_url("https://example.com/2")?,
///     RequestListSource::remote("https://example.com/seeds.txt"),
/// ]);
/// list.initialize().await?;
///
/// while let Some(request) = list.fetch_next_request()? {
///     // process, then:
///     list.mark_request_handled(&request)?;
/// }
/// assert!(list.is_finished()?);
/// # Ok(())
/// # }
/// ```
pub struct RequestList {
    sources: Mutex<Option<Vec<RequestListSource>>>,
    persisted_state: Mutex<Option<RequestListState>>,
    inner: Mutex<ListInner>,
    is_initialized: AtomicBool,
    http: reqwest::Client,
}

impl RequestList {
    pub fn new(sources: Vec<RequestListSource>) -> Self {
        Self::with_state(sources, None)
    }

    /// Build a list that resumes from a previously persisted state once
    /// initialized.
    pub fn with_state(sources: Vec<RequestListSource>, state: Option<RequestListState>) -> Self {
        Self {
            sources: Mutex::new(Some(sources)),
            persisted_state: Mutex::new(state),
            inner: Mutex::new(ListInner {
                requests: Vec::new(),
                index_by_unique_key: HashMap::new(),
                next_index: 0,
                in_progress: HashSet::new(),
                reclaimed: VecDeque::new(),
            }),
            is_initialized: AtomicBool::new(false),
            http: reqwest::Client::new(),
        }
    }

    /// Resolve remote sources, flatten into one ordered deduplicated
    /// list, and restore persisted state when present.
    ///
    /// Remote documents are fetched concurrently but flattened in source
    /// order. Later requests with an already seen unique key are silently
    /// dropped (first occurrence wins).
    pub async fn initialize(&self) -> Result<(), CrawlError> {
        if self.is_initialized.load(Ordering::SeqCst) {
            warn!("RequestList already initialized");
            return Ok(());
        }

        let sources = {
            let mut sources = self.lock_sources()?;
            sources.take().unwrap_or_default()
        };

        // Fetch all remote documents concurrently, preserving source
        // order in the result.
        let resolved = futures::future::try_join_all(
            sources.into_iter().map(|source| self.resolve_source(source)),
        )
        .await?;

        let mut requests = Vec::new();
        let mut index_by_unique_key = HashMap::new();
        for request in resolved.into_iter().flatten() {
            if index_by_unique_key.contains_key(&request.unique_key) {
                debug!("Dropping duplicate request {}", request.unique_key);
                continue;
            }
            index_by_unique_key.insert(request.unique_key.clone(), requests.len());
            requests.push(request);
        }

        info!("RequestList initialized with {} requests", requests.len());

        let state = {
            let mut persisted = self
                .persisted_state
                .lock()
                .map_err(|e| CrawlError::Fatal(format!("state lock poisoned: {e}")))?;
            persisted.take()
        };

        {
            let mut inner = self.lock_inner()?;
            inner.requests = requests;
            inner.index_by_unique_key = index_by_unique_key;
            if let Some(state) = state {
                Self::restore_state(&mut inner, state)?;
            }
        }

        self.is_initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn restore_state(inner: &mut ListInner, state: RequestListState) -> Result<(), CrawlError> {
        if state.next_index > inner.requests.len() {
            return Err(CrawlError::InvalidArgument(format!(
                "persisted next_index {} is beyond the {} known requests",
                state.next_index,
                inner.requests.len()
            )));
        }

        let expected_key = inner
            .requests
            .get(state.next_index)
            .map(|r| r.unique_key.clone());
        if state.next_unique_key != expected_key {
            return Err(CrawlError::InvalidArgument(format!(
                "persisted state does not match the sources: expected {:?} at position {}, found {:?}",
                state.next_unique_key, state.next_index, expected_key
            )));
        }

        inner.next_index = state.next_index;

        // Everything in progress at persist time was fetched but never
        // handled; those requests must be re-emitted first.
        let mut reclaimed: Vec<String> = Vec::new();
        for key in state.in_progress {
            match inner.index_by_unique_key.get(&key) {
                Some(_) => reclaimed.push(key),
                None => warn!("Persisted in-progress key {key} is unknown, dropping"),
            }
        }
        // Deterministic re-emission order: original list position.
        reclaimed.sort_by_key(|key| inner.index_by_unique_key[key]);

        inner.in_progress = reclaimed.iter().cloned().collect();
        inner.reclaimed = reclaimed.into();

        Ok(())
    }

    async fn resolve_source(
        &self,
        source: RequestListSource,
    ) -> Result<Vec<Request>, CrawlError> {
        match source {
            RequestListSource::Request(request) => Ok(vec![request]),
            RequestListSource::RemoteUrl {
                requests_from_url,
                regex,
                method,
            } => {
                let pattern = match regex {
                    Some(raw) => Regex::new(&raw).map_err(|e| {
                        CrawlError::InvalidArgument(format!("invalid extraction regex: {e}"))
                    })?,
                    None => default_url_regex().clone(),
                };

                debug!("Fetching request source document {requests_from_url}");
                let body = self
                    .http
                    .get(&requests_from_url)
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(|e| CrawlError::Network(e.to_string()))?
                    .text()
                    .await?;

                let urls = extract_urls(&body, &pattern);
                info!(
                    "Extracted {} URLs from {requests_from_url}",
                    urls.len()
                );

                let mut requests = Vec::new();
                for url in urls {
                    match Request::new(&url) {
                        Ok(request) => requests.push(match method {
                            Some(method) => request.with_method(method),
                            None => request,
                        }),
                        Err(e) => warn!("Skipping extracted URL {url}: {e}"),
                    }
                }
                Ok(requests)
            }
        }
    }

    /// True iff no request is available right now.
    pub fn is_empty(&self) -> Result<bool, CrawlError> {
        self.ensure_initialized()?;
        let inner = self.lock_inner()?;
        Ok(inner.reclaimed.is_empty() && inner.next_index >= inner.requests.len())
    }

    /// True iff no request will ever be emitted again.
    pub fn is_finished(&self) -> Result<bool, CrawlError> {
        self.ensure_initialized()?;
        let inner = self.lock_inner()?;
        Ok(inner.in_progress.is_empty() && inner.next_index >= inner.requests.len())
    }

    /// Return the next request, preferring reclaimed requests (oldest
    /// first) over unvisited ones. `None` when the list is currently
    /// empty.
    pub fn fetch_next_request(&self) -> Result<Option<Request>, CrawlError> {
        self.ensure_initialized()?;
        let mut inner = self.lock_inner()?;

        if let Some(key) = inner.reclaimed.pop_front() {
            let index = inner.index_by_unique_key[&key];
            return Ok(Some(inner.requests[index].clone()));
        }

        if inner.next_index < inner.requests.len() {
            let request = inner.requests[inner.next_index].clone();
            inner.next_index += 1;
            inner.in_progress.insert(request.unique_key.clone());
            return Ok(Some(request));
        }

        Ok(None)
    }

    /// Remove a fetched request from tracking permanently.
    pub fn mark_request_handled(&self, request: &Request) -> Result<(), CrawlError> {
        self.ensure_initialized()?;
        let mut inner = self.lock_inner()?;

        if !inner.in_progress.remove(&request.unique_key) {
            return Err(CrawlError::InvalidArgument(format!(
                "cannot mark {} handled, it is not in progress",
                request.unique_key
            )));
        }
        inner.reclaimed.retain(|key| key != &request.unique_key);
        Ok(())
    }

    /// Release a fetched request for re-fetching; the next
    /// `fetch_next_request` returns reclaimed requests first.
    ///
    /// The passed request replaces the stored copy, so retry bookkeeping
    /// (`retry_count`, `error_messages`) accumulated between attempts
    /// survives the reclaim and comes back on the next fetch.
    pub fn reclaim_request(&self, request: &Request) -> Result<(), CrawlError> {
        self.ensure_initialized()?;
        let mut inner = self.lock_inner()?;

        if !inner.in_progress.contains(&request.unique_key) {
            return Err(CrawlError::InvalidArgument(format!(
                "cannot reclaim {}, it is not in progress",
                request.unique_key
            )));
        }

        let index = inner.index_by_unique_key[&request.unique_key];
        inner.requests[index] = request.clone();

        if !inner.reclaimed.contains(&request.unique_key) {
            inner.reclaimed.push_back(request.unique_key.clone());
        }
        Ok(())
    }

    /// Serializable snapshot for resumption.
    pub fn get_state(&self) -> Result<RequestListState, CrawlError> {
        self.ensure_initialized()?;
        let inner = self.lock_inner()?;
        Ok(RequestListState {
            next_index: inner.next_index,
            next_unique_key: inner
                .requests
                .get(inner.next_index)
                .map(|r| r.unique_key.clone()),
            in_progress: inner.in_progress.clone(),
        })
    }

    /// Total number of unique requests in the list.
    pub fn length(&self) -> Result<usize, CrawlError> {
        self.ensure_initialized()?;
        Ok(self.lock_inner()?.requests.len())
    }

    /// Number of requests that reached a terminal outcome.
    pub fn handled_count(&self) -> Result<usize, CrawlError> {
        self.ensure_initialized()?;
        let inner = self.lock_inner()?;
        Ok(inner.next_index.saturating_sub(inner.in_progress.len()))
    }

    fn ensure_initialized(&self) -> Result<(), CrawlError> {
        if !self.is_initialized.load(Ordering::SeqCst) {
            return Err(CrawlError::NotInitialized);
        }
        Ok(())
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, ListInner>, CrawlError> {
        self.inner
            .lock()
            .map_err(|e| CrawlError::Fatal(format!("list lock poisoned: {e}")))
    }

    fn lock_sources(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Option<Vec<RequestListSource>>>, CrawlError> {
        self.sources
            .lock()
            .map_err(|e| CrawlError::Fatal(format!("sources lock poisoned: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn sources(urls: &[&str]) -> Vec<RequestListSource> {
        urls.iter()
            .map(|url| RequestListSource::from_url(url).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let list = RequestList::new(sources(&["https://example.com/1"]));
        assert!(matches!(
            list.fetch_next_request(),
            Err(CrawlError::NotInitialized)
        ));
        assert!(matches!(list.is_empty(), Err(CrawlError::NotInitialized)));
        assert!(matches!(list.get_state(), Err(CrawlError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_emission_order_and_dedup() {
        let list = RequestList::new(sources(&[
            "https://example.com/1",
            "https://example.com/2",
            "https://example.com/1", // duplicate, dropped
            "https://example.com/2#fragment", // collapses onto /2
            "https://example.com/3",
        ]));
        list.initialize().await.unwrap();

        assert_eq!(list.length().unwrap(), 3);

        let mut seen = Vec::new();
        while let Some(request) = list.fetch_next_request().unwrap() {
            seen.push(request.url.clone());
            list.mark_request_handled(&request).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                "https://example.com/1",
                "https://example.com/2",
                "https://example.com/3",
            ]
        );
        assert!(list.is_finished().unwrap());
        assert_eq!(list.handled_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reclaim_is_fifo_and_returned_next() {
        let list = RequestList::new(sources(&[
            "https://example.com/1",
            "https://example.com/2",
            "https://example.com/3",
        ]));
        list.initialize().await.unwrap();

        let first = list.fetch_next_request().unwrap().unwrap();
        let second = list.fetch_next_request().unwrap().unwrap();
        list.reclaim_request(&first).unwrap();
        list.reclaim_request(&second).unwrap();

        // Reclaimed requests come back before /3, oldest reclaim first.
        let next = list.fetch_next_request().unwrap().unwrap();
        assert_eq!(next.unique_key, first.unique_key);
        let next = list.fetch_next_request().unwrap().unwrap();
        assert_eq!(next.unique_key, second.unique_key);
        let next = list.fetch_next_request().unwrap().unwrap();
        assert_eq!(next.url, "https://example.com/3");
    }

    #[tokio::test]
    async fn test_reclaim_persists_retry_bookkeeping() {
        let list = RequestList::new(sources(&["https://example.com/1"]));
        list.initialize().await.unwrap();

        let mut request = list.fetch_next_request().unwrap().unwrap();
        request.retry_count += 1;
        request.push_error_message("first failure");
        list.reclaim_request(&request).unwrap();

        // the re-fetch carries the accumulated retry state
        let again = list.fetch_next_request().unwrap().unwrap();
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.error_messages, vec!["first failure".to_string()]);

        // and it keeps accumulating across further reclaim cycles
        let mut again = again;
        again.retry_count += 1;
        again.push_error_message("second failure");
        list.reclaim_request(&again).unwrap();

        let third = list.fetch_next_request().unwrap().unwrap();
        assert_eq!(third.retry_count, 2);
        assert_eq!(third.error_messages.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_handled_requires_in_progress() {
        let list = RequestList::new(sources(&["https://example.com/1"]));
        list.initialize().await.unwrap();

        let stranger = Request::new("https://example.com/other").unwrap();
        assert!(list.mark_request_handled(&stranger).is_err());
        assert!(list.reclaim_request(&stranger).is_err());

        let request = list.fetch_next_request().unwrap().unwrap();
        list.mark_request_handled(&request).unwrap();
        // a second mark is rejected
        assert!(list.mark_request_handled(&request).is_err());
    }

    #[tokio::test]
    async fn test_is_empty_vs_is_finished() {
        let list = RequestList::new(sources(&["https://example.com/1"]));
        list.initialize().await.unwrap();

        let request = list.fetch_next_request().unwrap().unwrap();
        // nothing available right now, but the in-progress request may
        // still come back
        assert!(list.is_empty().unwrap());
        assert!(!list.is_finished().unwrap());

        list.reclaim_request(&request).unwrap();
        assert!(!list.is_empty().unwrap());

        let request = list.fetch_next_request().unwrap().unwrap();
        list.mark_request_handled(&request).unwrap();
        assert!(list.is_finished().unwrap());
    }

    #[tokio::test]
    async fn test_state_round_trip_resumes_emission() {
        let urls = [
            "https://example.com/1",
            "https://example.com/2",
            "https://example.com/3",
            "https://example.com/4",
        ];
        let list = RequestList::new(sources(&urls));
        list.initialize().await.unwrap();

        let first = list.fetch_next_request().unwrap().unwrap();
        let second = list.fetch_next_request().unwrap().unwrap();
        list.mark_request_handled(&first).unwrap();
        // `second` stays in progress

        let state = list.get_state().unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let restored_state: RequestListState = serde_json::from_str(&json).unwrap();

        let resumed = RequestList::with_state(sources(&urls), Some(restored_state));
        resumed.initialize().await.unwrap();

        // the unhandled in-progress request is re-emitted first
        let mut seen = Vec::new();
        while let Some(request) = resumed.fetch_next_request().unwrap() {
            seen.push(request.url.clone());
            resumed.mark_request_handled(&request).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                second.url.clone(),
                "https://example.com/3".to_string(),
                "https://example.com/4".to_string(),
            ]
        );
        assert!(resumed.is_finished().unwrap());
    }

    #[tokio::test]
    async fn test_inconsistent_state_rejected() {
        let list = RequestList::with_state(
            sources(&["https://example.com/1", "https://example.com/2"]),
            Some(RequestListState {
                next_index: 1,
                next_unique_key: Some("https://example.com/wrong".to_string()),
                in_progress: HashSet::new(),
            }),
        );
        assert!(matches!(
            list.initialize().await,
            Err(CrawlError::InvalidArgument(_))
        ));
    }

    /// Minimal one-shot HTTP server returning a canned body.
    async fn serve_once(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\ncontent-type: text/plain\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/seeds.txt")
    }

    #[tokio::test]
    async fn test_remote_source_extraction() {
        let url = serve_once(
            "https://example.com/a\nnoise here\n\"https://example.com/b\" https://example.com/a",
        )
        .await;

        let list = RequestList::new(vec![RequestListSource::RemoteUrl {
            requests_from_url: url,
            regex: None,
            method: None,
        }]);
        list.initialize().await.unwrap();

        assert_eq!(list.length().unwrap(), 2);
        let first = list.fetch_next_request().unwrap().unwrap();
        assert_eq!(first.url, "https://example.com/a");
        let second = list.fetch_next_request().unwrap().unwrap();
        assert_eq!(second.url, "https://example.com/b");
    }

    #[tokio::test]
    async fn test_remote_and_inline_sources_keep_source_order() {
        let url = serve_once("https://example.com/remote").await;

        let list = RequestList::new(vec![
            RequestListSource::from_url("https://example.com/inline-first").unwrap(),
            RequestListSource::RemoteUrl {
                requests_from_url: url,
                regex: None,
                method: None,
            },
            RequestListSource::from_url("https://example.com/inline-last").unwrap(),
        ]);
        list.initialize().await.unwrap();

        let mut seen = Vec::new();
        while let Some(request) = list.fetch_next_request().unwrap() {
            seen.push(request.url.clone());
            list.mark_request_handled(&request).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                "https://example.com/inline-first",
                "https://example.com/remote",
                "https://example.com/inline-last",
            ]
        );
    }
}
