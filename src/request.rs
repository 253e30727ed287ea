//! Request model shared by every request source
//!
//! A [`Request`] describes one unit of crawling work. Its `unique_key` is
//! the deduplication identity used by both the request list and the
//! request queue; by default it is the normalized URL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{normalize_url, CrawlError};

/// HTTP method carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
        };
        write!(f, "{name}")
    }
}

/// A single crawling request.
///
/// The user handler only ever sees a request through a shared reference;
/// retry bookkeeping (`retry_count`, `error_messages`) is maintained by
/// the crawler on its own owned copy between attempts.
///
/// # Examples
///
/// ```rust
/// use crawl_runtime::Request;
///
/// let request = Request::new("https://example.com/page#intro").unwrap();
/// // Fragments never participate in deduplication
/// assert_eq!(request.unique_key, "https://example.com/page");
/// assert_eq!(request.retry_count, 0);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    /// Opaque identifier assigned by the queue storage; absent for
    /// requests that only ever lived in a request list.
    #[serde(default)]
    pub id: Option<String>,

    /// The URL to crawl, in normalized form.
    pub url: String,

    /// Deduplication identity; defaults to the normalized URL.
    pub unique_key: String,

    #[serde(default)]
    pub method: HttpMethod,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body for non-GET methods.
    #[serde(default)]
    pub payload: Option<String>,

    /// Arbitrary user-attached data carried with the request.
    #[serde(default)]
    pub user_data: HashMap<String, serde_json::Value>,

    /// Number of processing retries performed so far. Monotonically
    /// non-decreasing.
    #[serde(default)]
    pub retry_count: u32,

    /// One entry per failed processing attempt, oldest first.
    #[serde(default)]
    pub error_messages: Vec<String>,

    /// When true the request is never retried; its first failure is
    /// terminal.
    #[serde(default)]
    pub no_retry: bool,

    /// Set when the request reached a terminal outcome.
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Build a request from a URL, normalizing it and deriving the
    /// default unique key.
    pub fn new(url: &str) -> Result<Self, CrawlError> {
        let normalized = normalize_url(url)?;
        Ok(Self {
            id: None,
            url: normalized.clone(),
            unique_key: normalized,
            method: HttpMethod::Get,
            headers: HashMap::new(),
            payload: None,
            user_data: HashMap::new(),
            retry_count: 0,
            error_messages: Vec::new(),
            no_retry: false,
            handled_at: None,
        })
    }

    /// Build a request with a caller-chosen unique key instead of the
    /// normalized URL.
    pub fn with_unique_key(url: &str, unique_key: &str) -> Result<Self, CrawlError> {
        if unique_key.trim().is_empty() {
            return Err(CrawlError::InvalidArgument(
                "unique_key must be non-empty".to_string(),
            ));
        }
        let mut request = Self::new(url)?;
        request.unique_key = unique_key.to_string();
        Ok(request)
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    pub fn with_user_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.user_data.insert(key.to_string(), value);
        self
    }

    /// Record one failed processing attempt.
    pub fn push_error_message(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }

    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }
}
