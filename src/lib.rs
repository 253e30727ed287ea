//! # Crawl Runtime
//!
//! The core of a general-purpose web-crawling runtime: an autoscaled
//! worker pool that continuously sizes its parallelism to system load,
//! and a crawling pipeline driven by it — a static [`RequestList`], a
//! durable deduplicated [`RequestQueue`], and a [`BasicCrawler`] with
//! per-request retry and failure semantics.
//!
//! ## Architecture
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Snapshotter`] | samples CPU, memory, scheduler lag, and client errors into bounded histories |
//! | [`SystemStatus`] | collapses recent samples into "is the system idle" judgements |
//! | [`AutoscaledPool`] | fills worker slots while ready, grows and shrinks `desired_concurrency` |
//! | [`RequestList`] | finite ordered deduplicated seeds with resumable state |
//! | [`RequestQueue`] | unbounded deduplicated queue over external storage with a local head cache |
//! | [`BasicCrawler`] | wires both sources behind the pool with retry/failure handling |
//!
//! The pool consults [`SystemStatus`] on every autoscale tick: while the
//! system has been OK lately and the pool is actually using the slots it
//! already has, desired concurrency grows by a fractional step; any
//! overloaded dimension shrinks it. Worker slots are filled on every
//! dispatch tick and whenever a task settles.
//!
//! ## Processing guarantees
//!
//! - At-least-once: a fetched request is re-emitted (reclaimed) unless it
//!   is explicitly marked handled.
//! - Deduplication by `unique_key` in both sources; the queue
//!   additionally short-circuits duplicate inserts through a local cache.
//! - Per-request retries up to `max_request_retries`, then a single
//!   terminal report through the failed-request handler. Handler errors
//!   never tear down the pool.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crawl_runtime::{
//!     BasicCrawler, BasicCrawlerOptions, InMemoryRequestQueueStorage, Request,
//!     RequestQueue,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), crawl_runtime::CrawlError> {
//!     let storage = Arc::new(InMemoryRequestQueueStorage::new());
//!     let queue = Arc::new(RequestQueue::new(storage, "my-crawl"));
//!     queue.add_request(&Request::new("https://example.com")?, false).await?;
//!
//!     let crawler = Arc::new(BasicCrawler::new(
//!         BasicCrawlerOptions::default(),
//!         None,
//!         Some(queue.clone()),
//!         Arc::new(move |context| {
//!             let queue = queue.clone();
//!             Box::pin(async move {
//!                 println!("crawling {}", context.request.url);
//!                 // discovered links go back into the queue
//!                 queue
//!                     .add_request(&Request::new("https://example.com/about")?, false)
//!                     .await?;
//!                 Ok(())
//!             })
//!         }),
//!         None,
//!     )?);
//!
//!     let stats = crawler.run().await?;
//!     println!("handled {} requests", stats.requests_handled);
//!     Ok(())
//! }
//! ```

/// Configuration structures for the pool, sampler, and crawler
pub mod config;

/// Error types and retryability classification
pub mod error;

/// The request model and unique-key derivation
pub mod request;

/// Typed system-event channel (system info, persist state, shutdown)
pub mod events;

/// Periodic load sampling across four dimensions
pub mod snapshotter;

/// Aggregation of samples into idle/overloaded judgements
pub mod system_status;

/// The autoscaled worker pool
pub mod autoscaled_pool;

/// Static ordered seed-request source
pub mod request_list;

/// Storage trait behind the request queue plus in-memory implementation
pub mod storage;

/// Dynamic deduplicated work queue
pub mod request_queue;

/// Crawler driving the sources through the pool
pub mod basic_crawler;

/// Metric handles and Prometheus exporter scaffolding
pub mod metrics;

/// URL, host-reading, and formatting helpers
pub mod utils;


pub use autoscaled_pool::*;
pub use basic_crawler::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use metrics::*;
pub use request::*;
pub use request_list::*;
pub use request_queue::*;
pub use snapshotter::*;
pub use storage::*;
pub use system_status::*;
pub use utils::*;
