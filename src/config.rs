//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the crawling
//! runtime: snapshotting intervals and overload thresholds, system-status
//! aggregation windows, autoscaling behavior, and crawler retry policy.

use crate::CrawlError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the [`Snapshotter`](crate::Snapshotter)
///
/// Controls how often each of the four load dimensions is sampled, the
/// thresholds above which a sample is marked overloaded, and how much
/// history is retained.
///
/// # Examples
///
/// ```rust
/// use crawl_runtime::SnapshotterOptions;
/// use std::time::Duration;
///
/// let options = SnapshotterOptions {
///     max_used_memory_ratio: 0.9,
///     snapshot_history: Duration::from_secs(60),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotterOptions {
    /// Interval between event-loop lag samples (default: 500 ms)
    pub event_loop_snapshot_interval: Duration,

    /// Interval between memory samples (default: 1 second)
    pub memory_snapshot_interval: Duration,

    /// Interval between CPU samples in local mode (default: 1 second)
    ///
    /// Ignored when a system-event channel is attached; in that mode CPU
    /// samples arrive as externally emitted system-info events.
    pub cpu_snapshot_interval: Duration,

    /// Interval between storage-client error samples (default: 1 second)
    pub client_snapshot_interval: Duration,

    /// Tolerated scheduler lag beyond the sampling interval (default: 50 ms)
    ///
    /// An event-loop sample is overloaded when the measured tick arrives
    /// more than this much later than scheduled.
    pub max_blocked: Duration,

    /// Memory overload threshold as a fraction of `max_memory_bytes`
    /// (default: 0.7)
    pub max_used_memory_ratio: f64,

    /// CPU overload threshold as a fraction of total core time
    /// (default: 0.95)
    pub max_used_cpu_ratio: f64,

    /// Rate-limit errors tolerated per client sample before the sample is
    /// marked overloaded (default: 1)
    pub max_client_errors: u64,

    /// How much sample history to retain per dimension (default: 30 seconds)
    ///
    /// Older samples are evicted on every sampling tick.
    pub snapshot_history: Duration,

    /// Memory ceiling the used-memory ratio is measured against
    /// (default: auto-detected from the host)
    pub max_memory_bytes: Option<u64>,
}

impl Default for SnapshotterOptions {
    fn default() -> Self {
        Self {
            event_loop_snapshot_interval: Duration::from_millis(500),
            memory_snapshot_interval: Duration::from_secs(1),
            cpu_snapshot_interval: Duration::from_secs(1),
            client_snapshot_interval: Duration::from_secs(1),
            max_blocked: Duration::from_millis(50),
            max_used_memory_ratio: 0.7,
            max_used_cpu_ratio: 0.95,
            max_client_errors: 1,
            snapshot_history: Duration::from_secs(30),
            max_memory_bytes: None,
        }
    }
}

/// Configuration for [`SystemStatus`](crate::SystemStatus) aggregation
///
/// Each dimension is judged overloaded when the fraction of overloaded
/// samples within the evaluated window exceeds its ratio here.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemStatusOptions {
    /// Window used by `get_current_status()` (default: 5 seconds)
    ///
    /// `get_historical_status()` always evaluates the full retained
    /// history instead.
    pub current_history: Duration,

    /// Tolerated fraction of overloaded event-loop samples (default: 0.6)
    pub max_event_loop_overloaded_ratio: f64,

    /// Tolerated fraction of overloaded memory samples (default: 0.2)
    pub max_memory_overloaded_ratio: f64,

    /// Tolerated fraction of overloaded CPU samples (default: 0.4)
    pub max_cpu_overloaded_ratio: f64,

    /// Tolerated fraction of overloaded client samples (default: 0.3)
    pub max_client_overloaded_ratio: f64,
}

impl Default for SystemStatusOptions {
    fn default() -> Self {
        Self {
            current_history: Duration::from_secs(5),
            max_event_loop_overloaded_ratio: 0.6,
            max_memory_overloaded_ratio: 0.2,
            max_cpu_overloaded_ratio: 0.4,
            max_client_overloaded_ratio: 0.3,
        }
    }
}

/// Configuration for the [`AutoscaledPool`](crate::AutoscaledPool)
///
/// Controls the concurrency envelope, scaling step sizes, and the cadence
/// of the dispatch and autoscale loops.
///
/// # Examples
///
/// ```rust
/// use crawl_runtime::AutoscaledPoolOptions;
///
/// let options = AutoscaledPoolOptions {
///     min_concurrency: 5,
///     max_concurrency: 50,
///     ..Default::default()
/// };
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoscaledPoolOptions {
    /// Lower bound on desired concurrency (default: 1)
    pub min_concurrency: usize,

    /// Upper bound on desired concurrency (default: 1000)
    pub max_concurrency: usize,

    /// Utilization floor required before scaling up (default: 0.90)
    ///
    /// The pool only grows when `current_concurrency` has reached this
    /// fraction of `desired_concurrency`, preventing runaway growth while
    /// upstream work is starved.
    pub desired_concurrency_ratio: f64,

    /// Fractional step applied on scale-up (default: 0.05)
    pub scale_up_step_ratio: f64,

    /// Fractional step applied on scale-down (default: 0.05)
    pub scale_down_step_ratio: f64,

    /// Cadence of the slot-filling dispatch loop (default: 500 ms)
    ///
    /// Dispatch additionally re-fires immediately whenever a task
    /// finishes.
    pub maybe_run_interval: Duration,

    /// Cadence of the scale-up/scale-down decision (default: 10 seconds)
    pub autoscale_interval: Duration,

    /// Cadence of the periodic state log line (default: 60 seconds)
    ///
    /// `None` disables periodic logging entirely.
    pub logging_interval: Option<Duration>,

    /// Snapshotter settings for the pool-owned load sensor
    pub snapshotter_options: SnapshotterOptions,

    /// Aggregation settings for the pool-owned system status
    pub system_status_options: SystemStatusOptions,
}

impl Default for AutoscaledPoolOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 1000,
            desired_concurrency_ratio: 0.90,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval: Duration::from_millis(500),
            autoscale_interval: Duration::from_secs(10),
            logging_interval: Some(Duration::from_secs(60)),
            snapshotter_options: SnapshotterOptions::default(),
            system_status_options: SystemStatusOptions::default(),
        }
    }
}

impl AutoscaledPoolOptions {
    /// Reject option combinations the pool cannot run with.
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.min_concurrency == 0 {
            return Err(CrawlError::InvalidArgument(
                "min_concurrency must be at least 1".to_string(),
            ));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(CrawlError::InvalidArgument(format!(
                "min_concurrency ({}) must not exceed max_concurrency ({})",
                self.min_concurrency, self.max_concurrency
            )));
        }
        if !(0.0..=1.0).contains(&self.desired_concurrency_ratio)
            || self.desired_concurrency_ratio == 0.0
        {
            return Err(CrawlError::InvalidArgument(
                "desired_concurrency_ratio must be in (0, 1]".to_string(),
            ));
        }
        if self.scale_up_step_ratio <= 0.0 || self.scale_down_step_ratio <= 0.0 {
            return Err(CrawlError::InvalidArgument(
                "scale step ratios must be positive".to_string(),
            ));
        }
        if self.maybe_run_interval.is_zero() || self.autoscale_interval.is_zero() {
            return Err(CrawlError::InvalidArgument(
                "loop intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for transient bookkeeping failures
///
/// Used by the crawler when a source operation (mark handled, reclaim,
/// enqueue) fails transiently: the call is retried with exponential
/// backoff before the failure is escalated.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before the given zero-based attempt, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}
