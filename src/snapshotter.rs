//! Load sampling across four system dimensions
//!
//! The snapshotter periodically samples CPU, memory, scheduler lag, and
//! storage-client error pressure, marks each sample overloaded or OK, and
//! keeps a bounded rolling history per dimension. The
//! [`SystemStatus`](crate::SystemStatus) aggregation and ultimately the
//! autoscaled pool's scaling decisions are driven entirely by these
//! histories.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::utils::{format_bytes, get_total_memory_bytes, get_used_memory_bytes, read_cpu_ticks};
use crate::{EventBus, RequestQueueStorage, SnapshotterOptions, SystemEvent};

/// Memory usage fraction at which a one-time warning is logged.
const MEMORY_WARNING_RATIO: f64 = 0.75;

/// Fallback memory ceiling when the host limit cannot be detected.
const DEFAULT_MAX_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct MemorySample {
    pub created_at: DateTime<Utc>,
    pub is_overloaded: bool,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventLoopSample {
    pub created_at: DateTime<Utc>,
    pub is_overloaded: bool,
    /// How far past the tolerated lag this tick arrived, in milliseconds.
    pub exceeded_millis: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuSample {
    pub created_at: DateTime<Utc>,
    pub is_overloaded: bool,
    /// Busy fraction over the last sampling window; absent for samples
    /// ingested from platform events that did not carry a usage figure.
    pub used_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSample {
    pub created_at: DateTime<Utc>,
    pub is_overloaded: bool,
    /// New rate-limit errors observed since the previous client sample.
    pub rate_limit_error_count: u64,
}

#[derive(Default)]
struct SampleBuffers {
    memory: VecDeque<MemorySample>,
    event_loop: VecDeque<EventLoopSample>,
    cpu: VecDeque<CpuSample>,
    client: VecDeque<ClientSample>,
}

impl SampleBuffers {
    fn evict_older_than(&mut self, cutoff: DateTime<Utc>) {
        while self.memory.front().is_some_and(|s| s.created_at < cutoff) {
            self.memory.pop_front();
        }
        while self.event_loop.front().is_some_and(|s| s.created_at < cutoff) {
            self.event_loop.pop_front();
        }
        while self.cpu.front().is_some_and(|s| s.created_at < cutoff) {
            self.cpu.pop_front();
        }
        while self.client.front().is_some_and(|s| s.created_at < cutoff) {
            self.client.pop_front();
        }
    }
}

/// Periodic sampler of system load.
///
/// CPU runs in one of two modes: when an [`EventBus`] is attached,
/// externally emitted system-info events become CPU samples directly
/// (platform mode); otherwise the local scheduler tick counters are
/// diffed on a timer (local mode).
pub struct Snapshotter {
    options: SnapshotterOptions,
    max_memory_bytes: u64,
    samples: Arc<Mutex<SampleBuffers>>,
    client_stats: Option<Arc<dyn RequestQueueStorage>>,
    event_bus: Option<Arc<EventBus>>,
    is_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    memory_warning_logged: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Snapshotter {
    pub fn new(options: SnapshotterOptions) -> Self {
        Self::with_collaborators(options, None, None)
    }

    /// Build a snapshotter wired to a storage client (for the client
    /// error dimension) and/or an event bus (for platform CPU mode).
    pub fn with_collaborators(
        options: SnapshotterOptions,
        client_stats: Option<Arc<dyn RequestQueueStorage>>,
        event_bus: Option<Arc<EventBus>>,
    ) -> Self {
        let max_memory_bytes = options
            .max_memory_bytes
            .or_else(get_total_memory_bytes)
            .unwrap_or(DEFAULT_MAX_MEMORY_BYTES);

        Self {
            options,
            max_memory_bytes,
            samples: Arc::new(Mutex::new(SampleBuffers::default())),
            client_stats,
            event_bus,
            is_running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            memory_warning_logged: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Begin periodic sampling. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("Snapshotter already running");
            return;
        }

        let options = self.options.clone();
        let max_memory_bytes = self.max_memory_bytes;
        let samples = self.samples.clone();
        let client_stats = self.client_stats.clone();
        let is_running = self.is_running.clone();
        let shutdown = self.shutdown.clone();
        let memory_warning_logged = self.memory_warning_logged.clone();

        // Platform mode: CPU samples arrive as events, the local CPU
        // timer stays quiet.
        let platform_cpu_mode = self.event_bus.is_some();
        let mut events = self
            .event_bus
            .as_ref()
            .map(|bus| bus.subscribe());

        let handle = tokio::spawn(async move {
            debug!("Snapshotter started");

            let mut event_loop_interval =
                tokio::time::interval(options.event_loop_snapshot_interval);
            event_loop_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut memory_interval = tokio::time::interval(options.memory_snapshot_interval);
            let mut cpu_interval = tokio::time::interval(options.cpu_snapshot_interval);
            let mut client_interval = tokio::time::interval(options.client_snapshot_interval);

            // interval() fires immediately once; consume the initial
            // ticks so the first real samples are a full period apart.
            event_loop_interval.tick().await;
            memory_interval.tick().await;
            cpu_interval.tick().await;
            client_interval.tick().await;

            let mut last_event_loop_tick = Instant::now();
            let mut last_cpu_ticks = read_cpu_ticks();
            let mut last_client_errors: Option<u64> = None;

            while is_running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = shutdown.notified() => break,

                    _ = event_loop_interval.tick() => {
                        let now = Instant::now();
                        let elapsed = now.duration_since(last_event_loop_tick);
                        last_event_loop_tick = now;
                        Self::snapshot_event_loop(&samples, &options, elapsed);
                    }

                    _ = memory_interval.tick() => {
                        Self::snapshot_memory(
                            &samples,
                            &options,
                            max_memory_bytes,
                            &memory_warning_logged,
                        );
                    }

                    _ = cpu_interval.tick(), if !platform_cpu_mode => {
                        let current = read_cpu_ticks();
                        Self::snapshot_cpu_local(&samples, &options, &last_cpu_ticks, &current);
                        last_cpu_ticks = current;
                    }

                    _ = client_interval.tick() => {
                        if let Some(stats) = &client_stats {
                            let counts = stats.rate_limit_error_counts();
                            last_client_errors = Some(Self::snapshot_client(
                                &samples,
                                &options,
                                &counts,
                                last_client_errors,
                            ));
                        }
                    }

                    event = Self::next_event(&mut events) => {
                        match event {
                            Some(SystemEvent::SystemInfo {
                                is_cpu_overloaded,
                                created_at,
                                cpu_current_usage,
                            }) => {
                                Self::push_cpu_sample(&samples, &options, CpuSample {
                                    created_at,
                                    is_overloaded: is_cpu_overloaded,
                                    used_ratio: cpu_current_usage,
                                });
                            }
                            Some(SystemEvent::Shutdown) => break,
                            Some(SystemEvent::PersistState) => {}
                            // channel closed; fall back to timers only
                            None => events = None,
                        }
                    }
                }
            }

            debug!("Snapshotter stopped");
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// Cancel timers, let the sampling task drain, and release it.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn next_event(
        events: &mut Option<tokio::sync::broadcast::Receiver<SystemEvent>>,
    ) -> Option<SystemEvent> {
        match events {
            Some(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Snapshotter lagged behind event bus, skipped {skipped} events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            },
            None => std::future::pending().await,
        }
    }

    fn snapshot_event_loop(
        samples: &Mutex<SampleBuffers>,
        options: &SnapshotterOptions,
        elapsed: Duration,
    ) {
        let lag = elapsed.saturating_sub(options.event_loop_snapshot_interval);
        let is_overloaded = lag > options.max_blocked;
        let exceeded_millis = lag.saturating_sub(options.max_blocked).as_millis() as u64;

        let sample = EventLoopSample {
            created_at: Utc::now(),
            is_overloaded,
            exceeded_millis,
        };

        if let Ok(mut buffers) = samples.lock() {
            buffers.event_loop.push_back(sample);
            buffers.evict_older_than(Self::retention_cutoff(options));
        }
    }

    fn snapshot_memory(
        samples: &Mutex<SampleBuffers>,
        options: &SnapshotterOptions,
        max_memory_bytes: u64,
        warning_logged: &AtomicBool,
    ) {
        let Some(used_bytes) = get_used_memory_bytes() else {
            warn!("Memory snapshot failed, skipping tick");
            return;
        };

        let used_ratio = used_bytes as f64 / max_memory_bytes as f64;
        let is_overloaded = used_ratio > options.max_used_memory_ratio;

        if used_ratio >= MEMORY_WARNING_RATIO
            && !warning_logged.swap(true, Ordering::Relaxed)
        {
            warn!(
                "Memory usage is {} of the {} limit",
                format!("{:.0}%", used_ratio * 100.0),
                format_bytes(max_memory_bytes)
            );
        }

        let sample = MemorySample {
            created_at: Utc::now(),
            is_overloaded,
            used_bytes,
        };

        if let Ok(mut buffers) = samples.lock() {
            buffers.memory.push_back(sample);
            buffers.evict_older_than(Self::retention_cutoff(options));
        }
    }

    fn snapshot_cpu_local(
        samples: &Mutex<SampleBuffers>,
        options: &SnapshotterOptions,
        previous: &Option<crate::utils::CpuTicks>,
        current: &Option<crate::utils::CpuTicks>,
    ) {
        let (Some(prev), Some(curr)) = (previous, current) else {
            warn!("CPU snapshot failed, skipping tick");
            return;
        };

        let total_delta = curr.total.saturating_sub(prev.total);
        if total_delta == 0 {
            return;
        }
        let busy_delta = curr.busy.saturating_sub(prev.busy);
        let used_ratio = busy_delta as f64 / total_delta as f64;

        Self::push_cpu_sample(
            samples,
            options,
            CpuSample {
                created_at: Utc::now(),
                is_overloaded: used_ratio > options.max_used_cpu_ratio,
                used_ratio: Some(used_ratio),
            },
        );
    }

    fn push_cpu_sample(
        samples: &Mutex<SampleBuffers>,
        options: &SnapshotterOptions,
        sample: CpuSample,
    ) {
        if let Ok(mut buffers) = samples.lock() {
            buffers.cpu.push_back(sample);
            buffers.evict_older_than(Self::retention_cutoff(options));
        }
    }

    /// Returns the new total so the caller can carry it to the next tick.
    fn snapshot_client(
        samples: &Mutex<SampleBuffers>,
        options: &SnapshotterOptions,
        bucket_counts: &[u64],
        previous_total: Option<u64>,
    ) -> u64 {
        // Errors that survived at least one retry indicate sustained
        // throttling rather than one-off blips.
        let total: u64 = bucket_counts.iter().skip(1).sum();
        let delta = total.saturating_sub(previous_total.unwrap_or(total));
        let is_overloaded = delta > options.max_client_errors;

        let sample = ClientSample {
            created_at: Utc::now(),
            is_overloaded,
            rate_limit_error_count: delta,
        };

        if let Ok(mut buffers) = samples.lock() {
            buffers.client.push_back(sample);
            buffers.evict_older_than(Self::retention_cutoff(options));
        }

        total
    }

    fn retention_cutoff(options: &SnapshotterOptions) -> DateTime<Utc> {
        Utc::now()
            - ChronoDuration::from_std(options.snapshot_history)
                .unwrap_or_else(|_| ChronoDuration::seconds(30))
    }

    fn since_cutoff(since: Option<Duration>) -> Option<DateTime<Utc>> {
        since.map(|window| {
            Utc::now()
                - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(0))
        })
    }

    /// Memory samples from the last `since` window (all retained samples
    /// when `None`).
    pub fn get_memory_sample(&self, since: Option<Duration>) -> Vec<MemorySample> {
        let cutoff = Self::since_cutoff(since);
        self.samples
            .lock()
            .map(|buffers| {
                buffers
                    .memory
                    .iter()
                    .filter(|s| cutoff.map_or(true, |c| s.created_at >= c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_event_loop_sample(&self, since: Option<Duration>) -> Vec<EventLoopSample> {
        let cutoff = Self::since_cutoff(since);
        self.samples
            .lock()
            .map(|buffers| {
                buffers
                    .event_loop
                    .iter()
                    .filter(|s| cutoff.map_or(true, |c| s.created_at >= c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_cpu_sample(&self, since: Option<Duration>) -> Vec<CpuSample> {
        let cutoff = Self::since_cutoff(since);
        self.samples
            .lock()
            .map(|buffers| {
                buffers
                    .cpu
                    .iter()
                    .filter(|s| cutoff.map_or(true, |c| s.created_at >= c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_client_sample(&self, since: Option<Duration>) -> Vec<ClientSample> {
        let cutoff = Self::since_cutoff(since);
        self.samples
            .lock()
            .map(|buffers| {
                buffers
                    .client
                    .iter()
                    .filter(|s| cutoff.map_or(true, |c| s.created_at >= c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
