//! Autoscaled worker pool
//!
//! The pool runs user-supplied tasks at the largest concurrency the
//! system tolerates. Two periodic loops drive it: the dispatch loop fills
//! worker slots up to `desired_concurrency` whenever tasks are ready, and
//! the autoscale loop grows or shrinks `desired_concurrency` based on the
//! [`SystemStatus`](crate::SystemStatus) judgement and the pool's own
//! utilization.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    AutoscaledPoolOptions, CrawlError, CrawlerMetrics, Snapshotter, SystemStatus,
};

/// Outcome of one task slot: `Some(())` when a task ran, `None` when
/// nothing was runnable this tick.
pub type TaskRunResult = Result<Option<()>, CrawlError>;

pub type RunTaskFn = Arc<dyn Fn() -> BoxFuture<'static, TaskRunResult> + Send + Sync>;
pub type IsTaskReadyFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<bool, CrawlError>> + Send + Sync>;
pub type IsFinishedFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<bool, CrawlError>> + Send + Sync>;

/// Lifecycle of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Idle,
    Running,
    Finished,
    Aborted,
    Failed,
}

struct PoolState {
    min_concurrency: usize,
    max_concurrency: usize,
    desired_concurrency: usize,
    current_concurrency: usize,
    is_paused: bool,
    fatal_error: Option<CrawlError>,
    phase: PoolPhase,
}

/// Decrements `current_concurrency` when a task settles, whatever the
/// outcome, and pings the dispatch loop.
struct SlotGuard {
    state: Arc<Mutex<PoolState>>,
    task_settled: Arc<Notify>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.current_concurrency = state.current_concurrency.saturating_sub(1);
        }
        self.task_settled.notify_one();
    }
}

/// Worker pool that continuously sizes its parallelism to system load.
///
/// # Examples
///
/// ```rust,no_run
/// use crawl_runtime::{AutoscaledPool, AutoscaledPoolOptions, CrawlError};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), CrawlError> {
/// let remaining = Arc::new(AtomicUsize::new(100));
///
/// let pool = AutoscaledPool::new(
///     AutoscaledPoolOptions::default(),
///     {
///         let remaining = remaining.clone();
///         Arc::new(move || {
///             let remaining = remaining.clone();
///             Box::pin(async move {
///                 let claimed = remaining
///                     .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
///                     .is_ok();
///                 if claimed {
///                     // process one unit of work
///                     Ok(Some(()))
///                 } else {
///                     Ok(None)
///                 }
///             })
///         })
///     },
///     {
///         let remaining = remaining.clone();
///         Arc::new(move || {
///             let ready = remaining.load(Ordering::SeqCst) > 0;
///             Box::pin(async move { Ok(ready) })
///         })
///     },
///     {
///         let remaining = remaining.clone();
///         Arc::new(move || {
///             let finished = remaining.load(Ordering::SeqCst) == 0;
///             Box::pin(async move { Ok(finished) })
///         })
///     },
/// )?;
///
/// pool.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct AutoscaledPool {
    options: AutoscaledPoolOptions,
    run_task: RunTaskFn,
    is_task_ready: IsTaskReadyFn,
    is_finished: IsFinishedFn,
    snapshotter: Arc<Snapshotter>,
    system_status: Arc<SystemStatus>,
    state: Arc<Mutex<PoolState>>,
    task_settled: Arc<Notify>,
    abort_requested: Arc<AtomicBool>,
    metrics: CrawlerMetrics,
}

impl AutoscaledPool {
    pub fn new(
        options: AutoscaledPoolOptions,
        run_task: RunTaskFn,
        is_task_ready: IsTaskReadyFn,
        is_finished: IsFinishedFn,
    ) -> Result<Self, CrawlError> {
        let snapshotter = Arc::new(Snapshotter::new(options.snapshotter_options.clone()));
        let system_status = Arc::new(SystemStatus::new(
            snapshotter.clone(),
            options.system_status_options.clone(),
        ));
        Self::with_system(
            options,
            snapshotter,
            system_status,
            run_task,
            is_task_ready,
            is_finished,
        )
    }

    /// Build a pool around an externally constructed snapshotter and
    /// system status (shared with other components, or preconfigured for
    /// tests).
    pub fn with_system(
        options: AutoscaledPoolOptions,
        snapshotter: Arc<Snapshotter>,
        system_status: Arc<SystemStatus>,
        run_task: RunTaskFn,
        is_task_ready: IsTaskReadyFn,
        is_finished: IsFinishedFn,
    ) -> Result<Self, CrawlError> {
        options.validate()?;

        let state = PoolState {
            min_concurrency: options.min_concurrency,
            max_concurrency: options.max_concurrency,
            desired_concurrency: options.min_concurrency,
            current_concurrency: 0,
            is_paused: false,
            fatal_error: None,
            phase: PoolPhase::Idle,
        };

        Ok(Self {
            options,
            run_task,
            is_task_ready,
            is_finished,
            snapshotter,
            system_status,
            state: Arc::new(Mutex::new(state)),
            task_settled: Arc::new(Notify::new()),
            abort_requested: Arc::new(AtomicBool::new(false)),
            metrics: CrawlerMetrics::new(),
        })
    }

    /// Run the pool until the finished predicate holds and no tasks are
    /// in flight, `abort()` is called, or a fatal error surfaces.
    pub async fn run(&self) -> Result<(), CrawlError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != PoolPhase::Idle {
                return Err(CrawlError::InvalidArgument(
                    "the pool has already been started".to_string(),
                ));
            }
            state.phase = PoolPhase::Running;
        }

        info!(
            "AutoscaledPool started (min: {}, max: {})",
            self.options.min_concurrency, self.options.max_concurrency
        );
        self.snapshotter.start();

        let result = self.main_loop().await;

        self.snapshotter.stop().await;

        let phase = {
            let mut state = self.state.lock().unwrap();
            state.phase = match (&result, self.abort_requested.load(Ordering::SeqCst)) {
                (Err(_), _) => PoolPhase::Failed,
                (Ok(()), true) => PoolPhase::Aborted,
                (Ok(()), false) => PoolPhase::Finished,
            };
            state.phase
        };

        match &result {
            Ok(()) => info!("AutoscaledPool finished ({phase:?})"),
            Err(e) => error!("AutoscaledPool failed: {e}"),
        }

        result
    }

    async fn main_loop(&self) -> Result<(), CrawlError> {
        let mut maybe_run_interval = interval(self.options.maybe_run_interval);
        maybe_run_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut autoscale_interval = interval(self.options.autoscale_interval);
        autoscale_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut logging_interval = self.options.logging_interval.map(interval);

        // Consume the immediate first ticks so neither loop fires at t=0.
        maybe_run_interval.tick().await;
        autoscale_interval.tick().await;
        if let Some(timer) = logging_interval.as_mut() {
            timer.tick().await;
        }

        loop {
            let (current, fatal, aborting) = {
                let state = self.state.lock().unwrap();
                (
                    state.current_concurrency,
                    state.fatal_error.clone(),
                    self.abort_requested.load(Ordering::SeqCst),
                )
            };

            if fatal.is_some() || aborting {
                // Stop launching; settle in-flight work before returning.
                if current == 0 {
                    return match fatal {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                }
            } else {
                if let Err(error) = self.fill_slots().await {
                    // Record and fall through; in-flight tasks still settle.
                    self.record_fatal(error);
                    continue;
                }

                // The finished predicate is only consulted with nothing
                // in flight, so the pool never terminates mid-task. A
                // paused pool does not terminate either.
                if self.current_concurrency() == 0 && !self.has_fatal() && !self.is_paused() {
                    match (self.is_finished)().await {
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(error) => {
                            return Err(CrawlError::Fatal(format!(
                                "is_finished predicate failed: {error}"
                            )))
                        }
                    }
                }
            }

            tokio::select! {
                _ = maybe_run_interval.tick() => {}
                _ = autoscale_interval.tick() => self.autoscale_tick(),
                _ = Self::optional_tick(&mut logging_interval) => self.log_state(),
                _ = self.task_settled.notified() => {}
            }
        }
    }

    async fn optional_tick(timer: &mut Option<tokio::time::Interval>) {
        match timer {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Launch tasks until the desired slot count is reached or no task is
    /// ready.
    async fn fill_slots(&self) -> Result<(), CrawlError> {
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.is_paused
                    || state.fatal_error.is_some()
                    || state.current_concurrency >= state.desired_concurrency
                    || self.abort_requested.load(Ordering::SeqCst)
                {
                    return Ok(());
                }
            }

            match (self.is_task_ready)().await {
                Ok(true) => {
                    if !self.try_reserve_slot() {
                        return Ok(());
                    }
                    self.spawn_task();
                }
                Ok(false) => return Ok(()),
                Err(error) => {
                    return Err(CrawlError::Fatal(format!(
                        "is_task_ready predicate failed: {error}"
                    )))
                }
            }
        }
    }

    /// Claim a worker slot. The claim happens before the task future is
    /// created, so `current_concurrency` is visible ahead of the task's
    /// first suspension point.
    fn try_reserve_slot(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_paused
            || state.fatal_error.is_some()
            || state.current_concurrency >= state.desired_concurrency
            || self.abort_requested.load(Ordering::SeqCst)
        {
            return false;
        }
        state.current_concurrency += 1;
        true
    }

    fn spawn_task(&self) {
        let run_task = self.run_task.clone();
        let guard = SlotGuard {
            state: self.state.clone(),
            task_settled: self.task_settled.clone(),
        };
        let state = self.state.clone();

        tokio::spawn(async move {
            let _guard = guard;
            match run_task().await {
                Ok(Some(())) => {}
                // No task was runnable; the slot is simply freed.
                Ok(None) => {}
                Err(error) => {
                    let mut state = state.lock().unwrap();
                    if state.fatal_error.is_none() {
                        state.fatal_error = Some(error);
                    }
                }
            }
        });
    }

    /// One scale-up/scale-down decision.
    fn autoscale_tick(&self) {
        let system_ok = self.system_status.has_been_ok_lately();
        self.metrics.record_system_overloaded(!system_ok);

        let mut state = self.state.lock().unwrap();
        if !system_ok {
            let step = (state.desired_concurrency as f64 * self.options.scale_down_step_ratio)
                .ceil() as usize;
            let previous = state.desired_concurrency;
            state.desired_concurrency = state
                .desired_concurrency
                .saturating_sub(step)
                .max(state.min_concurrency);
            if state.desired_concurrency != previous {
                debug!(
                    "Scaling down: desired concurrency {} -> {}",
                    previous, state.desired_concurrency
                );
            }
        } else {
            let utilization_floor = (state.desired_concurrency as f64
                * self.options.desired_concurrency_ratio)
                .floor() as usize;
            if state.current_concurrency >= utilization_floor {
                let step = (state.desired_concurrency as f64 * self.options.scale_up_step_ratio)
                    .ceil() as usize;
                let previous = state.desired_concurrency;
                state.desired_concurrency =
                    (state.desired_concurrency + step).min(state.max_concurrency);
                if state.desired_concurrency != previous {
                    debug!(
                        "Scaling up: desired concurrency {} -> {}",
                        previous, state.desired_concurrency
                    );
                }
            }
        }

        self.metrics
            .record_pool_concurrency(state.current_concurrency, state.desired_concurrency);
    }

    fn log_state(&self) {
        let state = self.state.lock().unwrap();
        let status = self.system_status.get_current_status();
        info!(
            "AutoscaledPool state: concurrency {}/{}, system {}",
            state.current_concurrency,
            state.desired_concurrency,
            if status.is_system_idle { "ok" } else { "overloaded" }
        );
    }

    fn record_fatal(&self, error: CrawlError) {
        let mut state = self.state.lock().unwrap();
        if state.fatal_error.is_none() {
            warn!("Pool entering failure drain: {error}");
            state.fatal_error = Some(error);
        }
    }

    fn has_fatal(&self) -> bool {
        self.state.lock().unwrap().fatal_error.is_some()
    }

    /// Cease accepting new work, let in-flight tasks complete, and
    /// return. Idempotent.
    pub async fn abort(&self) {
        if !self.abort_requested.swap(true, Ordering::SeqCst) {
            info!("AutoscaledPool abort requested");
        }
        self.task_settled.notify_one();

        // Settle: wait for all in-flight tasks to finish.
        let mut retries = 0u32;
        while self.current_concurrency() > 0 {
            sleep(Duration::from_millis(10)).await;
            retries += 1;
            if retries % 500 == 0 {
                warn!(
                    "Abort still waiting on {} in-flight tasks",
                    self.current_concurrency()
                );
            }
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.is_paused {
            state.is_paused = true;
            info!("AutoscaledPool paused");
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_paused {
            state.is_paused = false;
            info!("AutoscaledPool resumed");
        }
        drop(state);
        self.task_settled.notify_one();
    }

    /// Raise or lower the concurrency ceiling, clamping the current
    /// desired concurrency into the new envelope.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let mut state = self.state.lock().unwrap();
        state.max_concurrency = max_concurrency.max(1);
        state.min_concurrency = state.min_concurrency.min(state.max_concurrency);
        state.desired_concurrency = state
            .desired_concurrency
            .clamp(state.min_concurrency, state.max_concurrency);
    }

    pub fn set_min_concurrency(&self, min_concurrency: usize) {
        let mut state = self.state.lock().unwrap();
        state.min_concurrency = min_concurrency.max(1).min(state.max_concurrency);
        state.desired_concurrency = state
            .desired_concurrency
            .clamp(state.min_concurrency, state.max_concurrency);
    }

    pub fn current_concurrency(&self) -> usize {
        self.state.lock().unwrap().current_concurrency
    }

    pub fn desired_concurrency(&self) -> usize {
        self.state.lock().unwrap().desired_concurrency
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().is_paused
    }

    pub fn phase(&self) -> PoolPhase {
        self.state.lock().unwrap().phase
    }

    pub fn system_status(&self) -> &Arc<SystemStatus> {
        &self.system_status
    }
}
