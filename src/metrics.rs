use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;
use tracing::info;

/// Metric handles for the crawling runtime.
///
/// Handles start as no-ops and bind to whatever recorder the embedding
/// application installs (see [`PrometheusExporter`]).
#[derive(Clone)]
pub struct CrawlerMetrics {
    pub requests_handled: Counter,
    pub requests_failed: Counter,
    pub requests_retried: Counter,
    pub request_duration: Histogram,
    pub pool_desired_concurrency: Gauge,
    pub pool_current_concurrency: Gauge,
    pub system_overloaded: Gauge,
    pub queue_in_progress: Gauge,
}

impl CrawlerMetrics {
    pub fn new() -> Self {
        Self {
            requests_handled: Counter::noop(),
            requests_failed: Counter::noop(),
            requests_retried: Counter::noop(),
            request_duration: Histogram::noop(),
            pool_desired_concurrency: Gauge::noop(),
            pool_current_concurrency: Gauge::noop(),
            system_overloaded: Gauge::noop(),
            queue_in_progress: Gauge::noop(),
        }
    }

    pub fn record_request(&self, duration: Duration, success: bool) {
        if success {
            self.requests_handled.increment(1);
        } else {
            self.requests_failed.increment(1);
        }

        self.request_duration.record(duration.as_secs_f64());
    }

    pub fn record_retry(&self) {
        self.requests_retried.increment(1);
    }

    pub fn record_pool_concurrency(&self, current: usize, desired: usize) {
        self.pool_current_concurrency.set(current as f64);
        self.pool_desired_concurrency.set(desired as f64);
    }

    pub fn record_system_overloaded(&self, overloaded: bool) {
        self.system_overloaded.set(if overloaded { 1.0 } else { 0.0 });
    }

    pub fn record_queue_in_progress(&self, count: usize) {
        self.queue_in_progress.set(count as f64);
    }
}

impl Default for CrawlerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn install(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();

        metrics::set_boxed_recorder(Box::new(recorder))?;

        info!("Prometheus recorder installed, metrics port {}", self.port);

        Ok(())
    }
}
