//! Aggregation of load samples into a binary idle/overloaded judgement

use std::sync::Arc;
use std::time::Duration;

use crate::{Snapshotter, SystemStatusOptions};

/// Judgement for one load dimension over an evaluated window.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionStatus {
    pub is_overloaded: bool,
    /// Configured tolerance for the fraction of overloaded samples.
    pub limit_ratio: f64,
    /// Observed fraction of overloaded samples.
    pub actual_ratio: f64,
    pub sample_count: usize,
}

impl DimensionStatus {
    fn evaluate(overloaded_flags: impl Iterator<Item = bool>, limit_ratio: f64) -> Self {
        let mut sample_count = 0usize;
        let mut overloaded_count = 0usize;
        for is_overloaded in overloaded_flags {
            sample_count += 1;
            if is_overloaded {
                overloaded_count += 1;
            }
        }

        // An empty window carries no evidence of overload.
        let actual_ratio = if sample_count == 0 {
            0.0
        } else {
            overloaded_count as f64 / sample_count as f64
        };

        Self {
            is_overloaded: actual_ratio > limit_ratio,
            limit_ratio,
            actual_ratio,
            sample_count,
        }
    }
}

/// Combined judgement across all four dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatusReport {
    /// True iff no dimension is overloaded.
    pub is_system_idle: bool,
    pub memory: DimensionStatus,
    pub event_loop: DimensionStatus,
    pub cpu: DimensionStatus,
    pub client: DimensionStatus,
}

/// Collapses snapshotter histories into "is the system OK" answers.
///
/// `get_current_status` looks at a short recent window and answers "is
/// the system OK right now"; `get_historical_status` evaluates the full
/// retained history and answers "has the system been OK lately". The
/// autoscaled pool scales down whenever the latter says no.
pub struct SystemStatus {
    snapshotter: Arc<Snapshotter>,
    options: SystemStatusOptions,
}

impl SystemStatus {
    pub fn new(snapshotter: Arc<Snapshotter>, options: SystemStatusOptions) -> Self {
        Self {
            snapshotter,
            options,
        }
    }

    /// Evaluate the last `current_history` of samples.
    pub fn get_current_status(&self) -> SystemStatusReport {
        self.evaluate(Some(self.options.current_history))
    }

    /// Evaluate the full retained history.
    pub fn get_historical_status(&self) -> SystemStatusReport {
        self.evaluate(None)
    }

    pub fn is_ok(&self) -> bool {
        self.get_current_status().is_system_idle
    }

    pub fn has_been_ok_lately(&self) -> bool {
        self.get_historical_status().is_system_idle
    }

    fn evaluate(&self, window: Option<Duration>) -> SystemStatusReport {
        let memory = DimensionStatus::evaluate(
            self.snapshotter
                .get_memory_sample(window)
                .iter()
                .map(|s| s.is_overloaded),
            self.options.max_memory_overloaded_ratio,
        );
        let event_loop = DimensionStatus::evaluate(
            self.snapshotter
                .get_event_loop_sample(window)
                .iter()
                .map(|s| s.is_overloaded),
            self.options.max_event_loop_overloaded_ratio,
        );
        let cpu = DimensionStatus::evaluate(
            self.snapshotter
                .get_cpu_sample(window)
                .iter()
                .map(|s| s.is_overloaded),
            self.options.max_cpu_overloaded_ratio,
        );
        let client = DimensionStatus::evaluate(
            self.snapshotter
                .get_client_sample(window)
                .iter()
                .map(|s| s.is_overloaded),
            self.options.max_client_overloaded_ratio,
        );

        let is_system_idle = !memory.is_overloaded
            && !event_loop.is_overloaded
            && !cpu.is_overloaded
            && !client.is_overloaded;

        SystemStatusReport {
            is_system_idle,
            memory,
            event_loop,
            cpu,
            client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventBus, SnapshotterOptions, SystemEvent};
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_dimension_ratio_threshold() {
        let flags = vec![true, true, false, false];
        let status = DimensionStatus::evaluate(flags.iter().copied(), 0.4);
        assert_eq!(status.actual_ratio, 0.5);
        assert!(status.is_overloaded);

        let status = DimensionStatus::evaluate(flags.iter().copied(), 0.5);
        // exactly at the limit is still tolerated
        assert!(!status.is_overloaded);
    }

    #[test]
    fn test_empty_history_is_ok() {
        let status = DimensionStatus::evaluate(std::iter::empty(), 0.1);
        assert!(!status.is_overloaded);
        assert_eq!(status.actual_ratio, 0.0);
        assert_eq!(status.sample_count, 0);
    }

    #[tokio::test]
    async fn test_overloaded_cpu_history_flips_judgement() {
        let bus = Arc::new(EventBus::new());
        let snapshotter = Arc::new(Snapshotter::with_collaborators(
            SnapshotterOptions::default(),
            None,
            Some(bus.clone()),
        ));
        snapshotter.start();

        for _ in 0..10 {
            bus.emit(SystemEvent::SystemInfo {
                is_cpu_overloaded: true,
                created_at: Utc::now(),
                cpu_current_usage: Some(0.99),
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = SystemStatus::new(snapshotter.clone(), SystemStatusOptions::default());
        assert!(!status.has_been_ok_lately());
        assert!(!status.is_ok());

        let report = status.get_historical_status();
        assert!(report.cpu.is_overloaded);
        assert_eq!(report.cpu.actual_ratio, 1.0);
        assert!(!report.memory.is_overloaded);

        snapshotter.stop().await;
    }

    #[tokio::test]
    async fn test_idle_without_samples() {
        let snapshotter = Arc::new(Snapshotter::new(SnapshotterOptions::default()));
        let status = SystemStatus::new(snapshotter, SystemStatusOptions::default());
        assert!(status.is_ok());
        assert!(status.has_been_ok_lately());
    }
}
