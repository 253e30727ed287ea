//! Typed system-event channel
//!
//! Platform signals (externally measured CPU overload, persist-state
//! ticks, shutdown) reach the runtime through a broadcast channel of
//! tagged [`SystemEvent`] variants. The snapshotter consumes
//! `SystemInfo` events for its CPU dimension; state-holding components
//! persist on `PersistState`.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// Externally measured system load, typically emitted by the hosting
    /// platform.
    SystemInfo {
        is_cpu_overloaded: bool,
        created_at: DateTime<Utc>,
        cpu_current_usage: Option<f64>,
    },
    /// Fixed-cadence signal telling consumers to persist their state.
    PersistState,
    /// The runtime is shutting down.
    Shutdown,
}

/// Broadcast bus distributing [`SystemEvent`]s to any number of
/// subscribers.
///
/// Lagging subscribers drop the oldest events; every event on this bus is
/// advisory, so losing stale ones is acceptable.
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
    is_shutting_down: Arc<AtomicBool>,
    persist_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            persist_task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all current subscribers. Returns the number of
    /// subscribers that received it.
    pub fn emit(&self, event: SystemEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Start emitting [`SystemEvent::PersistState`] on a fixed cadence.
    pub fn start_persist_emitter(self: &Arc<Self>, interval: Duration) {
        let bus = Arc::clone(self);
        let is_shutting_down = self.is_shutting_down.clone();

        let handle = tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so consumers are
            // not asked to persist before doing any work.
            interval_timer.tick().await;

            while !is_shutting_down.load(Ordering::Relaxed) {
                interval_timer.tick().await;
                debug!("Emitting persist-state event");
                bus.emit(SystemEvent::PersistState);
            }
        });

        if let Ok(mut task) = self.persist_task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Emit a final `Shutdown` event and stop the persist emitter.
    pub fn shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::Relaxed);
        self.emit(SystemEvent::Shutdown);

        if let Ok(mut task) = self.persist_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let received = bus.emit(SystemEvent::SystemInfo {
            is_cpu_overloaded: true,
            created_at: Utc::now(),
            cpu_current_usage: Some(0.99),
        });
        assert_eq!(received, 1);

        match rx.recv().await.unwrap() {
            SystemEvent::SystemInfo {
                is_cpu_overloaded, ..
            } => assert!(is_cpu_overloaded),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(SystemEvent::PersistState), 0);
    }

    #[tokio::test]
    async fn test_persist_emitter_fires() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        bus.start_persist_emitter(Duration::from_millis(20));

        let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("persist event within timeout")
            .unwrap();
        assert!(matches!(event, SystemEvent::PersistState));

        bus.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_emits_shutdown_event() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        bus.shutdown();
        assert!(matches!(rx.recv().await.unwrap(), SystemEvent::Shutdown));
    }
}
