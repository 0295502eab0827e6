//! Observation fan-out
//!
//! Broadcast channel carrying state snapshots, statistics and log lines to
//! any subscribed control-plane consumer. Publishing never blocks a worker:
//! the channel drops its oldest buffered event on overflow and a lagging
//! subscriber skips ahead. Per-instance refreshes coalesce to at most one
//! emission per window; transition events always go out immediately.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;

use crate::session_store::InstanceId;

use super::errors::BusError;
use super::ring::LogRing;
use super::types::{InstanceSnapshot, LogLine, ObservationEvent};

/// Non-transition instance refreshes are limited to one per this window
const COALESCE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct BusMetrics {
    published: AtomicU64,
    suppressed: AtomicU64,
    undelivered: AtomicU64,
}

/// Cloneable handle to the fan-out channel and the log ring
#[derive(Debug, Clone)]
pub struct ObservationBus {
    sender: broadcast::Sender<ObservationEvent>,
    last_instance_emit: Arc<DashMap<InstanceId, Instant>>,
    metrics: Arc<BusMetrics>,
    ring: Arc<LogRing>,
}

impl ObservationBus {
    #[must_use]
    pub fn new(capacity: usize, ring_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            sender,
            last_instance_emit: Arc::new(DashMap::new()),
            metrics: Arc::new(BusMetrics::default()),
            ring: Arc::new(LogRing::new(ring_capacity)),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ObservationEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all subscribers; never blocks.
    ///
    /// Returns the subscriber count, or [`BusError::NoSubscribers`] when
    /// nobody is listening — callers on the worker path ignore that case.
    pub fn publish(&self, event: ObservationEvent) -> Result<usize, BusError> {
        match self.sender.send(event) {
            Ok(count) => {
                self.metrics.published.fetch_add(1, Ordering::Relaxed);
                Ok(count)
            }
            Err(_) => {
                self.metrics.undelivered.fetch_add(1, Ordering::Relaxed);
                trace!("published event with no active subscribers");
                Err(BusError::NoSubscribers)
            }
        }
    }

    /// Publish one instance snapshot.
    ///
    /// `transition` marks a real state change or vote outcome and always
    /// emits; periodic refreshes for the same instance coalesce to one per
    /// minute.
    pub fn publish_instance(&self, snapshot: InstanceSnapshot, transition: bool) {
        if !transition {
            if let Some(previous) = self.last_instance_emit.get(&snapshot.instance_id) {
                if previous.elapsed() < COALESCE_WINDOW {
                    self.metrics.suppressed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
        self.last_instance_emit
            .insert(snapshot.instance_id, Instant::now());
        let _ = self.publish(ObservationEvent::InstanceUpdate(snapshot));
    }

    /// Record an operator-facing line in the ring and push it to subscribers
    pub fn log(&self, level: &str, message: impl Into<String>) {
        let line = LogLine::new(level, message);
        self.ring.push(line.clone());
        let _ = self.publish(ObservationEvent::LogUpdate(line));
    }

    /// Most recent `n` log lines, oldest first
    #[must_use]
    pub fn log_tail(&self, n: usize) -> Vec<LogLine> {
        self.ring.tail(n)
    }

    /// (published, suppressed, undelivered)
    #[must_use]
    pub fn metrics(&self) -> (u64, u64, u64) {
        (
            self.metrics.published.load(Ordering::Relaxed),
            self.metrics.suppressed.load(Ordering::Relaxed),
            self.metrics.undelivered.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::StatusSnapshot;

    fn snapshot(id: InstanceId) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: id,
            ip: None,
            state: "idle".to_string(),
            seconds_remaining: 0,
            next_vote_time: None,
            vote_count: 0,
            last_success: None,
            last_attempt: None,
            last_failure_reason: None,
        }
    }

    #[tokio::test]
    async fn transition_events_always_emit() {
        let bus = ObservationBus::new(64, 16);
        let mut rx = bus.subscribe();
        bus.publish_instance(snapshot(1), true);
        bus.publish_instance(snapshot(1), true);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ObservationEvent::InstanceUpdate(_)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ObservationEvent::InstanceUpdate(_)
        ));
    }

    #[tokio::test]
    async fn refreshes_coalesce_within_window() {
        let bus = ObservationBus::new(64, 16);
        let _rx = bus.subscribe();
        bus.publish_instance(snapshot(2), false);
        bus.publish_instance(snapshot(2), false);
        bus.publish_instance(snapshot(2), false);
        let (published, suppressed, _) = bus.metrics();
        assert_eq!(published, 1);
        assert_eq!(suppressed, 2);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_reports_but_never_blocks() {
        let bus = ObservationBus::new(64, 16);
        let result = bus.publish(ObservationEvent::StatusUpdate(StatusSnapshot {
            monitoring_active: false,
            global_limit_active: false,
            reactivation_time: None,
        }));
        assert!(matches!(result, Err(BusError::NoSubscribers)));
        let (_, _, undelivered) = bus.metrics();
        assert_eq!(undelivered, 1);
    }

    #[tokio::test]
    async fn log_lines_land_in_ring_and_channel() {
        let bus = ObservationBus::new(64, 16);
        let mut rx = bus.subscribe();
        bus.log("info", "worker 1 entered cooldown");
        assert_eq!(bus.log_tail(10).len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ObservationEvent::LogUpdate(_)
        ));
    }
}
