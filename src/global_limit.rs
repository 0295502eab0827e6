//! Fleet-wide hourly-limit coordination
//!
//! When any worker scrapes the hourly-limit signal the whole fleet pauses
//! until the next top of the hour, then resumes one worker at a time with a
//! fixed spacing. Activation is idempotent: concurrent triggers from several
//! workers collapse into a single activation with a single reactivation
//! time. The reactivation time is computed once at activation, in the
//! process-local time zone, and stored — never recomputed per tick.

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session_store::InstanceId;

/// How often the gate checks whether the reactivation time has passed
const GATE_TICK: Duration = Duration::from_secs(60);

/// Point-in-time view of the gate, safe to copy across tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub active: bool,
    /// Set iff `active`
    pub reactivation_time: Option<DateTime<Utc>>,
    /// True while paused workers are being released one at a time; the
    /// auto-resume monitor must not unpause anyone during this window
    pub staggered_resume: bool,
}

impl GateSnapshot {
    /// True when neither the limit nor the resume protocol blocks launches
    #[must_use]
    pub fn permits_launch(&self) -> bool {
        !self.active && !self.staggered_resume
    }
}

#[derive(Debug, Default)]
struct GateInner {
    active: bool,
    reactivation_time: Option<DateTime<Utc>>,
    staggered_resume: bool,
}

/// The workers the staggered resume iterates over; implemented by the
/// supervisor's registry
#[async_trait]
pub trait PausedFleet: Send + Sync {
    /// Instances currently in the global-limit paused state
    fn paused_instances(&self) -> Vec<InstanceId>;
    /// Release one paused worker back to Idle
    async fn release(&self, instance_id: InstanceId);
}

/// Process-wide coordinator for the observed hourly-limit signal
#[derive(Debug)]
pub struct GlobalLimitGate {
    inner: Mutex<GateInner>,
}

impl GlobalLimitGate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(GateInner::default()),
        })
    }

    /// Report an observed hourly-limit signal.
    ///
    /// Returns `(newly_activated, reactivation_time)`. Idempotent: while the
    /// gate is already active the stored reactivation time is returned
    /// unchanged, so N concurrent triggers yield a single activation.
    pub async fn activate(&self, now: DateTime<Utc>) -> (bool, DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if inner.active {
            if let Some(t) = inner.reactivation_time {
                return (false, t);
            }
            // active without a time violates the gate invariant; repair it
            warn!("global gate active without reactivation time; recomputing");
        }
        let reactivation = next_top_of_hour(now);
        inner.active = true;
        inner.reactivation_time = Some(reactivation);
        info!(reactivation = %reactivation, "global hourly limit activated");
        (true, reactivation)
    }

    /// Activation with an explicit reactivation time.
    ///
    /// Same idempotence as [`activate`](Self::activate); used when the
    /// boundary is supplied externally (harness runs, operator overrides).
    pub async fn activate_until(&self, reactivation: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.active {
            return false;
        }
        inner.active = true;
        inner.reactivation_time = Some(reactivation);
        info!(reactivation = %reactivation, "global limit activated (explicit boundary)");
        true
    }

    pub async fn snapshot(&self) -> GateSnapshot {
        let inner = self.inner.lock().await;
        GateSnapshot {
            active: inner.active,
            reactivation_time: inner.reactivation_time,
            staggered_resume: inner.staggered_resume,
        }
    }

    /// Convenience latch read used at launch decision points
    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.active
    }

    /// Ticks every minute; once the reactivation time passes, runs the
    /// staggered resume: release paused workers one at a time with
    /// `launch_delay` between releases, then clear the gate. The gate stays
    /// `active` (and `staggered_resume` is set) for the whole window so no
    /// other component launches concurrently.
    pub async fn run_ticker(
        self: Arc<Self>,
        fleet: Arc<dyn PausedFleet>,
        launch_delay: Duration,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(GATE_TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => {
                    debug!("gate ticker exiting");
                    return;
                }
            }

            let due = {
                let mut inner = self.inner.lock().await;
                let due = inner.active
                    && !inner.staggered_resume
                    && inner
                        .reactivation_time
                        .is_some_and(|t| Utc::now() >= t);
                if due {
                    inner.staggered_resume = true;
                }
                due
            };
            if !due {
                continue;
            }

            let paused = fleet.paused_instances();
            info!(
                workers = paused.len(),
                spacing_secs = launch_delay.as_secs(),
                "hourly limit expired; beginning staggered resume"
            );

            for (i, instance_id) in paused.iter().enumerate() {
                if i > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(launch_delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                fleet.release(*instance_id).await;
                debug!(instance_id, "released from global pause");
            }

            // Only after the final release does the gate deactivate.
            let mut inner = self.inner.lock().await;
            inner.active = false;
            inner.reactivation_time = None;
            inner.staggered_resume = false;
            info!("staggered resume complete; global gate inactive");
        }
    }
}

/// Next top-of-hour boundary in the process's local time zone
#[must_use]
pub fn next_top_of_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let truncated = local
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local);
    let next = truncated + chrono::Duration::hours(1);
    // Resolve DST ambiguity deterministically toward the earlier instant.
    match Local.from_local_datetime(&next.naive_local()) {
        chrono::LocalResult::Single(t) | chrono::LocalResult::Ambiguous(t, _) => {
            t.with_timezone(&Utc)
        }
        chrono::LocalResult::None => next.with_timezone(&Utc),
    }
}
