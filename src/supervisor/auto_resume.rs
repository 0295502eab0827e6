//! Periodic cooldown-expiry sweep
//!
//! Returns workers whose cooldown or retry window elapsed to Idle so the
//! scanner can pick them up. Exists to catch workers whose individual
//! cooldowns expired DURING a global pause and would otherwise sit in
//! Cooldown forever. Marking eligible never launches anything — the
//! scanner's one-per-tick rule still applies — and the sweep stays
//! completely silent while the gate is active or a staggered resume is in
//! progress.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::FleetShared;

pub(super) async fn run(shared: Arc<FleetShared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config().auto_resume_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => {
                debug!("auto-resume monitor exiting");
                return;
            }
        }

        let gate = shared.deps.global_gate.snapshot().await;
        if !gate.permits_launch() {
            // Unpausing during the staggered-resume window doubles the
            // effective launch rate; the gate owns releases until it clears.
            continue;
        }
        let now = Utc::now();
        for worker in shared.all_workers() {
            if worker.mark_idle_if_eligible(&gate, now).await {
                debug!(
                    instance_id = worker.instance_id(),
                    "cooldown elapsed; worker marked eligible"
                );
            }
        }
    }
}
