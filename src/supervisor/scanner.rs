//! Periodic ready-instance scanner
//!
//! Every tick: snapshot which instances a live worker already owns,
//! enumerate the session store, partition the rest by the cooldown clock,
//! and launch AT MOST ONE ready candidate. One-per-tick is the contract,
//! not an optimization: queuing every ready candidate behind the launch
//! gate keeps N browsers alive serially and defeats the memory cap.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{stored_instance_ready, FleetShared};

pub(super) async fn run(shared: Arc<FleetShared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config().session_scan_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => {
                debug!("ready scanner exiting");
                return;
            }
        }
        scan_once(&shared).await;
    }
}

async fn scan_once(shared: &Arc<FleetShared>) {
    use std::sync::atomic::Ordering;
    if !shared.accepting.load(Ordering::Acquire) {
        return;
    }
    let gate = shared.deps.global_gate.snapshot().await;
    if !gate.permits_launch() {
        debug!("scan skipped: global gate active or staggered resume running");
        return;
    }
    let now = Utc::now();
    let cooldown = shared.config().vote_cooldown;

    // Ready = existing Idle workers with no remainder, plus stored sessions
    // nobody owns yet.
    let mut ready: BTreeSet<_> = shared
        .all_workers()
        .iter()
        .filter(|w| w.is_ready(&gate, now))
        .map(|w| w.instance_id())
        .collect();

    let owned: BTreeSet<_> = shared.owned_instances().into_iter().collect();
    match shared.deps.store.list().await {
        Ok(stored) => {
            for instance_id in stored {
                if owned.contains(&instance_id) {
                    continue;
                }
                if stored_instance_ready(&shared.deps.log, instance_id, cooldown, &gate, now) {
                    ready.insert(instance_id);
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "session store scan failed");
        }
    }

    let mut ready = ready.into_iter();
    let Some(picked) = ready.next() else {
        return;
    };
    let waiting: Vec<_> = ready.collect();
    if !waiting.is_empty() {
        info!(
            picked,
            waiting = waiting.len(),
            "one instance launched per tick; the rest wait"
        );
        shared.deps.bus.log(
            "info",
            format!(
                "instance_{picked} launching; {} ready instance(s) waiting for next scan",
                waiting.len()
            ),
        );
    }
    if shared.launch(picked).await {
        debug!(instance_id = picked, "scanner launched instance");
    }
}
