//! Vote-eligibility arithmetic
//!
//! Composes the per-instance cooldown floor with the fleet-wide hourly-limit
//! gate. The two constraints compose as a maximum: a worker votes only when
//! both have cleared. Countdowns surfaced to the control plane come from
//! here, so the displayed remainder never sits at zero while a worker is
//! actually blocked on the gate.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::global_limit::GateSnapshot;

/// Inputs describing one instance's cooldown-relevant history
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceTimes {
    /// Most recent successful vote, from the vote log (survives restarts)
    pub last_success: Option<DateTime<Utc>>,
    /// End of a scheduled technical retry, if one is pending
    pub retry_until: Option<DateTime<Utc>>,
}

/// Seconds until the instance may vote again; 0 means eligible now.
///
/// While the global gate is active the result is the LARGER of the global
/// remainder and the individual 31-minute floor, so a worker whose own
/// cooldown outlives the gate keeps counting down past the reactivation
/// time.
#[must_use]
pub fn seconds_until_eligible(
    times: &InstanceTimes,
    cooldown: Duration,
    gate: &GateSnapshot,
    now: DateTime<Utc>,
) -> u64 {
    let cooldown =
        chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
    let individual_floor = times
        .last_success
        .map(|ls| remaining_secs(ls + cooldown, now))
        .unwrap_or(0);

    if gate.active {
        let global_remaining = gate
            .reactivation_time
            .map(|t| remaining_secs(t, now))
            .unwrap_or(0);
        return global_remaining.max(individual_floor);
    }

    if let Some(until) = times.retry_until {
        return remaining_secs(until, now);
    }

    individual_floor
}

/// Wall-clock instant at which the instance becomes eligible, if any wait
/// remains
#[must_use]
pub fn next_vote_time(
    times: &InstanceTimes,
    cooldown: Duration,
    gate: &GateSnapshot,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let secs = seconds_until_eligible(times, cooldown, gate, now);
    if secs == 0 {
        None
    } else {
        Some(now + chrono::Duration::seconds(secs as i64))
    }
}

fn remaining_secs(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (until - now).num_seconds().max(0) as u64
}
