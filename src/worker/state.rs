//! Worker state machine vocabulary
//!
//! Every worker is in exactly one of these states; transitions are guarded
//! and made in one place (`WorkerInstance`). A worker in any non-active
//! state owns no browser resources — the attempt pipeline closes the
//! browser before the exit transition becomes observable.

use chrono::{DateTime, Utc};

use crate::vote_log::FailureKind;

/// Why a worker is parked in `Paused`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// Fleet-wide hourly limit observed on the page
    GlobalHourlyLimit,
}

/// One worker's position in its lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    /// Eligible; waiting for the scanner's one-per-tick pick
    Idle,
    /// Holds (or is queued on) the launch gate; proxy and browser coming up
    Launching,
    /// Page loading and pre-click signal scan
    Navigating,
    /// Button located; clicking and verifying the counter
    Voting,
    /// Waiting out the per-instance window after a vote (or cooldown signal)
    Cooldown { until: DateTime<Utc> },
    /// Parked by the global limit gate until the stated time
    Paused {
        reason: PauseReason,
        until: Option<DateTime<Utc>>,
    },
    /// Login needed; never self-heals, surfaced to the operator
    AwaitingLogin,
    /// Removed from scheduling until a human intervenes
    Excluded { reason: String },
    /// Technical failure; retried after the stated time
    RetryScheduled {
        until: DateTime<Utc>,
        kind: FailureKind,
    },
}

impl WorkerState {
    /// Snake-case state name used in snapshots and the control plane
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Navigating => "navigating",
            Self::Voting => "voting",
            Self::Cooldown { .. } => "cooldown",
            Self::Paused { .. } => "paused",
            Self::AwaitingLogin => "awaiting_login",
            Self::Excluded { .. } => "excluded",
            Self::RetryScheduled { .. } => "retry_scheduled",
        }
    }

    /// True during the active phase, while the worker may own a browser
    #[must_use]
    pub fn is_active_phase(&self) -> bool {
        matches!(self, Self::Launching | Self::Navigating | Self::Voting)
    }

    /// States the global pause must not touch
    #[must_use]
    pub fn is_operator_owned(&self) -> bool {
        matches!(self, Self::AwaitingLogin | Self::Excluded { .. })
    }

    #[must_use]
    pub fn is_globally_paused(&self) -> bool {
        matches!(
            self,
            Self::Paused {
                reason: PauseReason::GlobalHourlyLimit,
                ..
            }
        )
    }

    /// Wall-clock moment the state stops blocking, when it is time-bound
    #[must_use]
    pub fn blocked_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Cooldown { until } | Self::RetryScheduled { until, .. } => Some(*until),
            Self::Paused { until, .. } => *until,
            _ => None,
        }
    }

    /// Pending technical retry deadline, if any
    #[must_use]
    pub fn retry_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RetryScheduled { until, .. } => Some(*until),
            _ => None,
        }
    }
}
