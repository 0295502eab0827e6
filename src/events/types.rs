//! Event payloads streamed to the control plane

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session_store::InstanceId;
use crate::vote_log::SessionStats;

/// Per-instance view published to the control plane
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub ip: Option<String>,
    /// Human-readable state name ("cooldown", "voting", ...)
    pub state: String,
    pub seconds_remaining: u64,
    pub next_vote_time: Option<DateTime<Utc>>,
    pub vote_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
}

/// Fleet-level status line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub monitoring_active: bool,
    pub global_limit_active: bool,
    pub reactivation_time: Option<DateTime<Utc>>,
}

/// One operator-facing log line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl LogLine {
    #[must_use]
    pub fn new(level: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        }
    }
}

/// Everything the bus fans out
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ObservationEvent {
    /// Single-instance change (state transition or coalesced refresh)
    InstanceUpdate(InstanceSnapshot),
    /// Full-fleet refresh for `instances_update` subscribers
    InstancesUpdate(Vec<InstanceSnapshot>),
    StatisticsUpdate(SessionStats),
    StatusUpdate(StatusSnapshot),
    LogUpdate(LogLine),
}
