//! Append-only vote attempt log
//!
//! The single source of truth for cooldown decisions across process
//! restarts. Every attempt — successful or failed — is appended as one CSV
//! row through a dedicated single-writer task; `append` returns only after
//! the row is flushed and fsynced, and the in-memory counters are updated
//! atomically with the write. Rows are immortal once appended.
//!
//! The recorded vote counts are always the values scraped from the page
//! (`final` when read, else `initial`); the per-worker in-memory counter is
//! a derived display value and never lands in the log.

mod writer;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::session_store::InstanceId;

/// Bounded depth of the append queue; publishers block when it fills
const APPEND_QUEUE_DEPTH: usize = 256;

/// Outcome column of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteStatus {
    Success,
    Failed,
}

impl VoteStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Failure classification carried in worker states and log rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    GlobalHourlyLimit,
    /// Ordinary per-instance cooldown (the 31-minute window)
    InstanceCooldown,
    /// The proxy egress IP did not match the instance's recorded IP
    ProxyIpMismatch,
    ClickFailed,
    CountUnchanged,
    NavigationFailure,
    BrowserInitTimeout,
    ProxyUnavailable,
    LoginRequired,
}

impl FailureKind {
    /// The `failure_type` CSV column value
    #[must_use]
    pub fn log_type(self) -> &'static str {
        match self {
            Self::GlobalHourlyLimit => "global_hourly_limit",
            Self::InstanceCooldown => "ip_cooldown",
            Self::ProxyIpMismatch => "proxy_ip_mismatch",
            Self::LoginRequired => "login_required",
            Self::ClickFailed
            | Self::CountUnchanged
            | Self::NavigationFailure
            | Self::BrowserInitTimeout
            | Self::ProxyUnavailable => "technical",
        }
    }

    /// Technical failures retry after the short fixed delay; the rest have
    /// dedicated handling (gate, cooldown, operator attention)
    #[must_use]
    pub fn is_technical(self) -> bool {
        matches!(self.log_type(), "technical" | "proxy_ip_mismatch")
    }
}

/// One appended attempt; field order mirrors the CSV columns
#[derive(Debug, Clone, PartialEq)]
pub struct VoteAttempt {
    pub timestamp: DateTime<Utc>,
    pub instance_id: InstanceId,
    pub instance_name: String,
    pub time_of_click: Option<DateTime<Utc>>,
    pub status: VoteStatus,
    pub voting_url: String,
    /// Cleaned cooldown/limit message scraped from the page, if any
    pub cooldown_message: String,
    pub failure_kind: Option<FailureKind>,
    /// Operator-friendly reason ("Vote count did not increase", ...)
    pub failure_reason: String,
    pub initial_vote_count: Option<u64>,
    pub final_vote_count: Option<u64>,
    pub proxy_ip: String,
    pub session_id: Option<String>,
    pub click_attempts: u32,
    /// Diagnostic detail (scraped button text, page excerpt); never surfaced
    /// to the UI
    pub error_message: String,
    pub browser_closed: bool,
}

impl VoteAttempt {
    /// Empty skeleton the attempt pipeline fills in
    #[must_use]
    pub fn new(instance_id: InstanceId, voting_url: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            instance_id,
            instance_name: format!("instance_{instance_id}"),
            time_of_click: None,
            status: VoteStatus::Failed,
            voting_url: voting_url.to_string(),
            cooldown_message: String::new(),
            failure_kind: None,
            failure_reason: String::new(),
            initial_vote_count: None,
            final_vote_count: None,
            proxy_ip: String::new(),
            session_id: None,
            click_attempts: 0,
            error_message: String::new(),
            browser_closed: true,
        }
    }
}

/// Aggregate counters for the current process lifetime
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct SessionStats {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub hourly_limit_hits: u64,
    /// successful / total, 0.0 when no attempts yet
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    hourly_limit_hits: AtomicU64,
}

struct AppendRequest {
    attempt: VoteAttempt,
    ack: oneshot::Sender<Result<()>>,
}

/// Cloneable handle to the log; all writes funnel through one task
#[derive(Clone)]
pub struct VoteLog {
    tx: mpsc::Sender<AppendRequest>,
    counters: Arc<Counters>,
    last_success: Arc<RwLock<HashMap<InstanceId, DateTime<Utc>>>>,
}

impl VoteLog {
    /// Open (or create) the log, rebuild the per-instance last-success index
    /// from existing rows, and spawn the writer task.
    ///
    /// Counters intentionally start at zero: they describe this process's
    /// session, not the file's full history.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }

        let existing = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let rebuilt = writer::scan_last_success(&existing);
        if !rebuilt.is_empty() {
            info!(
                instances = rebuilt.len(),
                "rebuilt last-success index from vote log"
            );
        }

        let last_success = Arc::new(RwLock::new(rebuilt));
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::channel(APPEND_QUEUE_DEPTH);

        let file = writer::open_append(path, existing.is_empty()).await?;
        tokio::spawn(writer::run_writer(
            file,
            rx,
            Arc::clone(&counters),
            Arc::clone(&last_success),
        ));

        Ok(Self {
            tx,
            counters,
            last_success,
        })
    }

    /// Append one attempt. Returns once the row is durable (flushed and
    /// fsynced) and the counters reflect it. Blocks when the bounded queue
    /// is full.
    pub async fn append(&self, attempt: VoteAttempt) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(AppendRequest { attempt, ack })
            .await
            .map_err(|_| anyhow::anyhow!("vote log writer has shut down"))?;
        done.await
            .map_err(|_| anyhow::anyhow!("vote log writer dropped the append"))?
    }

    /// Snapshot of the per-instance most recent successful vote
    #[must_use]
    pub fn last_success_by_instance(&self) -> HashMap<InstanceId, DateTime<Utc>> {
        self.last_success.read().clone()
    }

    #[must_use]
    pub fn last_success(&self, instance_id: InstanceId) -> Option<DateTime<Utc>> {
        self.last_success.read().get(&instance_id).copied()
    }

    /// Process-lifetime counters for the control plane
    #[must_use]
    pub fn session_stats(&self) -> SessionStats {
        let total = self.counters.total.load(Ordering::Acquire);
        let successful = self.counters.successful.load(Ordering::Acquire);
        SessionStats {
            total_attempts: total,
            successful,
            failed: self.counters.failed.load(Ordering::Acquire),
            hourly_limit_hits: self.counters.hourly_limit_hits.load(Ordering::Acquire),
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
        }
    }
}

impl std::fmt::Debug for VoteLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteLog")
            .field("stats", &self.session_stats())
            .finish_non_exhaustive()
    }
}
