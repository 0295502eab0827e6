//! One worker per persisted instance
//!
//! A `WorkerInstance` owns an instance's state machine, its last-known
//! egress IP, its sticky proxy session token and its failure memory. The
//! active phase (Launching through Voting) runs as a single spawned task;
//! the `attempt_active` latch guarantees no two tasks for the same instance
//! ever coexist. Workers never mutate the supervisor's maps directly — all
//! transitions are published as [`WorkerEvent`] messages.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::{VoteDriver, VoteSession};
use crate::config::FleetConfig;
use crate::cooldown::{self, InstanceTimes};
use crate::events::{InstanceSnapshot, ObservationBus};
use crate::global_limit::{GateSnapshot, GlobalLimitGate};
use crate::launch_gate::{InitError, LaunchGate};
use crate::proxy::EgressProvider;
use crate::session_store::{InstanceId, SessionInfo, SessionRecord, SessionStore, StorageState};
use crate::vote_log::{FailureKind, VoteAttempt, VoteLog, VoteStatus};

use super::attempt::{self, VoteOutcome};
use super::state::{PauseReason, WorkerState};

/// Everything a worker needs to run attempts; shared across the fleet
pub struct WorkerDeps {
    pub config: Arc<FleetConfig>,
    pub driver: Arc<dyn VoteDriver>,
    pub proxy: Arc<dyn EgressProvider>,
    pub launch_gate: Arc<LaunchGate>,
    pub global_gate: Arc<GlobalLimitGate>,
    pub store: SessionStore,
    pub log: VoteLog,
    pub bus: ObservationBus,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Messages workers publish to the supervisor's single-writer loop
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// State changed; the supervisor updates `by_instance`/`by_ip` atomically
    Transition {
        instance_id: InstanceId,
        state: WorkerState,
        egress_ip: Option<String>,
    },
    /// First observer of the hourly limit; the supervisor fans out the pause
    GlobalLimitHit {
        instance_id: InstanceId,
        reactivation: DateTime<Utc>,
    },
    /// Active phase ended (any outcome)
    AttemptFinished { instance_id: InstanceId },
}

pub struct WorkerInstance {
    instance_id: InstanceId,
    name: String,
    deps: Arc<WorkerDeps>,
    /// Frozen at worker creation; a config change only affects workers
    /// created afterwards
    voting_url: String,
    state: RwLock<WorkerState>,
    egress_ip: RwLock<Option<String>>,
    /// Sticky proxy session token; cleared after an IP mismatch so the next
    /// attempt requests a fresh egress
    session_token: RwLock<Option<String>>,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_attempt: RwLock<Option<DateTime<Utc>>>,
    last_failure_reason: RwLock<Option<String>>,
    /// Derived display value only; the log stores page-scraped counts
    vote_count: AtomicU64,
    attempt_active: AtomicBool,
}

impl WorkerInstance {
    /// Build a worker for a persisted instance.
    ///
    /// `last_success` comes from the vote log (the preferred source);
    /// `info` seeds display fields from the session folder.
    #[must_use]
    pub fn new(
        instance_id: InstanceId,
        deps: Arc<WorkerDeps>,
        last_success: Option<DateTime<Utc>>,
        info: Option<&SessionInfo>,
    ) -> Arc<Self> {
        let voting_url = deps.config.voting_url.clone();
        Arc::new(Self {
            instance_id,
            name: format!("instance_{instance_id}"),
            deps,
            voting_url,
            state: RwLock::new(WorkerState::Idle),
            egress_ip: RwLock::new(info.and_then(|i| i.proxy_ip.clone())),
            session_token: RwLock::new(info.and_then(|i| i.session_id.clone())),
            last_success: RwLock::new(
                last_success.or_else(|| info.and_then(|i| i.last_vote_time)),
            ),
            last_attempt: RwLock::new(None),
            last_failure_reason: RwLock::new(None),
            vote_count: AtomicU64::new(info.map(|i| i.vote_count).unwrap_or(0)),
            attempt_active: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state.read().clone()
    }

    #[must_use]
    pub fn egress_ip(&self) -> Option<String> {
        self.egress_ip.read().clone()
    }

    #[must_use]
    pub fn is_attempt_active(&self) -> bool {
        self.attempt_active.load(Ordering::Acquire)
    }

    /// Cooldown-relevant times for the eligibility clock
    #[must_use]
    pub fn instance_times(&self) -> InstanceTimes {
        InstanceTimes {
            last_success: *self.last_success.read(),
            retry_until: self.state.read().retry_until(),
        }
    }

    /// Control-plane view of this worker
    #[must_use]
    pub fn snapshot(&self, gate: &GateSnapshot, now: DateTime<Utc>) -> InstanceSnapshot {
        let times = self.instance_times();
        let cooldown = self.deps.config.vote_cooldown;
        InstanceSnapshot {
            instance_id: self.instance_id,
            ip: self.egress_ip(),
            state: self.state.read().name().to_string(),
            seconds_remaining: cooldown::seconds_until_eligible(&times, cooldown, gate, now),
            next_vote_time: cooldown::next_vote_time(&times, cooldown, gate, now),
            vote_count: self.vote_count.load(Ordering::Acquire),
            last_success: times.last_success,
            last_attempt: *self.last_attempt.read(),
            last_failure_reason: self.last_failure_reason.read().clone(),
        }
    }

    /// Ready = Idle, no live attempt, no cooldown remainder, gate permitting
    #[must_use]
    pub fn is_ready(&self, gate: &GateSnapshot, now: DateTime<Utc>) -> bool {
        if self.is_attempt_active() || !gate.permits_launch() {
            return false;
        }
        if !matches!(*self.state.read(), WorkerState::Idle) {
            return false;
        }
        cooldown::seconds_until_eligible(
            &self.instance_times(),
            self.deps.config.vote_cooldown,
            gate,
            now,
        ) == 0
    }

    /// Fan-out entry of the global pause. Active-phase workers are skipped:
    /// their own task observes the gate and parks itself.
    pub async fn pause_for_global(&self, until: DateTime<Utc>) {
        let current = self.state();
        if current.is_operator_owned() || current.is_active_phase() || current.is_globally_paused()
        {
            return;
        }
        self.set_state(WorkerState::Paused {
            reason: PauseReason::GlobalHourlyLimit,
            until: Some(until),
        })
        .await;
    }

    /// Staggered-resume release: the only path out of a global pause
    pub async fn release_from_global(&self) {
        if self.state().is_globally_paused() {
            self.set_state(WorkerState::Idle).await;
            self.deps
                .bus
                .log("info", format!("{}: resumed after global limit", self.name));
        }
    }

    /// Auto-resume sweep: elapsed cooldowns/retries go back to Idle.
    /// Never fires while the gate or the staggered resume is in progress.
    pub async fn mark_idle_if_eligible(&self, gate: &GateSnapshot, now: DateTime<Utc>) -> bool {
        if !gate.permits_launch() {
            return false;
        }
        let eligible = match self.state() {
            WorkerState::Cooldown { until } | WorkerState::RetryScheduled { until, .. } => {
                now >= until
            }
            _ => false,
        };
        if eligible {
            self.set_state(WorkerState::Idle).await;
        }
        eligible
    }

    /// Spawn the active phase, unless one is already running.
    pub fn spawn_attempt(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .attempt_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let worker = Arc::clone(self);
        Some(tokio::spawn(async move { worker.run_attempt().await }))
    }

    /// One complete attempt: Launching -> Navigating -> Voting -> exit state
    async fn run_attempt(self: Arc<Self>) {
        // The gate read is the authoritative latch; even a supervisor
        // request must not start a launch while the gate is active.
        if !self.deps.global_gate.snapshot().await.permits_launch() {
            self.attempt_active.store(false, Ordering::Release);
            return;
        }

        *self.last_attempt.write() = Some(Utc::now());
        let mut row = VoteAttempt::new(self.instance_id, &self.voting_url);

        self.set_state(WorkerState::Launching).await;
        let (outcome, captured) = self.launch_and_vote(&mut row).await;
        self.finish(outcome, captured, row).await;

        self.attempt_active.store(false, Ordering::Release);
        let _ = self.deps.events.send(WorkerEvent::AttemptFinished {
            instance_id: self.instance_id,
        });
    }

    /// Acquire gate + proxy + browser, drive the page, and tear down.
    ///
    /// Post-condition on every path: the browser session is fully closed
    /// before this returns, so the exit transition in `finish` is never
    /// observable while handles are live.
    async fn launch_and_vote(
        &self,
        row: &mut VoteAttempt,
    ) -> (VoteOutcome, Option<StorageState>) {
        let permit = match self.deps.launch_gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return (
                    VoteOutcome::Failure {
                        kind: FailureKind::NavigationFailure,
                        detail: e.to_string(),
                    },
                    None,
                )
            }
        };

        let token = self
            .session_token
            .read()
            .clone()
            .unwrap_or_else(fresh_session_token);
        *self.session_token.write() = Some(token.clone());
        row.session_id = Some(token.clone());

        let lease = match self.deps.proxy.acquire_egress(&token).await {
            Ok(lease) => lease,
            Err(e) => {
                debug!(instance_id = self.instance_id, error = %e, "proxy acquisition failed");
                return (
                    VoteOutcome::Failure {
                        kind: FailureKind::ProxyUnavailable,
                        detail: e.to_string(),
                    },
                    None,
                );
            }
        };
        row.proxy_ip = lease.ip.clone();
        *self.egress_ip.write() = Some(lease.ip.clone());

        let storage = match self.deps.store.load(self.instance_id).await {
            Ok(record) => Some(record.storage),
            Err(e) => {
                debug!(instance_id = self.instance_id, error = %e, "no stored session state");
                None
            }
        };

        let opened = self
            .deps
            .launch_gate
            .init_within_deadline(self.deps.driver.open(&lease.connection, storage))
            .await;
        // Init finished one way or the other; free the slot for the next
        // launch before the (long) page phase.
        drop(permit);

        let mut session = match opened {
            Ok(session) => session,
            Err(InitError::Timeout(t)) => {
                warn!(
                    instance_id = self.instance_id,
                    "browser init force-closed after {}s", t.as_secs()
                );
                return (
                    VoteOutcome::Failure {
                        kind: FailureKind::BrowserInitTimeout,
                        detail: format!("init exceeded {}s", t.as_secs()),
                    },
                    None,
                );
            }
            Err(InitError::Failed(e)) => {
                return (
                    VoteOutcome::Failure {
                        kind: FailureKind::NavigationFailure,
                        detail: format!("browser construction failed: {e}"),
                    },
                    None,
                )
            }
        };

        self.set_state(WorkerState::Navigating).await;
        let outcome = match self.drive_page(session.as_ref(), row).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Final backstop: unknown faults become NavigationFailure.
                warn!(instance_id = self.instance_id, error = %e, "attempt failed");
                VoteOutcome::Failure {
                    kind: FailureKind::NavigationFailure,
                    detail: e.to_string(),
                }
            }
        };

        let captured = if matches!(outcome, VoteOutcome::Success { .. }) {
            session
                .storage_state(self.deps.config.page_read_timeout)
                .await
                .map_err(|e| debug!(error = %e, "storage capture failed"))
                .ok()
        } else {
            None
        };

        session.close().await;
        row.browser_closed = true;

        (outcome, captured)
    }

    async fn drive_page(
        &self,
        session: &dyn VoteSession,
        row: &mut VoteAttempt,
    ) -> anyhow::Result<VoteOutcome> {
        let cfg = &self.deps.config;
        session
            .navigate(&self.voting_url, cfg.page_load_timeout)
            .await?;

        if let Some(outcome) = attempt::pre_click_scan(session, cfg).await? {
            return Ok(outcome);
        }

        self.set_state(WorkerState::Voting).await;
        let phase = attempt::cast_vote(session, cfg, &self.deps.global_gate).await?;
        row.time_of_click = phase.time_of_click;
        Ok(phase.outcome)
    }

    /// Log the attempt and make the exit transition
    async fn finish(
        &self,
        outcome: VoteOutcome,
        captured: Option<StorageState>,
        mut row: VoteAttempt,
    ) {
        let now = Utc::now();
        let cooldown = chrono::Duration::from_std(self.deps.config.vote_cooldown)
            .unwrap_or_else(|_| chrono::Duration::minutes(31));
        let retry = chrono::Duration::from_std(self.deps.config.retry_delay)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        if matches!(outcome, VoteOutcome::Interrupted) {
            // No row of its own: the worker that scraped the limit logs it.
            let gate = self.deps.global_gate.snapshot().await;
            self.set_state(WorkerState::Paused {
                reason: PauseReason::GlobalHourlyLimit,
                until: gate.reactivation_time,
            })
            .await;
            self.deps.bus.log(
                "info",
                format!("{}: paused mid-attempt by hourly limit", self.name),
            );
            return;
        }

        row.failure_kind = outcome.failure_kind();
        row.failure_reason = outcome.user_reason();
        match &outcome {
            VoteOutcome::Success {
                initial,
                final_count,
                clicks,
            } => {
                row.status = VoteStatus::Success;
                row.initial_vote_count = Some(*initial);
                row.final_vote_count = Some(*final_count);
                row.click_attempts = *clicks;
            }
            VoteOutcome::GlobalLimit {
                message,
                scraped_count,
            } => {
                row.cooldown_message = message.clone();
                // Hourly-limit rows must carry the scraped count when the
                // page supplied one.
                row.final_vote_count = *scraped_count;
            }
            VoteOutcome::InstanceCooldown { message } => {
                row.cooldown_message = message.clone();
            }
            VoteOutcome::IpMismatch { message, .. } => {
                row.cooldown_message = message.clone();
            }
            VoteOutcome::ClickFailed { clicks, detail } => {
                row.click_attempts = *clicks;
                row.error_message = detail.clone();
            }
            VoteOutcome::CountUnchanged {
                clicks,
                detail,
                initial,
                final_count,
            } => {
                row.click_attempts = *clicks;
                row.error_message = detail.clone();
                row.initial_vote_count = *initial;
                row.final_vote_count = *final_count;
            }
            VoteOutcome::Failure { detail, .. } => {
                row.error_message = detail.clone();
            }
            VoteOutcome::LoginRequired
            | VoteOutcome::ButtonMissing
            | VoteOutcome::Interrupted => {}
        }

        if let Err(e) = self.deps.log.append(row.clone()).await {
            error!(instance_id = self.instance_id, error = %e, "vote log append failed");
        }

        match outcome {
            VoteOutcome::Success { final_count, .. } => {
                *self.last_success.write() = Some(row.timestamp);
                *self.last_failure_reason.write() = None;
                self.vote_count.store(final_count, Ordering::Release);
                self.persist_session(captured, final_count, row.timestamp)
                    .await;
                let until = row.timestamp + cooldown;
                info!(
                    instance_id = self.instance_id,
                    final_count, "vote recorded; entering cooldown"
                );
                self.deps.bus.log(
                    "info",
                    format!(
                        "{}: vote recorded ({final_count}), cooling down until {until}",
                        self.name
                    ),
                );
                self.set_state(WorkerState::Cooldown { until }).await;
            }
            VoteOutcome::GlobalLimit { .. } => {
                let (newly, reactivation) = self.deps.global_gate.activate(now).await;
                if newly {
                    let _ = self.deps.events.send(WorkerEvent::GlobalLimitHit {
                        instance_id: self.instance_id,
                        reactivation,
                    });
                }
                *self.last_failure_reason.write() = Some(row.failure_reason.clone());
                self.deps.bus.log(
                    "warn",
                    format!(
                        "{}: hourly voting limit reached; fleet paused until {reactivation}",
                        self.name
                    ),
                );
                self.set_state(WorkerState::Paused {
                    reason: PauseReason::GlobalHourlyLimit,
                    until: Some(reactivation),
                })
                .await;
            }
            VoteOutcome::InstanceCooldown { .. } => {
                // No recorded success (fresh session met by the cooldown
                // message): fall back to a full window from now.
                let until = self
                    .last_success
                    .read()
                    .map(|ls| ls + cooldown)
                    .unwrap_or(now + cooldown);
                *self.last_failure_reason.write() = Some(row.failure_reason.clone());
                self.deps
                    .bus
                    .log("info", format!("{}: already in cooldown period", self.name));
                self.set_state(WorkerState::Cooldown { until }).await;
            }
            VoteOutcome::IpMismatch { .. } => {
                // Fresh session token next attempt => fresh egress IP.
                *self.session_token.write() = None;
                *self.last_failure_reason.write() = Some(row.failure_reason.clone());
                self.deps
                    .bus
                    .log("warn", format!("{}: {}", self.name, row.failure_reason));
                self.set_state(WorkerState::RetryScheduled {
                    until: now + retry,
                    kind: FailureKind::ProxyIpMismatch,
                })
                .await;
            }
            VoteOutcome::LoginRequired => {
                *self.last_failure_reason.write() = Some(row.failure_reason.clone());
                self.deps.bus.log(
                    "warn",
                    format!("{}: login required - needs operator attention", self.name),
                );
                self.set_state(WorkerState::AwaitingLogin).await;
            }
            VoteOutcome::ButtonMissing | VoteOutcome::ClickFailed { .. } => {
                *self.last_failure_reason.write() = Some(row.failure_reason.clone());
                self.deps
                    .bus
                    .log("warn", format!("{}: {}", self.name, row.failure_reason));
                self.set_state(WorkerState::RetryScheduled {
                    until: now + retry,
                    kind: FailureKind::ClickFailed,
                })
                .await;
            }
            VoteOutcome::CountUnchanged { .. } => {
                *self.last_failure_reason.write() = Some(row.failure_reason.clone());
                self.deps
                    .bus
                    .log("warn", format!("{}: {}", self.name, row.failure_reason));
                self.set_state(WorkerState::RetryScheduled {
                    until: now + retry,
                    kind: FailureKind::CountUnchanged,
                })
                .await;
            }
            VoteOutcome::Failure { kind, .. } => {
                *self.last_failure_reason.write() = Some(row.failure_reason.clone());
                self.deps
                    .bus
                    .log("warn", format!("{}: {}", self.name, row.failure_reason));
                self.set_state(WorkerState::RetryScheduled {
                    until: now + retry,
                    kind,
                })
                .await;
            }
            VoteOutcome::Interrupted => {}
        }
    }

    /// Update the session folder after a successful vote
    async fn persist_session(
        &self,
        captured: Option<StorageState>,
        final_count: u64,
        voted_at: DateTime<Utc>,
    ) {
        let existing = self.deps.store.load(self.instance_id).await.ok();
        let storage = captured
            .or_else(|| existing.as_ref().map(|r| r.storage.clone()))
            .unwrap_or_default();
        let record = SessionRecord {
            info: SessionInfo {
                instance_id: self.instance_id,
                proxy_ip: self.egress_ip(),
                session_id: self.session_token.read().clone(),
                last_vote_time: Some(voted_at),
                vote_count: final_count,
            },
            storage,
        };
        if let Err(e) = self.deps.store.save(&record).await {
            error!(instance_id = self.instance_id, error = %e, "session save failed");
        }
    }

    /// Guarded single point of mutation for the state machine
    async fn set_state(&self, new: WorkerState) {
        {
            let mut state = self.state.write();
            if *state == new {
                return;
            }
            debug!(
                instance_id = self.instance_id,
                from = state.name(),
                to = new.name(),
                "worker transition"
            );
            *state = new.clone();
        }
        let gate = self.deps.global_gate.snapshot().await;
        let snapshot = self.snapshot(&gate, Utc::now());
        self.deps.bus.publish_instance(snapshot, true);
        let _ = self.deps.events.send(WorkerEvent::Transition {
            instance_id: self.instance_id,
            state: new,
            egress_ip: self.egress_ip(),
        });
    }
}

/// Opaque token the proxy provider keys sticky sessions on; a new token
/// yields a new egress IP
fn fresh_session_token() -> String {
    use rand::distr::Alphanumeric;
    use rand::Rng;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("instance_id", &self.instance_id)
            .field("state", &self.state.read().name())
            .field("egress_ip", &*self.egress_ip.read())
            .finish_non_exhaustive()
    }
}
