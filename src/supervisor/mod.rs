//! Top-level fleet supervision
//!
//! The Supervisor owns every periodic job (session scanner, auto-resume
//! monitor, gate ticker, status publisher) and the worker registry. The
//! registry is TWO maps — `by_instance` and `by_ip` — behind one lock,
//! updated together in the same critical section by the single event-loop
//! writer consuming worker transition messages. Workers never touch the
//! maps; re-keying bugs come from exactly that.

mod auto_resume;
mod scanner;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::VoteDriver;
use crate::config::FleetConfig;
use crate::cooldown::{self, InstanceTimes};
use crate::events::{InstanceSnapshot, ObservationBus, ObservationEvent, StatusSnapshot};
use crate::global_limit::{GlobalLimitGate, PausedFleet};
use crate::launch_gate::LaunchGate;
use crate::proxy::{EgressProvider, ProxyBroker};
use crate::session_store::{InstanceId, SessionStore};
use crate::vote_log::VoteLog;
use crate::worker::{WorkerDeps, WorkerEvent, WorkerInstance};

/// How long `stop` polls for active attempts to drain before aborting them
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Merged view for `GET /api/sessions`: persisted data, overridden by live
/// worker data for any instance currently owned
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub instance_id: InstanceId,
    pub proxy_ip: Option<String>,
    pub session_id: Option<String>,
    pub last_vote_time: Option<DateTime<Utc>>,
    pub vote_count: u64,
    /// True when a live worker currently owns this instance
    pub live: bool,
    pub state: Option<String>,
}

#[derive(Default)]
struct WorkerMaps {
    by_instance: HashMap<InstanceId, Arc<WorkerInstance>>,
    by_ip: HashMap<String, Arc<WorkerInstance>>,
}

/// State shared by the supervisor's jobs
pub(crate) struct FleetShared {
    deps: Arc<WorkerDeps>,
    workers: parking_lot::RwLock<WorkerMaps>,
    attempts: parking_lot::Mutex<HashMap<InstanceId, JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl FleetShared {
    fn config(&self) -> &FleetConfig {
        &self.deps.config
    }

    fn worker(&self, instance_id: InstanceId) -> Option<Arc<WorkerInstance>> {
        self.workers.read().by_instance.get(&instance_id).cloned()
    }

    fn all_workers(&self) -> Vec<Arc<WorkerInstance>> {
        self.workers.read().by_instance.values().cloned().collect()
    }

    fn owned_instances(&self) -> Vec<InstanceId> {
        self.workers.read().by_instance.keys().copied().collect()
    }

    /// Both maps update in one critical section; the `by_ip` key domain is
    /// the egress IP and nothing else.
    fn apply_transition(&self, instance_id: InstanceId, egress_ip: Option<String>) {
        let mut maps = self.workers.write();
        let Some(worker) = maps.by_instance.get(&instance_id).cloned() else {
            return;
        };
        maps.by_ip
            .retain(|ip, w| !(w.instance_id() == instance_id && Some(ip.as_str()) != egress_ip.as_deref()));
        if let Some(ip) = egress_ip {
            if let Some(existing) = maps.by_ip.get(&ip) {
                if existing.instance_id() != instance_id {
                    warn!(
                        ip = %ip,
                        holder = existing.instance_id(),
                        claimer = instance_id,
                        "egress IP claimed by two instances; keeping latest"
                    );
                }
            }
            maps.by_ip.insert(ip, worker);
        }
    }

    /// Move every worker outside operator-owned states into the global pause
    async fn pause_all(&self, reactivation: DateTime<Utc>) {
        let workers = self.all_workers();
        for worker in workers {
            worker.pause_for_global(reactivation).await;
        }
        self.deps.bus.log(
            "warn",
            format!("global hourly limit: fleet paused until {reactivation}"),
        );
    }

    /// Create (or fetch) the worker for an instance and start one attempt.
    ///
    /// Returns false when nothing was launched (gate closed, attempt already
    /// live, or the supervisor is shutting down).
    async fn launch(self: &Arc<Self>, instance_id: InstanceId) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        if !self.deps.global_gate.snapshot().await.permits_launch() {
            return false;
        }

        let worker = match self.worker(instance_id) {
            Some(worker) => worker,
            None => {
                let info = self
                    .deps
                    .store
                    .load(instance_id)
                    .await
                    .ok()
                    .map(|record| record.info);
                let last_success = self.deps.log.last_success(instance_id);
                let worker = WorkerInstance::new(
                    instance_id,
                    Arc::clone(&self.deps),
                    last_success,
                    info.as_ref(),
                );
                let mut maps = self.workers.write();
                maps.by_instance
                    .entry(instance_id)
                    .or_insert_with(|| Arc::clone(&worker))
                    .clone()
            }
        };

        match worker.spawn_attempt() {
            Some(handle) => {
                self.attempts.lock().insert(instance_id, handle);
                true
            }
            None => {
                debug!(instance_id, "attempt already active; launch skipped");
                false
            }
        }
    }

    fn status(&self, gate: &crate::global_limit::GateSnapshot) -> StatusSnapshot {
        StatusSnapshot {
            monitoring_active: self.accepting.load(Ordering::Acquire),
            global_limit_active: gate.active,
            reactivation_time: gate.reactivation_time,
        }
    }

    async fn instances_snapshot(&self) -> Vec<InstanceSnapshot> {
        let gate = self.deps.global_gate.snapshot().await;
        let now = Utc::now();
        let mut snapshots: Vec<_> = self
            .all_workers()
            .iter()
            .map(|w| w.snapshot(&gate, now))
            .collect();
        snapshots.sort_by_key(|s| s.instance_id);
        snapshots
    }
}

#[async_trait]
impl PausedFleet for FleetShared {
    fn paused_instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self
            .workers
            .read()
            .by_instance
            .values()
            .filter(|w| w.state().is_globally_paused())
            .map(|w| w.instance_id())
            .collect();
        ids.sort_unstable();
        ids
    }

    async fn release(&self, instance_id: InstanceId) {
        if let Some(worker) = self.worker(instance_id) {
            worker.release_from_global().await;
        }
    }
}

/// Running fleet; dropping without `stop` aborts its jobs unceremoniously
pub struct Supervisor {
    shared: Arc<FleetShared>,
    cancel: CancellationToken,
    jobs: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Build every shared component and start the periodic jobs.
    pub async fn start(
        config: FleetConfig,
        driver: Arc<dyn VoteDriver>,
        log: VoteLog,
        bus: ObservationBus,
    ) -> Result<Self> {
        let proxy: Arc<dyn EgressProvider> = Arc::new(ProxyBroker::new(
            config.proxy.clone(),
            config.proxy_request_timeout,
        ));
        Self::start_with_provider(config, driver, proxy, log, bus).await
    }

    /// `start` with an explicit egress provider; the seam the scenario
    /// harness drives scripted proxies through.
    pub async fn start_with_provider(
        config: FleetConfig,
        driver: Arc<dyn VoteDriver>,
        proxy: Arc<dyn EgressProvider>,
        log: VoteLog,
        bus: ObservationBus,
    ) -> Result<Self> {
        let store = SessionStore::open(&config.storage_root)
            .await
            .context("open session store")?;
        let launch_gate = LaunchGate::new(
            config.max_concurrent_inits,
            config.launch_spacing,
            config.browser_init_timeout,
        );
        let global_gate = GlobalLimitGate::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let config = Arc::new(config);
        let deps = Arc::new(WorkerDeps {
            config: Arc::clone(&config),
            driver,
            proxy,
            launch_gate,
            global_gate: Arc::clone(&global_gate),
            store,
            log,
            bus: bus.clone(),
            events: events_tx,
        });

        let shared = Arc::new(FleetShared {
            deps,
            workers: parking_lot::RwLock::new(WorkerMaps::default()),
            attempts: parking_lot::Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        });

        let cancel = CancellationToken::new();
        let mut jobs = Vec::new();

        jobs.push(tokio::spawn(event_loop(
            Arc::clone(&shared),
            events_rx,
            cancel.clone(),
        )));
        jobs.push(tokio::spawn(scanner::run(
            Arc::clone(&shared),
            cancel.clone(),
        )));
        jobs.push(tokio::spawn(auto_resume::run(
            Arc::clone(&shared),
            cancel.clone(),
        )));
        jobs.push(tokio::spawn(Arc::clone(&global_gate).run_ticker(
            Arc::clone(&shared) as Arc<dyn PausedFleet>,
            config.browser_launch_delay,
            cancel.clone(),
        )));
        jobs.push(tokio::spawn(status_publisher(
            Arc::clone(&shared),
            cancel.clone(),
        )));

        bus.log("info", "monitoring started");
        info!(url = %config.voting_url, "supervisor started");
        Ok(Self {
            shared,
            cancel,
            jobs,
        })
    }

    /// Current fleet status line
    pub async fn status(&self) -> StatusSnapshot {
        let gate = self.shared.deps.global_gate.snapshot().await;
        self.shared.status(&gate)
    }

    /// Sorted per-instance snapshots for the control plane
    pub async fn instances(&self) -> Vec<InstanceSnapshot> {
        self.shared.instances_snapshot().await
    }

    /// Merge of the session store and live worker data (live wins)
    pub async fn sessions(&self) -> Result<Vec<SessionView>> {
        let store = &self.shared.deps.store;
        let gate = self.shared.deps.global_gate.snapshot().await;
        let now = Utc::now();
        let mut views = Vec::new();
        for instance_id in store.list().await? {
            let record = store.load(instance_id).await.ok();
            let live = self.shared.worker(instance_id);
            let view = match live {
                Some(worker) => {
                    let snapshot = worker.snapshot(&gate, now);
                    SessionView {
                        instance_id,
                        proxy_ip: snapshot.ip,
                        session_id: record.as_ref().and_then(|r| r.info.session_id.clone()),
                        last_vote_time: snapshot.last_success,
                        vote_count: snapshot.vote_count,
                        live: true,
                        state: Some(snapshot.state),
                    }
                }
                None => {
                    let info = record.map(|r| r.info);
                    SessionView {
                        instance_id,
                        proxy_ip: info.as_ref().and_then(|i| i.proxy_ip.clone()),
                        session_id: info.as_ref().and_then(|i| i.session_id.clone()),
                        last_vote_time: info.as_ref().and_then(|i| i.last_vote_time),
                        vote_count: info.as_ref().map(|i| i.vote_count).unwrap_or(0),
                        live: false,
                        state: None,
                    }
                }
            };
            views.push(view);
        }
        Ok(views)
    }

    /// Clean shutdown: stop accepting launches, give active attempts the
    /// grace window, then abort whatever is left.
    pub async fn stop(mut self) {
        let grace = self.shared.config().shutdown_grace;
        self.shared.accepting.store(false, Ordering::Release);
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            {
                let mut attempts = self.shared.attempts.lock();
                attempts.retain(|_, handle| !handle.is_finished());
                if attempts.is_empty() {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let mut attempts = self.shared.attempts.lock();
                warn!(
                    remaining = attempts.len(),
                    "shutdown grace exceeded; aborting attempts"
                );
                for (_, handle) in attempts.drain() {
                    handle.abort();
                }
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        for job in std::mem::take(&mut self.jobs) {
            job.abort();
        }
        self.shared.deps.bus.log("info", "monitoring stopped");
        info!("supervisor stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
        for job in &self.jobs {
            job.abort();
        }
    }
}

/// Single writer over the worker maps, fed by worker messages
async fn event_loop(
    shared: Arc<FleetShared>,
    mut rx: mpsc::UnboundedReceiver<WorkerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = cancel.cancelled() => {
                debug!("event loop exiting");
                return;
            }
        };
        let Some(event) = event else { return };
        match event {
            WorkerEvent::Transition {
                instance_id,
                egress_ip,
                ..
            } => {
                shared.apply_transition(instance_id, egress_ip);
            }
            WorkerEvent::GlobalLimitHit { reactivation, .. } => {
                shared.pause_all(reactivation).await;
                let gate = shared.deps.global_gate.snapshot().await;
                let _ = shared
                    .deps
                    .bus
                    .publish(ObservationEvent::StatusUpdate(shared.status(&gate)));
            }
            WorkerEvent::AttemptFinished { instance_id } => {
                shared.attempts.lock().remove(&instance_id);
                let _ = shared.deps.bus.publish(ObservationEvent::StatisticsUpdate(
                    shared.deps.log.session_stats(),
                ));
            }
        }
    }
}

/// Periodic `instances_update` / `statistics_update` / `status_update` push
async fn status_publisher(shared: Arc<FleetShared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }
        let gate = shared.deps.global_gate.snapshot().await;
        let _ = shared
            .deps
            .bus
            .publish(ObservationEvent::StatusUpdate(shared.status(&gate)));
        let _ = shared.deps.bus.publish(ObservationEvent::InstancesUpdate(
            shared.instances_snapshot().await,
        ));
        let _ = shared.deps.bus.publish(ObservationEvent::StatisticsUpdate(
            shared.deps.log.session_stats(),
        ));
    }
}

/// Eligibility inputs for an instance with no live worker
pub(crate) fn stored_instance_times(log: &VoteLog, instance_id: InstanceId) -> InstanceTimes {
    InstanceTimes {
        last_success: log.last_success(instance_id),
        retry_until: None,
    }
}

pub(crate) fn stored_instance_ready(
    log: &VoteLog,
    instance_id: InstanceId,
    cooldown: Duration,
    gate: &crate::global_limit::GateSnapshot,
    now: DateTime<Utc>,
) -> bool {
    cooldown::seconds_until_eligible(&stored_instance_times(log, instance_id), cooldown, gate, now)
        == 0
}
