//! End-to-end worker attempts against scripted pages
//!
//! Drives full Launching -> Navigating -> Voting -> exit transitions through
//! the public worker API with a fake driver and egress provider.

mod common;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use common::{test_config, FakeDriver, FakeEgress, PageScript, UnavailableEgress};
use votefleet::{
    ElementProbe, FailureKind, FleetConfig, GlobalLimitGate, LaunchGate, ObservationBus,
    SessionInfo, SessionRecord, SessionStore, StorageState, VoteLog, WorkerDeps, WorkerEvent,
    WorkerInstance, WorkerState,
};

struct Harness {
    _dir: TempDir,
    config: Arc<FleetConfig>,
    store: SessionStore,
    log: VoteLog,
    gate: Arc<GlobalLimitGate>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    deps: Arc<WorkerDeps>,
}

async fn harness_with(
    config_tweak: impl FnOnce(&mut FleetConfig),
    driver: impl FnOnce(&FleetConfig) -> Arc<FakeDriver>,
    proxy: Arc<dyn votefleet::EgressProvider>,
) -> (Harness, Arc<FakeDriver>) {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config_tweak(&mut config);
    let config = Arc::new(config);
    let driver = driver(&config);

    let store = SessionStore::open(dir.path()).await.unwrap();
    store
        .save(&SessionRecord {
            info: SessionInfo {
                instance_id: 1,
                proxy_ip: None,
                session_id: None,
                last_vote_time: None,
                vote_count: 0,
            },
            storage: StorageState::default(),
        })
        .await
        .unwrap();

    let log = VoteLog::open(&dir.path().join("vote_log.csv")).await.unwrap();
    let gate = GlobalLimitGate::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let deps = Arc::new(WorkerDeps {
        config: Arc::clone(&config),
        driver: driver.clone() as Arc<dyn votefleet::VoteDriver>,
        proxy,
        launch_gate: LaunchGate::new(1, Duration::ZERO, config.browser_init_timeout),
        global_gate: Arc::clone(&gate),
        store: store.clone(),
        log: log.clone(),
        bus: ObservationBus::new(256, 100),
        events: tx,
    });

    (
        Harness {
            _dir: dir,
            config,
            store,
            log,
            gate,
            events: rx,
            deps,
        },
        driver,
    )
}

async fn run_one(h: &Harness) -> Arc<WorkerInstance> {
    let worker = WorkerInstance::new(1, Arc::clone(&h.deps), None, None);
    let handle = worker.spawn_attempt().expect("attempt should start");
    handle.await.unwrap();
    worker
}

#[tokio::test]
async fn happy_vote_enters_cooldown_and_persists() {
    let (h, driver) = harness_with(
        |_| {},
        |c| FakeDriver::single(c, PageScript::default()),
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;

    let WorkerState::Cooldown { until } = worker.state() else {
        panic!("expected cooldown, got {:?}", worker.state());
    };
    let remaining = (until - Utc::now()).num_seconds();
    assert!(
        (remaining - 31 * 60).abs() <= 5,
        "cooldown should be ~31 minutes, got {remaining}s"
    );

    let stats = h.log.session_stats();
    assert_eq!(stats.total_attempts, 1);
    assert_eq!(stats.successful, 1);
    assert!(h.log.last_success(1).is_some());

    // Session folder updated with the page-scraped count and the egress IP.
    let record = h.store.load(1).await.unwrap();
    assert_eq!(record.info.vote_count, 101);
    assert_eq!(record.info.proxy_ip.as_deref(), Some("1.1.1.1"));
    assert_eq!(worker.egress_ip().as_deref(), Some("1.1.1.1"));

    // Browser fully released.
    assert!(driver
        .probe(0)
        .closed
        .load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn counter_delta_wins_over_post_click_boilerplate() {
    // The thank-you page also carries persistent cooldown/limit reminders.
    // A +1 delta must still count as a success and must not pause anyone.
    let (h, _driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    body: "Cast your vote below. 100 votes so far".to_string(),
                    body_after_click: Some(
                        "Thank you for voting! Note: there is an hourly limit; \
                         wait before voting again."
                            .to_string(),
                    ),
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;

    assert!(matches!(worker.state(), WorkerState::Cooldown { .. }));
    let stats = h.log.session_stats();
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.hourly_limit_hits, 0);
    assert!(!h.gate.snapshot().await.active);
}

#[tokio::test]
async fn ip_mismatch_is_instance_scoped_and_rotates_the_session_token() {
    let proxy = FakeEgress::new(&["1.1.1.1"]);
    let (h, _driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    body: "Someone has already voted out of this IP address: 9.9.9.9".to_string(),
                    ..PageScript::default()
                },
            )
        },
        proxy.clone(),
    )
    .await;

    let worker = run_one(&h).await;
    let state = worker.state();
    assert!(
        matches!(
            &state,
            WorkerState::RetryScheduled {
                kind: FailureKind::ProxyIpMismatch,
                ..
            }
        ),
        "got {state:?}"
    );

    // The anomaly never becomes a fleet-wide pause.
    assert!(!h.gate.snapshot().await.active);
    assert_eq!(h.log.session_stats().failed, 1);

    // A second attempt requests a brand-new session token.
    let handle = worker.spawn_attempt().expect("retry attempt");
    handle.await.unwrap();
    let tokens = proxy.tokens_seen.lock().clone();
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1], "mismatch must rotate the token");
}

#[tokio::test]
async fn hourly_limit_activates_the_gate_and_parks_the_worker() {
    let (mut h, driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    body: "The hourly voting limit has been reached.".to_string(),
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;

    let worker = run_one(&h).await;
    assert!(worker.state().is_globally_paused());

    let snap = h.gate.snapshot().await;
    assert!(snap.active);
    let reactivation = snap.reactivation_time.expect("reactivation set");
    assert!(reactivation > Utc::now());

    assert_eq!(h.log.session_stats().hourly_limit_hits, 1);

    // The first observer reports the hit so the supervisor can fan out.
    let mut saw_hit = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, WorkerEvent::GlobalLimitHit { .. }) {
            saw_hit = true;
        }
    }
    assert!(saw_hit);
    assert!(driver
        .probe(0)
        .closed
        .load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn hung_page_read_becomes_navigation_failure_with_browser_closed() {
    let (h, driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    body_read_delay: Duration::from_secs(5),
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;

    let worker = run_one(&h).await;
    let state = worker.state();
    assert!(
        matches!(
            &state,
            WorkerState::RetryScheduled {
                kind: FailureKind::NavigationFailure,
                ..
            }
        ),
        "got {state:?}"
    );
    assert!(driver
        .probe(0)
        .closed
        .load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn login_text_alone_is_not_login_detection() {
    // The phrase appears in page TEXT but no login element exists.
    let (h, _driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    body: "New here? Login with Google for updates. 100 votes".to_string(),
                    login_probe: None,
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    assert!(matches!(worker.state(), WorkerState::Cooldown { .. }));
    assert_eq!(h.log.session_stats().successful, 1);
}

#[tokio::test]
async fn invisible_login_element_is_not_login_detection() {
    let (h, _driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    login_probe: Some(ElementProbe {
                        visible: false,
                        text: "Login with Google".to_string(),
                    }),
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    assert!(matches!(worker.state(), WorkerState::Cooldown { .. }));
}

#[tokio::test]
async fn visible_login_button_parks_the_worker_in_awaiting_login() {
    let (h, _driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    login_probe: Some(ElementProbe {
                        visible: true,
                        text: "Login with Google".to_string(),
                    }),
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    assert_eq!(worker.state(), WorkerState::AwaitingLogin);
    assert_eq!(h.log.session_stats().failed, 1);
}

#[tokio::test]
async fn missing_button_schedules_click_failed_retry() {
    let (h, _driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    button_present: false,
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    assert!(matches!(
        worker.state(),
        WorkerState::RetryScheduled {
            kind: FailureKind::ClickFailed,
            ..
        }
    ));
    let snap = worker.snapshot(&h.gate.snapshot().await, Utc::now());
    assert_eq!(
        snap.last_failure_reason.as_deref(),
        Some("Could not find vote button")
    );
}

#[tokio::test]
async fn sticky_button_exhausts_three_click_retries() {
    let (h, driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    click_delta: 0,
                    button_sticky: true,
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    assert!(matches!(
        worker.state(),
        WorkerState::RetryScheduled {
            kind: FailureKind::ClickFailed,
            ..
        }
    ));
    assert_eq!(
        driver
            .probe(0)
            .clicks
            .load(std::sync::atomic::Ordering::Acquire),
        3
    );
    let snap = worker.snapshot(&h.gate.snapshot().await, Utc::now());
    assert_eq!(
        snap.last_failure_reason.as_deref(),
        Some("Click failed - Button still visible (popup may have reappeared)")
    );
}

#[tokio::test]
async fn unmoved_counter_with_button_gone_is_count_unchanged() {
    let (h, driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    click_delta: 0,
                    button_sticky: false,
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    assert!(matches!(
        worker.state(),
        WorkerState::RetryScheduled {
            kind: FailureKind::CountUnchanged,
            ..
        }
    ));
    assert_eq!(
        driver
            .probe(0)
            .clicks
            .load(std::sync::atomic::Ordering::Acquire),
        1
    );
}

#[tokio::test]
async fn suspicious_count_delta_is_not_a_success() {
    let (h, _driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    click_delta: 5,
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    assert_eq!(h.log.session_stats().successful, 0);
    assert_eq!(h.log.session_stats().failed, 1);
    assert!(matches!(
        worker.state(),
        WorkerState::RetryScheduled {
            kind: FailureKind::CountUnchanged,
            ..
        }
    ));
}

#[tokio::test]
async fn generic_cooldown_message_without_history_waits_a_full_window() {
    let (h, _driver) = harness_with(
        |_| {},
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    body: "You already voted! Please come back at your next voting time."
                        .to_string(),
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    let WorkerState::Cooldown { until } = worker.state() else {
        panic!("expected cooldown");
    };
    let remaining = (until - Utc::now()).num_seconds();
    assert!((remaining - 31 * 60).abs() <= 5);
    assert_eq!(h.log.session_stats().failed, 1);
}

#[tokio::test]
async fn proxy_unavailable_schedules_retry() {
    let (h, driver) = harness_with(
        |_| {},
        |c| FakeDriver::single(c, PageScript::default()),
        Arc::new(UnavailableEgress),
    )
    .await;
    let worker = run_one(&h).await;
    assert!(matches!(
        worker.state(),
        WorkerState::RetryScheduled {
            kind: FailureKind::ProxyUnavailable,
            ..
        }
    ));
    // Never got as far as a browser.
    assert_eq!(driver.opens.load(std::sync::atomic::Ordering::Acquire), 0);
}

#[tokio::test]
async fn active_gate_blocks_launch_entirely() {
    let (h, driver) = harness_with(
        |_| {},
        |c| FakeDriver::single(c, PageScript::default()),
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    h.gate
        .activate_until(Utc::now() + chrono::Duration::minutes(30))
        .await;

    let worker = WorkerInstance::new(1, Arc::clone(&h.deps), None, None);
    let handle = worker.spawn_attempt().expect("task spawns");
    handle.await.unwrap();

    // The gate read is the authoritative latch: no state change, no browser.
    assert_eq!(worker.state(), WorkerState::Idle);
    assert_eq!(driver.opens.load(std::sync::atomic::Ordering::Acquire), 0);
}

#[tokio::test]
async fn auto_resume_guard_respects_the_gate() {
    let mut retry_config = |c: &mut FleetConfig| c.retry_delay = Duration::from_millis(30);
    let (h, _driver) = harness_with(
        &mut retry_config,
        |c| {
            FakeDriver::single(
                c,
                PageScript {
                    body: "Someone has already voted out of this IP: 2.2.2.2".to_string(),
                    ..PageScript::default()
                },
            )
        },
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = run_one(&h).await;
    assert!(matches!(worker.state(), WorkerState::RetryScheduled { .. }));
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Retry window elapsed, but an active gate (or staggered resume) must
    // keep the worker parked.
    let blocked = votefleet::GateSnapshot {
        active: true,
        reactivation_time: Some(Utc::now() + chrono::Duration::minutes(10)),
        staggered_resume: false,
    };
    assert!(!worker.mark_idle_if_eligible(&blocked, Utc::now()).await);
    assert!(matches!(worker.state(), WorkerState::RetryScheduled { .. }));

    let resuming = votefleet::GateSnapshot {
        active: false,
        reactivation_time: None,
        staggered_resume: true,
    };
    assert!(!worker.mark_idle_if_eligible(&resuming, Utc::now()).await);

    let open = votefleet::GateSnapshot {
        active: false,
        reactivation_time: None,
        staggered_resume: false,
    };
    assert!(worker.mark_idle_if_eligible(&open, Utc::now()).await);
    assert_eq!(worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn only_one_attempt_per_instance_at_a_time() {
    let (h, _driver) = harness_with(
        |c| c.post_click_wait = Duration::from_millis(100),
        |c| FakeDriver::single(c, PageScript::default()),
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    let worker = WorkerInstance::new(1, Arc::clone(&h.deps), None, None);
    let handle = worker.spawn_attempt().expect("first attempt");
    // While the first runs, a second spawn must be refused.
    assert!(worker.spawn_attempt().is_none());
    handle.await.unwrap();
    assert_eq!(h.log.session_stats().total_attempts, 1);
}

#[tokio::test]
async fn cooldown_survives_restart_via_the_vote_log() {
    let (h, _driver) = harness_with(
        |_| {},
        |c| FakeDriver::single(c, PageScript::default()),
        FakeEgress::new(&["1.1.1.1"]),
    )
    .await;
    run_one(&h).await;
    drop(h.deps);

    // "Restart": a fresh log handle over the same file.
    let reopened = VoteLog::open(&h.config.vote_log_path()).await.unwrap();
    let last = reopened.last_success(1).expect("success survives restart");
    let times = votefleet::InstanceTimes {
        last_success: Some(last),
        retry_until: None,
    };
    let gate = votefleet::GateSnapshot {
        active: false,
        reactivation_time: None,
        staggered_resume: false,
    };
    let secs = votefleet::seconds_until_eligible(
        &times,
        h.config.vote_cooldown,
        &gate,
        Utc::now(),
    );
    assert!(
        secs > 30 * 60,
        "fresh success must still block ~31 minutes after restart, got {secs}s"
    );
    // Counters are session-scoped and start at zero on reopen.
    assert_eq!(reopened.session_stats().total_attempts, 0);
}
