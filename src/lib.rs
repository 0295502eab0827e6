//! votefleet — orchestration engine for a fleet of proxied headless-browser
//! voting workers.
//!
//! Each persisted instance (cookies, last-known egress IP, vote history)
//! submits one vote per 31-minute cooldown window through a rotating
//! residential proxy. The engine schedules workers one launch per scan tick,
//! classifies page signals, coordinates the fleet-wide hourly-limit pause
//! with staggered resume, and streams state to an HTTP/WebSocket control
//! plane.

pub mod browser;
pub mod classifier;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod events;
pub mod global_limit;
pub mod launch_gate;
pub mod proxy;
pub mod server;
pub mod session_store;
pub mod supervisor;
pub mod vote_log;
pub mod worker;

pub use browser::{ChromiumDriver, ElementProbe, VoteDriver, VoteSession};
pub use classifier::{classify, Classification, SignalClass};
pub use config::{ConfigStore, FleetConfig, PageSelectors, ProxySettings, StartOverrides, UserConfig};
pub use cooldown::{next_vote_time, seconds_until_eligible, InstanceTimes};
pub use error::FatalError;
pub use events::{InstanceSnapshot, LogLine, ObservationBus, ObservationEvent, StatusSnapshot};
pub use global_limit::{GateSnapshot, GlobalLimitGate, PausedFleet};
pub use launch_gate::{InitError, LaunchGate, LaunchPermit};
pub use proxy::{EgressLease, EgressProvider, ProxyBroker, ProxyConnection, ProxyError};
pub use server::{router, AppState};
pub use session_store::{
    InstanceId, SessionInfo, SessionRecord, SessionStore, StorageState, StoredCookie,
};
pub use supervisor::{SessionView, Supervisor};
pub use vote_log::{FailureKind, SessionStats, VoteAttempt, VoteLog, VoteStatus};
pub use worker::{parse_vote_count, VoteOutcome, WorkerDeps, WorkerEvent, WorkerInstance, WorkerState};
