//! Core configuration types for the voting fleet
//!
//! `FleetConfig` is the fully-resolved runtime configuration a Supervisor run
//! is constructed from. `UserConfig` is the small persisted document the
//! control plane reads and writes (`user_config.json`); the loader merges it
//! with environment variables and compiled defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Persisted user-facing configuration (`<root>/user_config.json`)
///
/// All fields optional: anything absent falls through to environment
/// variables and then compiled defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voting_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bright_data_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bright_data_password: Option<String>,
}

/// Request-scoped overrides accepted by `POST /api/start-monitoring`
///
/// Highest-priority config source; wins over the persisted file and the
/// environment for the run being started.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartOverrides {
    #[serde(default)]
    pub voting_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Proxy provider connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// CONNECT proxy endpoint, e.g. `brd.superproxy.io:33335`
    pub server: String,
    /// Base account username; a per-attempt session token is appended
    pub username: String,
    pub password: String,
    /// URL fetched THROUGH the proxy to discover the egress IP
    pub echo_url: String,
}

/// CSS selectors and phrases used to read the voting page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSelectors {
    /// The clickable vote button
    pub vote_button: String,
    /// Element whose text contains the current vote count
    pub vote_count: String,
    /// Candidate login button element. Login is only reported when this
    /// element exists, is visible, and its text matches `login_phrase` —
    /// matching page text alone produces false positives.
    pub login_button: String,
    /// Case-insensitive phrase the login button text must contain
    pub login_phrase: String,
}

impl Default for PageSelectors {
    fn default() -> Self {
        Self {
            vote_button: ".vote-button".to_string(),
            vote_count: ".vote-count".to_string(),
            login_button: "a.login-google, button.login-google".to_string(),
            login_phrase: "login with google".to_string(),
        }
    }
}

/// Fully-resolved configuration for one Supervisor run
///
/// **INVARIANT:** `storage_root` is always an absolute path (normalized in
/// the loader) so the session store and vote log agree on locations.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Target page. Frozen per worker at Launching; a mid-run change applies
    /// only to launches that begin afterwards.
    pub voting_url: String,
    pub proxy: ProxySettings,
    pub storage_root: PathBuf,
    pub headless: bool,
    pub selectors: PageSelectors,

    /// Minimum interval between two successful votes from one instance.
    /// Slightly over the 30 minutes the target site enforces.
    pub vote_cooldown: Duration,
    /// Delay before retrying a technical failure (click failed, hung page,
    /// proxy anomaly, init timeout)
    pub retry_delay: Duration,

    pub browser_init_timeout: Duration,
    /// Deadline on every page read that blocks on the browser
    pub page_read_timeout: Duration,
    pub page_load_timeout: Duration,
    pub proxy_request_timeout: Duration,

    pub session_scan_interval: Duration,
    pub auto_resume_interval: Duration,
    /// Spacing between staggered-resume releases after a global limit expires
    pub browser_launch_delay: Duration,
    /// Minimum spacing between any two launch-gate acquisitions
    pub launch_spacing: Duration,
    pub max_concurrent_inits: usize,
    pub shutdown_grace: Duration,

    /// Settle time after a click before the count is re-read
    pub post_click_wait: Duration,
    /// In-page click retries per attempt before giving up
    pub max_click_retries: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            voting_url: String::new(),
            proxy: ProxySettings {
                server: "brd.superproxy.io:33335".to_string(),
                username: String::new(),
                password: String::new(),
                echo_url: "https://lumtest.com/myip.json".to_string(),
            },
            storage_root: PathBuf::from("."),
            headless: true,
            selectors: PageSelectors::default(),
            vote_cooldown: Duration::from_secs(31 * 60),
            retry_delay: Duration::from_secs(5 * 60),
            browser_init_timeout: Duration::from_secs(30),
            page_read_timeout: Duration::from_secs(10),
            page_load_timeout: Duration::from_secs(30),
            proxy_request_timeout: Duration::from_secs(10),
            session_scan_interval: Duration::from_secs(30),
            auto_resume_interval: Duration::from_secs(30),
            browser_launch_delay: Duration::from_secs(5),
            launch_spacing: Duration::from_secs(5),
            max_concurrent_inits: 1,
            shutdown_grace: Duration::from_secs(30),
            post_click_wait: Duration::from_secs(3),
            max_click_retries: 3,
        }
    }
}

impl FleetConfig {
    /// Path of the append-only vote log CSV
    #[must_use]
    pub fn vote_log_path(&self) -> PathBuf {
        self.storage_root.join("vote_log.csv")
    }
}
