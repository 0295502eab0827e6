//! Scripted driver, egress provider and config helpers shared by the
//! integration tests. The fake session follows the production trait
//! contract: deadline-bounded reads, explicit close, no handle reuse after
//! close.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use votefleet::{
    EgressLease, EgressProvider, ElementProbe, FleetConfig, ProxyConnection, ProxyError,
    StorageState, VoteDriver, VoteSession,
};

/// A fleet config with test-friendly timings and a local storage root
pub fn test_config(root: &std::path::Path) -> FleetConfig {
    FleetConfig {
        voting_url: "https://vote.example.com/entry/1".to_string(),
        storage_root: root.to_path_buf(),
        page_read_timeout: Duration::from_millis(250),
        page_load_timeout: Duration::from_millis(500),
        browser_init_timeout: Duration::from_millis(500),
        post_click_wait: Duration::from_millis(10),
        launch_spacing: Duration::ZERO,
        session_scan_interval: Duration::from_millis(100),
        auto_resume_interval: Duration::from_millis(100),
        browser_launch_delay: Duration::from_millis(20),
        ..FleetConfig::default()
    }
}

/// Behavior script for one fake page
#[derive(Debug, Clone)]
pub struct PageScript {
    /// Body text served before any click
    pub body: String,
    /// Body text after a click, when different from `body`
    pub body_after_click: Option<String>,
    /// Counter value at load
    pub initial_count: u64,
    /// Counter increment applied per click
    pub click_delta: u64,
    /// Vote button present at load
    pub button_present: bool,
    /// Button stays visible after clicking (popup-style failure)
    pub button_sticky: bool,
    /// Login element present/visible/text
    pub login_probe: Option<ElementProbe>,
    /// Extra latency injected into body reads (hung-page scenarios)
    pub body_read_delay: Duration,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            body: "Cast your vote below. 100 votes so far".to_string(),
            body_after_click: None,
            initial_count: 100,
            click_delta: 1,
            button_present: true,
            button_sticky: false,
            login_probe: None,
            body_read_delay: Duration::ZERO,
        }
    }
}

/// Observable side effects of a fake session
#[derive(Debug, Default)]
pub struct SessionProbe {
    pub closed: AtomicBool,
    pub clicks: AtomicU32,
    pub navigations: AtomicU32,
}

pub struct FakeSession {
    script: PageScript,
    selectors: votefleet::PageSelectors,
    count: AtomicU64,
    clicked: AtomicBool,
    probe: Arc<SessionProbe>,
}

impl FakeSession {
    fn body_now(&self) -> String {
        if self.clicked.load(Ordering::Acquire) {
            self.script
                .body_after_click
                .clone()
                .unwrap_or_else(|| self.script.body.clone())
        } else {
            self.script.body.clone()
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.probe.closed.load(Ordering::Acquire) {
            return Err(anyhow!("session used after close"));
        }
        Ok(())
    }
}

#[async_trait]
impl VoteSession for FakeSession {
    async fn navigate(&self, _url: &str, _deadline: Duration) -> Result<()> {
        self.ensure_open()?;
        self.probe.navigations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn body_text(&self, deadline: Duration) -> Result<String> {
        self.ensure_open()?;
        if self.script.body_read_delay > deadline {
            // Model the production contract: the read deadline fires.
            tokio::time::sleep(deadline).await;
            return Err(anyhow!("page text read timed out after {deadline:?}"));
        }
        tokio::time::sleep(self.script.body_read_delay).await;
        Ok(self.body_now())
    }

    async fn query(&self, selector: &str, _deadline: Duration) -> Result<Option<ElementProbe>> {
        self.ensure_open()?;
        if selector == self.selectors.vote_count {
            return Ok(Some(ElementProbe {
                visible: true,
                text: format!("{} votes", self.count.load(Ordering::Acquire)),
            }));
        }
        if selector == self.selectors.vote_button {
            if !self.script.button_present {
                return Ok(None);
            }
            let after_click = self.clicked.load(Ordering::Acquire);
            return Ok(Some(ElementProbe {
                visible: !after_click || self.script.button_sticky,
                text: "Vote".to_string(),
            }));
        }
        if selector == self.selectors.login_button {
            return Ok(self.script.login_probe.clone());
        }
        Ok(None)
    }

    async fn click(&self, selector: &str, _deadline: Duration) -> Result<()> {
        self.ensure_open()?;
        if selector != self.selectors.vote_button || !self.script.button_present {
            return Err(anyhow!("no clickable element for {selector}"));
        }
        self.clicked.store(true, Ordering::Release);
        self.probe.clicks.fetch_add(1, Ordering::AcqRel);
        self.count
            .fetch_add(self.script.click_delta, Ordering::AcqRel);
        Ok(())
    }

    async fn storage_state(&self, _deadline: Duration) -> Result<StorageState> {
        self.ensure_open()?;
        Ok(StorageState::default())
    }

    async fn close(&mut self) {
        self.probe.closed.store(true, Ordering::Release);
    }
}

/// Driver serving scripted sessions; scripts are consumed in order, the
/// last one repeating for any further launches
pub struct FakeDriver {
    selectors: votefleet::PageSelectors,
    scripts: Mutex<Vec<PageScript>>,
    pub probes: Mutex<Vec<Arc<SessionProbe>>>,
    pub opens: AtomicU32,
}

impl FakeDriver {
    pub fn new(config: &FleetConfig, scripts: Vec<PageScript>) -> Arc<Self> {
        assert!(!scripts.is_empty(), "at least one page script required");
        Arc::new(Self {
            selectors: config.selectors.clone(),
            scripts: Mutex::new(scripts),
            probes: Mutex::new(Vec::new()),
            opens: AtomicU32::new(0),
        })
    }

    pub fn single(config: &FleetConfig, script: PageScript) -> Arc<Self> {
        Self::new(config, vec![script])
    }

    /// Probe for the n-th opened session
    pub fn probe(&self, index: usize) -> Arc<SessionProbe> {
        Arc::clone(&self.probes.lock()[index])
    }
}

#[async_trait]
impl VoteDriver for FakeDriver {
    async fn open(
        &self,
        _proxy: &ProxyConnection,
        _storage: Option<StorageState>,
    ) -> Result<Box<dyn VoteSession>> {
        self.opens.fetch_add(1, Ordering::AcqRel);
        let script = {
            let mut scripts = self.scripts.lock();
            if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                scripts[0].clone()
            }
        };
        let probe = Arc::new(SessionProbe::default());
        self.probes.lock().push(Arc::clone(&probe));
        Ok(Box::new(FakeSession {
            count: AtomicU64::new(script.initial_count),
            clicked: AtomicBool::new(false),
            selectors: self.selectors.clone(),
            script,
            probe,
        }))
    }
}

/// Scripted egress provider handing out a fixed IP sequence
pub struct FakeEgress {
    ips: Mutex<Vec<String>>,
    pub tokens_seen: Mutex<Vec<String>>,
}

impl FakeEgress {
    pub fn new(ips: &[&str]) -> Arc<Self> {
        assert!(!ips.is_empty());
        Arc::new(Self {
            ips: Mutex::new(ips.iter().map(|s| s.to_string()).collect()),
            tokens_seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EgressProvider for FakeEgress {
    async fn acquire_egress(&self, session_token: &str) -> Result<EgressLease, ProxyError> {
        self.tokens_seen.lock().push(session_token.to_string());
        let ip = {
            let mut ips = self.ips.lock();
            if ips.len() > 1 {
                ips.remove(0)
            } else {
                ips[0].clone()
            }
        };
        Ok(EgressLease {
            ip: ip.clone(),
            connection: ProxyConnection {
                server: "proxy.test:33335".to_string(),
                username: format!("test-session-{session_token}"),
                password: "pw".to_string(),
                session_token: session_token.to_string(),
            },
        })
    }
}

/// Egress provider that always reports the circuit open
pub struct UnavailableEgress;

#[async_trait]
impl EgressProvider for UnavailableEgress {
    async fn acquire_egress(&self, _session_token: &str) -> Result<EgressLease, ProxyError> {
        Err(ProxyError::Unavailable)
    }
}
