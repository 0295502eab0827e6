//! Residential proxy egress acquisition
//!
//! The broker composes a session-scoped credential (the session token is
//! embedded in the proxy username, which asks the provider for a distinct
//! egress IP), then discovers the outward IP by fetching an IP-echo URL
//! through the proxy. Transient provider failures retry with exponential
//! backoff; a run of consecutive 503s opens a circuit that rejects all
//! acquires for a fixed window before the next probe is allowed through.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::config::ProxySettings;

/// Attempts per acquire before giving up
const MAX_RETRIES: u32 = 3;
/// First backoff step; doubles per attempt
const BACKOFF_BASE: Duration = Duration::from_secs(2);
/// Consecutive provider 503s that open the circuit
const BREAKER_THRESHOLD: u32 = 3;
/// How long an open circuit rejects acquires before a probe retry
const PAUSE_DURATION: Duration = Duration::from_secs(60);

/// Connection parameters a browser launch needs to egress through the lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConnection {
    /// `host:port` of the CONNECT endpoint
    pub server: String,
    /// Session-scoped username (token embedded)
    pub username: String,
    pub password: String,
    pub session_token: String,
}

/// A successfully acquired egress
#[derive(Debug, Clone)]
pub struct EgressLease {
    /// Outward IP the target site will observe
    pub ip: String,
    pub connection: ProxyConnection,
}

/// The egress-acquisition interface workers consume.
///
/// The production implementation is [`ProxyBroker`]; tests substitute
/// scripted providers.
#[async_trait]
pub trait EgressProvider: Send + Sync {
    async fn acquire_egress(&self, session_token: &str) -> Result<EgressLease, ProxyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Circuit open or retries exhausted; the worker schedules a retry
    #[error("proxy provider unavailable")]
    Unavailable,
    /// The echo response did not contain a usable IP
    #[error("malformed egress echo response: {0}")]
    MalformedEcho(String),
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_503: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker over consecutive provider 503s
///
/// Same shape as the domain-level breaker used for crawl targets: closed
/// until the threshold trips, then rejecting until the pause elapses, then
/// a single probe window.
#[derive(Debug, Default)]
struct Breaker {
    state: Mutex<BreakerState>,
}

impl Breaker {
    /// True when acquires must be rejected right now
    fn is_open(&self, pause: Duration) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            Some(opened) if opened.elapsed() < pause => true,
            Some(_) => {
                // Pause elapsed: allow a probe through but stay armed.
                debug!("proxy circuit pause elapsed; allowing probe");
                state.opened_at = None;
                false
            }
            None => false,
        }
    }

    /// Returns true when this 503 tripped the circuit open
    fn record_503(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_503 += 1;
        if state.consecutive_503 >= BREAKER_THRESHOLD && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            warn!(
                "proxy circuit OPEN after {} consecutive 503s; rejecting acquires for {}s",
                state.consecutive_503,
                PAUSE_DURATION.as_secs()
            );
            true
        } else {
            false
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_503 = 0;
        state.opened_at = None;
    }
}

#[derive(Debug, Deserialize)]
struct EchoResponse {
    ip: String,
}

/// Obtains fresh egress IPs from the residential proxy provider
#[derive(Debug)]
pub struct ProxyBroker {
    settings: ProxySettings,
    request_timeout: Duration,
    breaker: Breaker,
}

impl ProxyBroker {
    #[must_use]
    pub fn new(settings: ProxySettings, request_timeout: Duration) -> Self {
        Self {
            settings,
            request_timeout,
            breaker: Breaker::default(),
        }
    }

    /// Session-scoped proxy username for a token
    ///
    /// Bright Data convention: `<account>-session-<token>` requests a
    /// sticky session pinned to one egress IP.
    #[must_use]
    pub fn session_username(&self, session_token: &str) -> String {
        format!("{}-session-{}", self.settings.username, session_token)
    }

    /// One echo request through the proxy
    async fn probe_egress(&self, connection: &ProxyConnection) -> Result<String, ProbeFailure> {
        let proxy = reqwest::Proxy::all(format!("http://{}", connection.server))
            .map_err(|e| ProbeFailure::Other(e.to_string()))?
            .basic_auth(&connection.username, &connection.password);
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ProbeFailure::Other(e.to_string()))?;

        let response = client
            .get(&self.settings.echo_url)
            .send()
            .await
            .map_err(|e| ProbeFailure::Other(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 503 {
            return Err(ProbeFailure::Provider503);
        }
        if !status.is_success() {
            return Err(ProbeFailure::Other(format!("echo returned {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProbeFailure::Other(e.to_string()))?;
        parse_echo_ip(&body).map_err(|e| ProbeFailure::Other(e.to_string()))
    }
}

#[async_trait]
impl EgressProvider for ProxyBroker {
    /// Acquire an egress IP for the given session token.
    ///
    /// Up to `MAX_RETRIES` attempts with exponential backoff. Returns
    /// `ProxyError::Unavailable` when the circuit is open at call time or
    /// every attempt failed.
    async fn acquire_egress(&self, session_token: &str) -> Result<EgressLease, ProxyError> {
        if self.breaker.is_open(PAUSE_DURATION) {
            debug!("proxy acquire rejected: circuit open");
            return Err(ProxyError::Unavailable);
        }

        let connection = ProxyConnection {
            server: self.settings.server.clone(),
            username: self.session_username(session_token),
            password: self.settings.password.clone(),
            session_token: session_token.to_string(),
        };

        for attempt in 1..=MAX_RETRIES {
            match self.probe_egress(&connection).await {
                Ok(ip) => {
                    self.breaker.record_success();
                    info!("egress acquired: {ip} (attempt {attempt})");
                    return Ok(EgressLease { ip, connection });
                }
                Err(ProbeFailure::Provider503) => {
                    if self.breaker.record_503() {
                        return Err(ProxyError::Unavailable);
                    }
                }
                Err(ProbeFailure::Other(reason)) => {
                    warn!("egress probe attempt {attempt} failed: {reason}");
                }
            }
            if attempt < MAX_RETRIES {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        warn!("egress acquisition exhausted retries for session {session_token}");
        Err(ProxyError::Unavailable)
    }
}

enum ProbeFailure {
    Provider503,
    Other(String),
}

/// Backoff before retry `attempt + 1`: `base * 2^(attempt - 1)`
fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Accepts the provider's JSON echo (`{"ip": "..."}`) or a bare-IP body
fn parse_echo_ip(body: &str) -> Result<String, ProxyError> {
    if let Ok(echo) = serde_json::from_str::<EchoResponse>(body) {
        return Ok(echo.ip);
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() && trimmed.len() <= 45 && !trimmed.contains(char::is_whitespace) {
        return Ok(trimmed.to_string());
    }
    Err(ProxyError::MalformedEcho(truncate(body, 120)))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
