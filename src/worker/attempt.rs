//! The voting phase of one attempt
//!
//! Every step returns a value; nothing in here uses errors for control
//! flow. `Err` escaping these functions means an unclassified technical
//! fault (hung read, dropped browser) and the caller maps it to
//! `NavigationFailure`. All page reads inherit the configured read deadline
//! through the session trait.

use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::browser::VoteSession;
use crate::classifier::{classify, SignalClass};
use crate::config::FleetConfig;
use crate::global_limit::GlobalLimitGate;
use crate::vote_log::FailureKind;

/// First run of digits, allowing thousands separators ("1,234 votes")
static COUNT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d[\d,]*").unwrap_or_else(|e| panic!("invalid count pattern: {e}"))
});

/// Final classification of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    /// Counter moved exactly +1
    Success {
        initial: u64,
        final_count: u64,
        clicks: u32,
    },
    /// Page shows the fleet-wide hourly limit
    GlobalLimit {
        message: String,
        scraped_count: Option<u64>,
    },
    /// Ordinary per-instance cooldown message
    InstanceCooldown { message: String },
    /// The page names an egress IP that already voted: proxy anomaly scoped
    /// to this worker
    IpMismatch {
        message: String,
        observed_ip: Option<String>,
    },
    /// Genuine login button present and visible
    LoginRequired,
    /// Vote button absent (or rendered invisible)
    ButtonMissing,
    /// Button still visible after exhausting in-page click retries
    ClickFailed { clicks: u32, detail: String },
    /// Clicks landed but the counter never moved +1
    CountUnchanged {
        clicks: u32,
        detail: String,
        initial: Option<u64>,
        final_count: Option<u64>,
    },
    /// Global gate activated mid-attempt; park without logging a failure
    Interrupted,
    /// Unclassified technical fault
    Failure { kind: FailureKind, detail: String },
}

impl VoteOutcome {
    /// Operator-facing reason string; diagnostic detail stays in the log row
    #[must_use]
    pub fn user_reason(&self) -> String {
        match self {
            Self::Success { .. } => String::new(),
            Self::GlobalLimit { .. } => "Hourly voting limit reached".to_string(),
            Self::InstanceCooldown { .. } => "In cooldown period".to_string(),
            Self::IpMismatch { observed_ip, .. } => match observed_ip {
                Some(ip) => format!("Proxy IP mismatch - someone already voted from {ip}"),
                None => "Proxy IP mismatch".to_string(),
            },
            Self::LoginRequired => "Login required".to_string(),
            Self::ButtonMissing => "Could not find vote button".to_string(),
            Self::ClickFailed { .. } => {
                "Click failed - Button still visible (popup may have reappeared)".to_string()
            }
            Self::CountUnchanged { .. } => "Vote count did not increase".to_string(),
            Self::Interrupted => String::new(),
            Self::Failure { kind, .. } => match kind {
                FailureKind::ProxyUnavailable => "Proxy unavailable".to_string(),
                FailureKind::BrowserInitTimeout => "Browser initialization timed out".to_string(),
                _ => "Navigation failure".to_string(),
            },
        }
    }

    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } | Self::Interrupted => None,
            Self::GlobalLimit { .. } => Some(FailureKind::GlobalHourlyLimit),
            Self::InstanceCooldown { .. } => Some(FailureKind::InstanceCooldown),
            Self::IpMismatch { .. } => Some(FailureKind::ProxyIpMismatch),
            Self::LoginRequired => Some(FailureKind::LoginRequired),
            Self::ButtonMissing | Self::ClickFailed { .. } => Some(FailureKind::ClickFailed),
            Self::CountUnchanged { .. } => Some(FailureKind::CountUnchanged),
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Outcome plus the moment of the first click, for the log row
#[derive(Debug)]
pub(super) struct VotePhase {
    pub outcome: VoteOutcome,
    pub time_of_click: Option<DateTime<Utc>>,
}

impl VotePhase {
    fn unclicked(outcome: VoteOutcome) -> Self {
        Self {
            outcome,
            time_of_click: None,
        }
    }
}

/// Extract a vote count from element text
#[must_use]
pub fn parse_vote_count(text: &str) -> Option<u64> {
    let token = COUNT_TOKEN.find(text)?;
    token.as_str().replace(',', "").parse().ok()
}

/// Read the current counter value; `None` when the element or a parseable
/// number is absent
pub(super) async fn read_vote_count(
    session: &dyn VoteSession,
    cfg: &FleetConfig,
) -> Result<Option<u64>> {
    let probe = session
        .query(&cfg.selectors.vote_count, cfg.page_read_timeout)
        .await?;
    Ok(probe.and_then(|p| parse_vote_count(&p.text)))
}

/// Genuine-login detection.
///
/// All three conditions are required: element present, element visible,
/// element text matching the login phrase. Page TEXT containing the phrase
/// is not sufficient — marketing copy mentioning Google login used to park
/// whole fleets in `AwaitingLogin`.
pub(super) async fn login_button_visible(
    session: &dyn VoteSession,
    cfg: &FleetConfig,
) -> Result<bool> {
    let probe = session
        .query(&cfg.selectors.login_button, cfg.page_read_timeout)
        .await?;
    Ok(probe.is_some_and(|p| {
        p.visible
            && p.text
                .to_lowercase()
                .contains(&cfg.selectors.login_phrase.to_lowercase())
    }))
}

/// Scan the freshly loaded page for terminal signals before any click
pub(super) async fn pre_click_scan(
    session: &dyn VoteSession,
    cfg: &FleetConfig,
) -> Result<Option<VoteOutcome>> {
    let body = session.body_text(cfg.page_read_timeout).await?;
    let verdict = classify(&body);
    match verdict.class {
        SignalClass::GlobalHourlyLimit => {
            let scraped = read_vote_count(session, cfg).await.unwrap_or(None);
            Ok(Some(VoteOutcome::GlobalLimit {
                message: verdict.message,
                scraped_count: scraped,
            }))
        }
        SignalClass::InstanceCooldownMismatch => Ok(Some(VoteOutcome::IpMismatch {
            message: verdict.message,
            observed_ip: verdict.mismatch_ip,
        })),
        SignalClass::InstanceCooldownGeneric => Ok(Some(VoteOutcome::InstanceCooldown {
            message: verdict.message,
        })),
        SignalClass::SuccessIndicator | SignalClass::NoKnownSignal => {
            if login_button_visible(session, cfg).await? {
                Ok(Some(VoteOutcome::LoginRequired))
            } else {
                Ok(None)
            }
        }
    }
}

/// Click the vote button and verify the counter moved exactly +1.
///
/// Up to `max_click_retries` in-page clicks. After each click the counter
/// delta is checked first — exactly +1 is a success regardless of page
/// text; only an unmoved (or unreadable) counter falls through to the
/// cooldown/limit classification.
pub(super) async fn cast_vote(
    session: &dyn VoteSession,
    cfg: &FleetConfig,
    gate: &Arc<GlobalLimitGate>,
) -> Result<VotePhase> {
    let Some(button) = session
        .query(&cfg.selectors.vote_button, cfg.page_read_timeout)
        .await?
    else {
        return Ok(VotePhase::unclicked(VoteOutcome::ButtonMissing));
    };
    if !button.visible {
        debug!("vote button present but not visible");
        return Ok(VotePhase::unclicked(VoteOutcome::ButtonMissing));
    }

    let initial = read_vote_count(session, cfg).await?;
    let mut time_of_click = None;
    let mut clicks = 0u32;

    while clicks < cfg.max_click_retries {
        // The gate read is the authoritative latch; a mid-attempt global
        // pause parks this worker without logging a failure of its own.
        if gate.is_active().await {
            return Ok(VotePhase {
                outcome: VoteOutcome::Interrupted,
                time_of_click,
            });
        }

        session
            .click(&cfg.selectors.vote_button, cfg.page_read_timeout)
            .await?;
        clicks += 1;
        time_of_click.get_or_insert_with(Utc::now);
        tokio::time::sleep(cfg.post_click_wait).await;

        // The counter verdict comes first: an exact +1 is a success no
        // matter what boilerplate the page text happens to contain, and a
        // success misread as an hourly limit would pause the whole fleet.
        let final_count = read_vote_count(session, cfg).await?;
        match (initial, final_count) {
            (Some(i), Some(f)) if f == i + 1 => {
                return Ok(VotePhase {
                    outcome: VoteOutcome::Success {
                        initial: i,
                        final_count: f,
                        clicks,
                    },
                    time_of_click,
                });
            }
            (Some(i), Some(f)) if f != i => {
                // Any delta other than exactly +1 is suspicious: recorded,
                // never counted as a success.
                warn!(initial = i, final_count = f, "suspicious vote count delta");
                return Ok(VotePhase {
                    outcome: VoteOutcome::CountUnchanged {
                        clicks,
                        detail: format!("suspicious count delta: {i} -> {f}"),
                        initial: Some(i),
                        final_count: Some(f),
                    },
                    time_of_click,
                });
            }
            _ => {}
        }

        // Counter unmoved (or unreadable): now the page text decides.
        let body = session.body_text(cfg.page_read_timeout).await?;
        let verdict = classify(&body);
        match verdict.class {
            SignalClass::GlobalHourlyLimit => {
                return Ok(VotePhase {
                    outcome: VoteOutcome::GlobalLimit {
                        message: verdict.message,
                        scraped_count: final_count,
                    },
                    time_of_click,
                });
            }
            SignalClass::InstanceCooldownMismatch => {
                return Ok(VotePhase {
                    outcome: VoteOutcome::IpMismatch {
                        message: verdict.message,
                        observed_ip: verdict.mismatch_ip,
                    },
                    time_of_click,
                });
            }
            SignalClass::InstanceCooldownGeneric => {
                return Ok(VotePhase {
                    outcome: VoteOutcome::InstanceCooldown {
                        message: verdict.message,
                    },
                    time_of_click,
                });
            }
            SignalClass::SuccessIndicator | SignalClass::NoKnownSignal => {}
        }

        // Counter unmoved: a still-visible button means the click likely
        // never landed (popup swallowed it); retry in place.
        let still_visible = session
            .query(&cfg.selectors.vote_button, cfg.page_read_timeout)
            .await?
            .is_some_and(|p| p.visible);
        if still_visible {
            debug!(clicks, "button still visible after click; retrying");
            continue;
        }

        return Ok(VotePhase {
            outcome: VoteOutcome::CountUnchanged {
                clicks,
                detail: format!(
                    "button gone, counter unmoved (initial {initial:?}, final {final_count:?})"
                ),
                initial,
                final_count,
            },
            time_of_click,
        });
    }

    let final_count = read_vote_count(session, cfg).await.unwrap_or(None);
    Ok(VotePhase {
        outcome: VoteOutcome::ClickFailed {
            clicks,
            detail: format!(
                "button still visible after {clicks} clicks (initial {initial:?}, final {final_count:?})"
            ),
        },
        time_of_click,
    })
}
