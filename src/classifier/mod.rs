//! Page-text classification for vote outcomes
//!
//! Total, pure classification of raw page text into one signal class plus a
//! cleaned human-readable message. Match order is significant and fixed:
//! global hourly-limit patterns, then the per-IP cooldown mismatch, then
//! generic instance cooldowns, then the success indicator, then no signal.
//!
//! The "someone has already voted out of this IP" message is deliberately
//! classified as instance-scoped: it means the proxy handed the worker a
//! different egress IP than recorded, and treating it as a global limit
//! stalls the whole fleet for half an hour on a single proxy anomaly. Note
//! that this text also contains the substring "already voted", so the
//! mismatch check MUST run before the generic cooldown patterns.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum length of a cleaned message surfaced to operators
const MAX_MESSAGE_LEN: usize = 200;

/// Signals the fleet pauses on, in match priority order
const GLOBAL_LIMIT_PATTERNS: &[&str] = &[
    "hourly voting limit",
    "hourly limit",
    "voting button is temporarily disabled",
    "will be reactivated at",
];

/// Per-IP cooldown mismatch: the proxy gave us an IP someone already voted from
const IP_MISMATCH_PATTERN: &str = "someone has already voted out of this ip";

/// Instance-scoped cooldown signals
const INSTANCE_COOLDOWN_PATTERNS: &[&str] = &[
    "please come back at your next voting time",
    "already voted",
    "wait before voting again",
];

/// Text confirming a counted vote
const SUCCESS_PATTERNS: &[&str] = &[
    "thank you for voting",
    "your vote has been counted",
    "vote recorded",
];

/// Strips the personal-name segment out of cooldown messages:
/// "You already voted Jane D.!" -> "You already!"
static NAME_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(voted already|already)\s+[^!]+!").unwrap_or_else(|e| {
        // Pattern is a compile-time constant; a failure here is a build bug.
        panic!("invalid name-strip pattern: {e}")
    })
});

static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").unwrap_or_else(|e| panic!("invalid whitespace pattern: {e}")));

static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b")
        .unwrap_or_else(|e| panic!("invalid ipv4 pattern: {e}"))
});

/// Outcome class of a page-text scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// The page confirms a counted vote
    SuccessIndicator,
    /// Fleet-wide hourly limit; pauses everyone until the next top of hour
    GlobalHourlyLimit,
    /// Cooldown message naming a specific egress IP — a proxy anomaly scoped
    /// to the current worker only
    InstanceCooldownMismatch,
    /// Ordinary per-instance cooldown message
    InstanceCooldownGeneric,
    /// Nothing recognized
    NoKnownSignal,
}

/// Classification result: the class plus the cleaned matched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: SignalClass,
    /// PII-stripped, whitespace-collapsed, length-capped message text.
    /// Empty for `NoKnownSignal`.
    pub message: String,
    /// The offending egress IP, extracted for `InstanceCooldownMismatch`
    pub mismatch_ip: Option<String>,
}

impl Classification {
    fn none() -> Self {
        Self {
            class: SignalClass::NoKnownSignal,
            message: String::new(),
            mismatch_ip: None,
        }
    }
}

/// Classify raw page text into one signal class and extract a clean message.
///
/// Deterministic and total: identical input always yields an identical
/// result, and no input panics or errors.
#[must_use]
pub fn classify(page_text: &str) -> Classification {
    let lowered = page_text.to_lowercase();

    for pattern in GLOBAL_LIMIT_PATTERNS {
        if lowered.contains(pattern) {
            return Classification {
                class: SignalClass::GlobalHourlyLimit,
                message: clean_message(matched_line(page_text, pattern)),
                mismatch_ip: None,
            };
        }
    }

    // Must precede the generic patterns: this text contains "already voted".
    if lowered.contains(IP_MISMATCH_PATTERN) {
        let line = matched_line(page_text, IP_MISMATCH_PATTERN);
        let ip = IPV4.find(line).map(|m| m.as_str().to_string());
        let mut message = clean_message(line);
        // The surfaced message must name the offending IP even when the
        // cleanup regex swallowed it.
        if let Some(ref ip) = ip {
            if !message.contains(ip.as_str()) {
                message = format!("{message} (IP: {ip})");
            }
        }
        return Classification {
            class: SignalClass::InstanceCooldownMismatch,
            message,
            mismatch_ip: ip,
        };
    }

    for pattern in INSTANCE_COOLDOWN_PATTERNS {
        if lowered.contains(pattern) {
            return Classification {
                class: SignalClass::InstanceCooldownGeneric,
                message: clean_message(matched_line(page_text, pattern)),
                mismatch_ip: None,
            };
        }
    }

    for pattern in SUCCESS_PATTERNS {
        if lowered.contains(pattern) {
            return Classification {
                class: SignalClass::SuccessIndicator,
                message: clean_message(matched_line(page_text, pattern)),
                mismatch_ip: None,
            };
        }
    }

    Classification::none()
}

/// The line of the original (case-preserved) text containing the matched
/// pattern; falls back to the whole text when line splitting finds nothing.
fn matched_line<'a>(page_text: &'a str, pattern: &str) -> &'a str {
    page_text
        .lines()
        .find(|line| line.to_lowercase().contains(pattern))
        .unwrap_or(page_text)
}

/// Strip personal names, collapse whitespace, cap the length
fn clean_message(raw: &str) -> String {
    let stripped = NAME_SEGMENT.replace_all(raw, "$1!");
    let collapsed = WHITESPACE_RUN.replace_all(stripped.trim(), " ");
    truncate_chars(&collapsed, MAX_MESSAGE_LEN)
}

/// Truncate at a char boundary; byte slicing can split multibyte characters
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
