//! Property tests over the page-text classifier

use proptest::prelude::*;

use votefleet::{classify, SignalClass};

proptest! {
    /// Total and deterministic over arbitrary input
    #[test]
    fn classify_never_panics_and_is_deterministic(text in ".{0,400}") {
        let first = classify(&text);
        let second = classify(&text);
        prop_assert_eq!(first, second);
    }

    /// The cleaned message never exceeds the cap
    #[test]
    fn message_is_capped(text in ".{0,2000}") {
        let result = classify(&text);
        prop_assert!(result.message.chars().count() <= 200);
    }

    /// The IP-mismatch message is always instance-scoped, wherever it
    /// appears in surrounding noise (alphabet chosen so no global or
    /// cooldown pattern can form by accident)
    #[test]
    fn embedded_mismatch_is_never_global(
        prefix in "[a-f ]{0,40}",
        suffix in "[a-f ]{0,40}",
    ) {
        let text = format!("{prefix} Someone has already voted out of this IP: 9.9.9.9 {suffix}");
        let result = classify(&text);
        prop_assert_eq!(result.class, SignalClass::InstanceCooldownMismatch);
        prop_assert_eq!(result.mismatch_ip.as_deref(), Some("9.9.9.9"));
    }

    /// Hourly-limit phrasing wins regardless of case
    #[test]
    fn global_patterns_are_case_insensitive(upper in proptest::bool::ANY) {
        let text = if upper {
            "HOURLY VOTING LIMIT reached".to_string()
        } else {
            "hourly voting limit reached".to_string()
        };
        prop_assert_eq!(classify(&text).class, SignalClass::GlobalHourlyLimit);
    }
}
