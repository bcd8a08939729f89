/// Property-based tests using proptest
/// Tests invariants that should hold for all inputs
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rust_leadgen_api::campaign_lifecycle::{validate_count, validate_search_url, MAX_TOTAL_RECORDS};
use rust_leadgen_api::enrichment::{dedupe_key, is_valid_email, lead_from_record};
use rust_leadgen_api::job_lifecycle::RetryPolicy;
use rust_leadgen_api::models::{CampaignStatus, CircuitBreakerRecord, CircuitState, ThirdPartyService};
use std::time::Duration;

// Property: Email validation should never panic
proptest! {
    #[test]
    fn email_validation_never_panics(email in "\\PC*") {
        let _ = is_valid_email(&email);
    }

    #[test]
    fn plain_addresses_fail_only_on_placeholder_patterns(
        local in "[a-z]{1,10}",
        domain in "[a-z]{1,10}",
        tld in "[a-z]{2,4}"
    ) {
        let email = format!("{}@{}.{}", local, domain, tld);
        if !is_valid_email(&email) {
            prop_assert!(local.ends_with("noreply") || domain == "example");
        }
    }

    #[test]
    fn addresses_without_at_are_rejected(email in "[a-z0-9.]{0,30}") {
        prop_assert!(!is_valid_email(&email));
    }
}

// Property: de-duplication keys are stable and case-insensitive
proptest! {
    #[test]
    fn dedupe_key_ignores_case_and_padding(
        local in "[a-zA-Z]{1,12}",
        domain in "[a-zA-Z]{1,12}"
    ) {
        let email = format!("{}@{}.com", local, domain);
        let padded = format!("  {}  ", email.to_uppercase());
        prop_assert_eq!(
            dedupe_key(Some(&email), None, None, None, None),
            dedupe_key(Some(&padded), None, None, None, None)
        );
    }

    #[test]
    fn dedupe_key_prefers_email_over_other_identity(
        email in "[a-z]{1,8}@[a-z]{1,8}\\.io",
        first in "[A-Za-z]{1,10}",
        company in "[A-Za-z]{1,10}"
    ) {
        let with_name = dedupe_key(Some(&email), None, Some(&first), None, Some(&company));
        let email_only = dedupe_key(Some(&email), None, None, None, None);
        prop_assert_eq!(with_name, email_only);
    }

    #[test]
    fn dedupe_key_is_hex_sha256(first in "[A-Za-z]{1,10}", last in "[A-Za-z]{1,10}") {
        let key = dedupe_key(None, None, Some(&first), Some(&last), None).unwrap();
        prop_assert_eq!(key.len(), 64);
        prop_assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn record_parsing_never_panics(
        first in proptest::option::of("\\PC{0,20}"),
        email in proptest::option::of("\\PC{0,30}")
    ) {
        let record = serde_json::json!({"first_name": first, "email": email});
        let _ = lead_from_record(&record);
    }
}

// Property: campaign input validation
proptest! {
    #[test]
    fn record_counts_accepted_only_in_range(count in -10_000i32..10_000i32) {
        let ok = validate_count(count).is_ok();
        prop_assert_eq!(ok, (1..=MAX_TOTAL_RECORDS).contains(&count));
    }

    #[test]
    fn search_url_validation_never_panics(url in "\\PC*") {
        let _ = validate_search_url(&url);
    }
}

fn status_strategy() -> impl Strategy<Value = CampaignStatus> {
    prop_oneof![
        Just(CampaignStatus::Created),
        Just(CampaignStatus::Running),
        Just(CampaignStatus::Paused),
        Just(CampaignStatus::Completed),
        Just(CampaignStatus::Failed),
    ]
}

// Property: the campaign transition table
proptest! {
    #[test]
    fn terminal_statuses_have_no_exits(status in status_strategy()) {
        if status.is_terminal() {
            prop_assert!(status.valid_transitions().is_empty());
        } else {
            prop_assert!(!status.valid_transitions().is_empty());
        }
    }

    #[test]
    fn listed_transitions_are_allowed(status in status_strategy()) {
        for next in status.valid_transitions() {
            prop_assert!(next != status);
            prop_assert!(status.can_transition_to(next));
        }
    }

    #[test]
    fn nothing_returns_to_created(status in status_strategy()) {
        prop_assert!(!status.can_transition_to(CampaignStatus::Created));
    }
}

// Property: breaker and retry arithmetic
proptest! {
    #[test]
    fn breaker_opens_exactly_at_threshold(threshold in 1u32..20, failures in 0u32..40) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut record = CircuitBreakerRecord::closed(ThirdPartyService::Apollo, threshold);
        let mut opened = 0;
        for _ in 0..failures {
            if record.apply_failure("HTTP 503", threshold, now) {
                opened += 1;
            }
        }
        if failures >= threshold {
            prop_assert_eq!(record.state, CircuitState::Open);
            prop_assert_eq!(opened, 1);
        } else {
            prop_assert_eq!(record.state, CircuitState::Closed);
            prop_assert_eq!(opened, 0);
        }
    }

    #[test]
    fn retry_delay_never_exceeds_cap(
        attempt in 1u32..20,
        base_secs in 1u64..30,
        cap_secs in 30u64..600
    ) {
        let policy = RetryPolicy::new(3, Duration::from_secs(base_secs), Duration::from_secs(cap_secs));
        let delay = policy.delay_for_attempt(attempt);
        prop_assert!(delay <= Duration::from_secs(cap_secs));
        prop_assert!(delay > Duration::ZERO);
    }

    #[test]
    fn retries_stop_at_max_attempts(max in 1u32..10, failed in 0u32..20) {
        let policy = RetryPolicy::new(max, Duration::from_secs(1), Duration::from_secs(60));
        prop_assert_eq!(policy.should_retry(failed), failed < max);
    }
}
