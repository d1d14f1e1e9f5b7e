//! Tests for the `/pair` lockout window.

use chrono::{Duration, TimeZone, Utc};

use hearth::channel::pairing::{PairingDecision, PairingGuard, PairingPolicy};

fn policy() -> PairingPolicy {
    PairingPolicy {
        max_failures: 3,
        window: Duration::minutes(15),
        block: Duration::minutes(15),
    }
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
        .single()
        .expect("valid time")
}

#[test]
fn third_failure_locks_out_even_the_right_token() {
    let guard = PairingGuard::new(Some("s3cret".to_owned()), policy());
    let now = t0();

    assert_eq!(
        guard.attempt("alice", "nope", now),
        PairingDecision::Invalid { failures: 1 }
    );
    assert_eq!(
        guard.attempt("alice", "nope", now + Duration::seconds(10)),
        PairingDecision::Invalid { failures: 2 }
    );
    assert_eq!(
        guard.attempt("alice", "nope", now + Duration::seconds(20)),
        PairingDecision::LockedOut {
            retry_after: Duration::minutes(15)
        }
    );

    let locked = guard.attempt("alice", "s3cret", now + Duration::minutes(5));
    assert!(matches!(locked, PairingDecision::LockedOut { retry_after }
        if retry_after == Duration::minutes(10) + Duration::seconds(20)));

    assert_eq!(
        guard.attempt("alice", "s3cret", now + Duration::minutes(16)),
        PairingDecision::Paired
    );
    assert!(guard.state_for("alice").is_none(), "success clears state");
}

#[test]
fn lockout_is_per_sender() {
    let guard = PairingGuard::new(Some("s3cret".to_owned()), policy());
    let now = t0();
    for _ in 0..3 {
        guard.attempt("mallory", "guess", now);
    }
    assert!(matches!(
        guard.attempt("mallory", "s3cret", now),
        PairingDecision::LockedOut { .. }
    ));
    assert_eq!(guard.attempt("bob", "s3cret", now), PairingDecision::Paired);
}

#[test]
fn failures_outside_the_window_start_over() {
    let guard = PairingGuard::new(Some("s3cret".to_owned()), policy());
    let now = t0();

    guard.attempt("alice", "a", now);
    guard.attempt("alice", "b", now + Duration::minutes(1));
    assert_eq!(
        guard.attempt("alice", "c", now + Duration::minutes(17)),
        PairingDecision::Invalid { failures: 1 }
    );
    let state = guard.state_for("alice").expect("tracked");
    assert_eq!(state.window_started_at, now + Duration::minutes(17));
    assert!(state.blocked_until.is_none());
}

#[test]
fn missing_token_disables_pairing() {
    let guard = PairingGuard::new(None, PairingPolicy::default());
    assert!(!guard.is_enabled());
    assert_eq!(guard.attempt("alice", "anything", t0()), PairingDecision::Disabled);
}

#[test]
fn default_policy_matches_config_defaults() {
    let policy = PairingPolicy::default();
    assert_eq!(policy.max_failures, 5);
    assert_eq!(policy.window, Duration::minutes(15));
    assert_eq!(policy.block, Duration::minutes(15));
}
