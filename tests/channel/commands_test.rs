//! Tests for the privileged command parser.

use chrono::{Duration, TimeZone, Utc};

use hearth::channel::commands::{
    CommandAction, CommandHandler, INVALID_TOKEN_RESPONSE, PAIRING_DISABLED_RESPONSE,
};
use hearth::channel::pairing::{PairingGuard, PairingPolicy};

fn handler(token: Option<&str>, max_failures: u32) -> CommandHandler {
    let policy = PairingPolicy {
        max_failures,
        window: Duration::minutes(15),
        block: Duration::minutes(15),
    };
    CommandHandler::new(PairingGuard::new(token.map(str::to_owned), policy))
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
        .single()
        .expect("valid time")
}

#[test]
fn stranger_gets_restricted_notice_with_id() {
    let h = handler(Some("s3cret"), 5);
    let out = h.handle("15550000001", "hello there", false);
    assert!(out.handled);
    assert!(out.action.is_none());
    let text = out.response.expect("reply");
    assert!(text.starts_with("Access restricted."));
    assert!(text.contains("Your ID: 15550000001"));
    assert!(text.contains("Send /pair <token>"));
}

#[test]
fn restricted_notice_without_token_explains_whitelist() {
    let h = handler(None, 5);
    let text = h
        .handle("15550000001", "/new", false)
        .response
        .expect("reply");
    assert!(text.contains("Pairing is disabled"));
}

#[test]
fn plain_text_from_whitelisted_user_passes_through() {
    let h = handler(Some("s3cret"), 5);
    let out = h.handle("15551234567", "what's on today?", true);
    assert!(!out.handled);
    assert!(out.response.is_none());
    assert!(out.action.is_none());
}

#[test]
fn unknown_slash_command_passes_through() {
    let h = handler(None, 5);
    assert!(!h.handle("15551234567", "/weather berlin", true).handled);
}

#[test]
fn new_and_remember_produce_actions() {
    let h = handler(None, 5);
    assert_eq!(
        h.handle("u", "/NEW", true).action,
        Some(CommandAction::NewSession)
    );
    assert_eq!(
        h.handle("u", "  /remember  call mum on sunday ", true).action,
        Some(CommandAction::Remember("call mum on sunday".to_owned()))
    );
    let usage = h.handle("u", "/remember", true);
    assert!(usage.action.is_none());
    assert_eq!(
        usage.response.as_deref(),
        Some("Usage: /remember <text to remember>")
    );
}

#[test]
fn pair_without_token_shows_usage() {
    let h = handler(Some("s3cret"), 3);
    let out = h.handle_at("u", "/pair", false, t0());
    assert_eq!(out.response.as_deref(), Some("Usage: /pair <token>"));
    assert!(h.pairing().state_for("u").is_none(), "not counted as a failure");
}

#[test]
fn bare_pair_from_locked_out_sender_reports_lockout() {
    let h = handler(Some("s3cret"), 3);
    let now = t0();
    for i in 0..3 {
        h.handle_at("u", "/pair wrong", false, now + Duration::seconds(i));
    }

    let out = h.handle_at("u", "/pair", false, now + Duration::minutes(5));
    assert_eq!(
        out.response.as_deref(),
        Some("Too many failed pairing attempts. Try again in 11 minutes.")
    );
    assert_eq!(
        h.pairing().locked_out_for("u", now + Duration::minutes(5)),
        Some(Duration::minutes(10) + Duration::seconds(2))
    );

    let after = h.handle_at("u", "/pair", false, now + Duration::minutes(16));
    assert_eq!(after.response.as_deref(), Some("Usage: /pair <token>"));
}

#[test]
fn pair_when_disabled() {
    let h = handler(None, 3);
    let out = h.handle_at("u", "/pair s3cret", false, t0());
    assert_eq!(out.response.as_deref(), Some(PAIRING_DISABLED_RESPONSE));
    assert!(out.action.is_none());
}

#[test]
fn pair_lockout_sequence() {
    let h = handler(Some("s3cret"), 3);
    let now = t0();

    for i in 0..2 {
        let out = h.handle_at("u", "/pair wrong", false, now + Duration::seconds(i));
        assert_eq!(out.response.as_deref(), Some(INVALID_TOKEN_RESPONSE));
    }
    let third = h.handle_at("u", "/pair wrong", false, now + Duration::seconds(2));
    assert_eq!(
        third.response.as_deref(),
        Some("Too many failed pairing attempts. Try again in 15 minutes.")
    );

    let blocked = h.handle_at("u", "/pair s3cret", false, now + Duration::minutes(1));
    assert!(blocked.action.is_none());
    assert!(blocked
        .response
        .expect("reply")
        .starts_with("Too many failed pairing attempts."));

    let paired = h.handle_at("u", "/pair s3cret", false, now + Duration::minutes(16));
    assert_eq!(paired.action, Some(CommandAction::Pair("u".to_owned())));
    assert!(paired.response.is_none());
}

#[test]
fn pair_is_accepted_from_whitelisted_sender_too() {
    let h = handler(Some("s3cret"), 3);
    let out = h.handle_at("u", "/pair s3cret", true, t0());
    assert_eq!(out.action, Some(CommandAction::Pair("u".to_owned())));
}
