//! Tests for `whatsapp::jid` recipient validation.

use hearth::channel::ChannelError;
use hearth::whatsapp::jid::{Jid, JidKind};

#[test]
fn phone_numbers_become_user_jids() {
    let jid = Jid::parse_direct("+44 7700 900123".replace(' ', "").as_str()).expect("phone");
    assert_eq!(jid.to_string(), "447700900123@s.whatsapp.net");
    assert_eq!(jid.kind(), JidKind::User);
}

#[test]
fn lid_and_legacy_servers_are_direct() {
    assert_eq!(
        Jid::parse_direct("123456789012345@lid").expect("lid").kind(),
        JidKind::Lid
    );
    assert!(Jid::parse_direct("15551234567@c.us").is_ok());
}

#[test]
fn device_suffix_is_stripped_from_user() {
    let jid = Jid::parse("15551234567:12@s.whatsapp.net").expect("device jid");
    assert_eq!(jid.user(), "15551234567");
}

#[test]
fn non_direct_targets_are_poison() {
    for raw in [
        "120363025555555555@g.us",
        "status@broadcast",
        "120363111111111111@newsletter",
    ] {
        let err = Jid::parse_direct(raw).expect_err("not direct");
        assert!(err.is_permanent(), "{raw} should be permanent");
    }
}

#[test]
fn garbage_is_rejected() {
    for raw in ["", "hello", "123", "someone@example.com", "@s.whatsapp.net"] {
        assert!(
            matches!(Jid::parse(raw), Err(ChannelError::InvalidRecipient { .. })),
            "{raw:?} should be rejected"
        );
    }
}
