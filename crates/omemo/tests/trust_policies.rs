//! Manual and first-use trust across real contexts.

mod common;

use common::{init_tracing, pump, Party};
use tern_omemo::fingerprint;
use tern_omemo::{OmemoError, SessionState, TrustMode};

#[test]
fn manual_untrust_is_not_undone_by_seeing_the_identity_again() {
    init_tracing();
    let a = Party::new("a@example.org", 1, TrustMode::Manual, &["b@example.org"]);
    let b = Party::new("b@example.org", 2, TrustMode::Blind, &["a@example.org"]);
    a.log.0.lock().accept_trust = true;
    let all = [&a, &b];
    for party in all {
        party.ctx.on_connect().unwrap();
    }
    pump(&all);

    let fp = b.ctx.own_fingerprint(true);
    {
        let log = a.log.0.lock();
        assert_eq!(log.prompts.len(), 1);
        assert_eq!(log.prompts[0].1, b.device());
        assert_eq!(log.prompts[0].2, fp);
    }
    assert_eq!(
        a.ctx.session_state(&b.jid, b.device()).unwrap(),
        SessionState::Established
    );

    assert_eq!(a.ctx.untrust(&b.jid, &fp).unwrap(), b.device());
    assert!(!a.ctx.is_trusted(&b.jid, b.device()).unwrap());
    assert_ne!(
        a.ctx.session_state(&b.jid, b.device()).unwrap(),
        SessionState::Established
    );

    // The same bundle again, and the user declines this time.
    a.log.0.lock().accept_trust = false;
    a.ctx.start_session(&b.jid).unwrap();
    pump(&all);
    assert_eq!(a.log.0.lock().prompts.len(), 2);
    assert_ne!(
        a.ctx.session_state(&b.jid, b.device()).unwrap(),
        SessionState::Established
    );

    // A message from the untrusted device is refused with a warning.
    b.ctx.send_message(&a.jid, b"still there?", false).unwrap();
    let err = a
        .ctx
        .decrypt_incoming(&b.jid, &b.last_sent())
        .unwrap_err();
    assert!(matches!(err, OmemoError::Untrusted { .. }));
    assert!(a
        .log
        .0
        .lock()
        .warnings
        .iter()
        .any(|w| w.contains(&fp)));
    assert_ne!(
        a.ctx.session_state(&b.jid, b.device()).unwrap(),
        SessionState::Established
    );

    // Only an explicit trust brings the session back, without another prompt.
    assert_eq!(a.ctx.trust(&b.jid, &fp).unwrap(), b.device());
    pump(&all);
    assert_eq!(
        a.ctx.session_state(&b.jid, b.device()).unwrap(),
        SessionState::Established
    );
    assert_eq!(a.log.0.lock().prompts.len(), 2);
}

#[test]
fn first_use_promotes_a_device_seen_in_a_message() {
    init_tracing();
    let a = Party::new("a@example.org", 1, TrustMode::FirstUsage, &[]);
    let b = Party::new("b@example.org", 2, TrustMode::Blind, &["a@example.org"]);
    let all = [&a, &b];
    for party in all {
        party.ctx.on_connect().unwrap();
    }
    pump(&all);

    b.ctx.send_message(&a.jid, b"hi", false).unwrap();
    let err = a
        .ctx
        .decrypt_incoming(&b.jid, &b.last_sent())
        .unwrap_err();
    assert!(matches!(err, OmemoError::Untrusted { .. }));

    // The identity is cached even though it was refused.
    let fp = b.ctx.own_fingerprint(true);
    assert_eq!(
        a.ctx.known_fingerprints(&b.jid).unwrap(),
        vec![(b.device(), fp.clone(), false)]
    );

    // The device list that follows promotes it and a session is built.
    pump(&all);
    assert!(a.ctx.is_trusted(&b.jid, b.device()).unwrap());
    assert_eq!(
        a.ctx.session_state(&b.jid, b.device()).unwrap(),
        SessionState::Established
    );
    assert_eq!(
        a.ctx.known_fingerprints(&b.jid).unwrap(),
        vec![(b.device(), fp, true)]
    );

    b.ctx.send_message(&a.jid, b"again", false).unwrap();
    let (plaintext, trusted) = a.ctx.decrypt_incoming(&b.jid, &b.last_sent()).unwrap();
    assert_eq!(plaintext, b"again");
    assert!(trusted);
    assert!(a.log.0.lock().prompts.is_empty());
}

#[test]
fn first_use_does_not_trust_a_brand_new_contact() {
    init_tracing();
    let a = Party::new("a@example.org", 1, TrustMode::FirstUsage, &["c@example.org"]);
    let c = Party::new("c@example.org", 3, TrustMode::Blind, &[]);
    let all = [&a, &c];
    for party in all {
        party.ctx.on_connect().unwrap();
    }
    pump(&all);

    assert!(!a.ctx.is_trusted(&c.jid, c.device()).unwrap());
    assert_ne!(
        a.ctx.session_state(&c.jid, c.device()).unwrap(),
        SessionState::Established
    );
    // The bundle sighting is cached for a later decision.
    assert_eq!(a.ctx.known_fingerprints(&c.jid).unwrap().len(), 1);
}

#[test]
fn fingerprints_agree_across_devices_and_formats() {
    init_tracing();
    let a = Party::new("a@example.org", 1, TrustMode::Blind, &["b@example.org"]);
    let b = Party::new("b@example.org", 2, TrustMode::Blind, &[]);
    let all = [&a, &b];
    for party in all {
        party.ctx.on_connect().unwrap();
    }
    pump(&all);

    let formatted = b.ctx.own_fingerprint(true);
    let raw = b.ctx.own_fingerprint(false);
    assert_eq!(
        fingerprint::parse(&formatted).unwrap(),
        fingerprint::parse(&raw).unwrap()
    );
    assert_eq!(raw.len(), 64);
    assert!(formatted
        .split('-')
        .all(|group| group.len() == 8));

    let seen = a.ctx.known_fingerprints(&b.jid).unwrap();
    assert_eq!(seen, vec![(b.device(), formatted, true)]);
}

#[test]
fn trusting_an_unknown_fingerprint_fails() {
    init_tracing();
    let a = Party::new("a@example.org", 1, TrustMode::Manual, &[]);
    let b = Party::new("b@example.org", 2, TrustMode::Manual, &[]);
    let err = a
        .ctx
        .trust(&b.jid, &b.ctx.own_fingerprint(true))
        .unwrap_err();
    assert!(matches!(err, OmemoError::UnknownFingerprint { .. }));

    let err = a.ctx.trust(&b.jid, "not a fingerprint").unwrap_err();
    assert!(matches!(err, OmemoError::InvalidFingerprint(_)));
}
