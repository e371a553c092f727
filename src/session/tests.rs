use super::*;

fn connected_tokens() -> TokenSet {
    TokenSet {
        access_token: Some("glpat-test".to_string()),
        token_type: Some("bearer".to_string()),
        refresh_token: Some("refresh-test".to_string()),
        expires_in: Some(7200),
        created_at: Some(1_700_000_000),
        ..Default::default()
    }
}

#[test]
fn slots_are_keyed_by_connector_id() {
    let session = Session::new();
    session.put_tokens("gitlab", connected_tokens());

    let mut other = connected_tokens();
    other.username = Some("alice".to_string());
    session.put_tokens("gitlab-hosting", other);

    assert!(session.tokens("gitlab").unwrap().username.is_none());
    assert_eq!(
        session.tokens("gitlab-hosting").unwrap().username.as_deref(),
        Some("alice")
    );
    assert!(session.tokens("github").is_none());
    assert_eq!(session.connected(), vec!["gitlab", "gitlab-hosting"]);
}

#[test]
fn update_creates_missing_slot() {
    let session = Session::new();
    session.update_tokens("gitlab", |slot| {
        slot.code_verifier = Some("verifier".to_string());
        slot.state_nonce = Some("nonce".to_string());
    });

    let slot = session.tokens("gitlab").unwrap();
    assert_eq!(slot.code_verifier.as_deref(), Some("verifier"));
    assert!(slot.access_token.is_none());
}

#[test]
fn update_preserves_untouched_fields() {
    let session = Session::new();
    session.put_tokens("gitlab", connected_tokens());
    session.update_tokens("gitlab", |slot| {
        slot.access_token = Some("rotated".to_string());
    });

    let slot = session.tokens("gitlab").unwrap();
    assert_eq!(slot.access_token.as_deref(), Some("rotated"));
    assert_eq!(slot.refresh_token.as_deref(), Some("refresh-test"));
}

#[test]
fn authentication_tracks_access_token_presence() {
    let session = Session::new();
    assert!(!session.is_authenticated("gitlab"));

    session.update_tokens("gitlab", |slot| {
        slot.code_verifier = Some("verifier".to_string());
    });
    // Login started but no token yet.
    assert!(!session.is_authenticated("gitlab"));

    session.put_tokens("gitlab", connected_tokens());
    assert!(session.is_authenticated("gitlab"));

    assert!(session.clear_tokens("gitlab"));
    assert!(!session.is_authenticated("gitlab"));
    assert!(!session.clear_tokens("gitlab"));
}

#[test]
fn registry_resolves_and_removes_sessions() {
    let registry = SessionRegistry::new();
    assert!(registry.is_empty());

    let session = registry.create();
    session.put_tokens("gitlab", connected_tokens());

    let found = registry.get(session.id()).unwrap();
    assert!(found.is_authenticated("gitlab"));

    assert!(registry.remove(session.id()));
    assert!(registry.get(session.id()).is_none());
    assert!(registry.is_empty());
}

#[test]
fn get_or_create_registers_under_caller_id() {
    let registry = SessionRegistry::new();
    let first = registry.get_or_create("session-abc");
    first.put_tokens("gitlab", connected_tokens());

    let second = registry.get_or_create("session-abc");
    assert!(second.is_authenticated("gitlab"));
    assert_eq!(registry.len(), 1);
}

#[test]
fn find_locates_a_session_by_its_slot_contents() {
    let registry = SessionRegistry::new();
    registry.create();
    let target = registry.create();
    target.update_tokens("gitlab", |slot| {
        slot.state_nonce = Some("nonce-xyz".to_string());
    });

    let found = registry
        .find(|session| {
            session
                .tokens("gitlab")
                .and_then(|slot| slot.state_nonce)
                .as_deref()
                == Some("nonce-xyz")
        })
        .unwrap();
    assert_eq!(found.id(), target.id());

    assert!(registry
        .find(|session| session.is_authenticated("gitlab"))
        .is_none());
}
