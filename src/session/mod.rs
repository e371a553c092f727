//! Session-scoped token storage.
//!
//! Every caller session owns one [`TokenSet`] slot per connector, keyed by
//! connector id so several storage/publication connectors can coexist in the
//! same session without collision. Slots live exactly as long as the session:
//! they are held in memory only and are never written to disk or any other
//! store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// Credential record for one connector within one session.
///
/// A single record carries the whole login lifecycle: the PKCE material and
/// CSRF nonce stored at login start, then the token fields merged in on
/// callback and on every refresh, plus the remote identity fetched after the
/// code exchange. Logout (or an unrecoverable refresh failure) drops the
/// record entirely.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenSet {
    /// CSRF nonce issued at login start, echoed back by the provider
    pub state_nonce: Option<String>,
    /// PKCE code verifier, kept until the code exchange
    pub code_verifier: Option<String>,
    /// PKCE code challenge (URL-safe base64 of SHA-256(verifier))
    pub code_challenge: Option<String>,
    /// OAuth access token
    pub access_token: Option<String>,
    /// Token type as reported by the provider (usually "bearer")
    pub token_type: Option<String>,
    /// Seconds until expiry, relative to `created_at`
    pub expires_in: Option<i64>,
    /// OAuth refresh token
    pub refresh_token: Option<String>,
    /// Unix timestamp the provider issued the token at
    pub created_at: Option<i64>,
    /// OpenID identity token, when the granted scope includes one
    pub id_token: Option<String>,
    /// Scope string actually granted
    pub scope: Option<String>,
    /// Remote account id
    pub user_id: Option<u64>,
    /// Remote account username
    pub username: Option<String>,
}

impl TokenSet {
    /// True once an access token is present. No remote validation.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }
}

/// One caller session: a map of connector id → token slot.
///
/// Thread-safe; connector implementations receive `&Session` and mutate
/// their own slot through the methods below.
pub struct Session {
    id: String,
    slots: Mutex<HashMap<String, TokenSet>>,
}

impl Session {
    /// Create a session with a random (UUIDv4) id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Create a session with a caller-supplied id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the token slot for a connector, if any.
    pub fn tokens(&self, connector_id: &str) -> Option<TokenSet> {
        self.slots.lock().unwrap().get(connector_id).cloned()
    }

    /// Replace the token slot for a connector.
    pub fn put_tokens(&self, connector_id: &str, tokens: TokenSet) {
        self.slots
            .lock()
            .unwrap()
            .insert(connector_id.to_string(), tokens);
    }

    /// Mutate the token slot for a connector in place, creating an empty
    /// slot first if none exists yet.
    pub fn update_tokens(&self, connector_id: &str, f: impl FnOnce(&mut TokenSet)) {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(connector_id.to_string()).or_default();
        f(slot);
    }

    /// Drop the token slot for a connector. Returns whether one existed.
    pub fn clear_tokens(&self, connector_id: &str) -> bool {
        self.slots.lock().unwrap().remove(connector_id).is_some()
    }

    /// Whether the session holds an access token for a connector.
    pub fn is_authenticated(&self, connector_id: &str) -> bool {
        self.slots
            .lock()
            .unwrap()
            .get(connector_id)
            .map(TokenSet::is_authenticated)
            .unwrap_or(false)
    }

    /// Connector ids with a token slot in this session, sorted.
    pub fn connected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live sessions keyed by session id.
///
/// The HTTP layer resolves the caller's bearer token to a session here.
/// Removing an entry drops the session and every token slot in it.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create and register a fresh session.
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        self.sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Resolve a session id, registering a new session under that id when
    /// none exists (first request from a fresh browser session).
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        Arc::clone(
            &self
                .sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Session::with_id(id))),
        )
    }

    /// First session matching a predicate.
    ///
    /// The OAuth callback arrives without the caller's bearer token, so the
    /// HTTP layer finds the session holding the echoed state nonce this way.
    pub fn find(&self, predicate: impl Fn(&Session) -> bool) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a session and all tokens it holds.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
