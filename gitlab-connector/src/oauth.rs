//! OAuth2/PKCE login flow.
//!
//! Login walks the standard authorization-code dance with PKCE: start
//! stores verifier/challenge/nonce in the session slot and redirects to
//! GitLab, the callback validates the nonce and exchanges the code, then
//! the remote identity is fetched and stored next to the token. Refresh
//! is not exposed here; the gateway triggers it on 401 (see `gateway`).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sitegit::{Connector, RemoteUser, Session, TokenSet};
use tracing::info;

use crate::config::GitlabConfig;
use crate::website::GitlabConnector;

/// PKCE verifier/challenge pair for one login attempt.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// Generate a fresh PKCE pair.
///
/// 96 random bytes encode to a 128-character URL-safe verifier, the
/// maximum length RFC 7636 allows. The challenge is the URL-safe base64
/// of SHA-256(verifier), sent with `code_challenge_method=S256`.
pub fn generate_pkce() -> PkcePair {
    let mut bytes = [0u8; 96];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    PkcePair {
        verifier,
        challenge,
    }
}

/// Random nonce carried through the `state` parameter against CSRF.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the GitLab authorize URL for one login attempt.
pub fn build_authorize_url(config: &GitlabConfig, state: &str, challenge: &str) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&state={}&scope={}&code_challenge={}&code_challenge_method=S256",
        config.authorize_url(),
        urlencoding::encode(&config.client_id),
        urlencoding::encode(&config.redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(&config.scope),
        urlencoding::encode(challenge),
    )
}

/// Token endpoint response, shared by both grant types.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Merge the returned fields into a session slot, leaving fields the
    /// provider omitted untouched (a refresh response may skip some).
    pub fn merge_into(self, slot: &mut TokenSet) {
        slot.access_token = Some(self.access_token);
        if self.token_type.is_some() {
            slot.token_type = self.token_type;
        }
        if self.expires_in.is_some() {
            slot.expires_in = self.expires_in;
        }
        if self.refresh_token.is_some() {
            slot.refresh_token = self.refresh_token;
        }
        slot.created_at = self.created_at.or_else(|| Some(Utc::now().timestamp()));
        if self.id_token.is_some() {
            slot.id_token = self.id_token;
        }
        if self.scope.is_some() {
            slot.scope = self.scope;
        }
    }
}

/// Exchange an authorization code for tokens (`authorization_code` grant).
pub async fn exchange_code(
    http: &reqwest::Client,
    config: &GitlabConfig,
    code: &str,
    verifier: &str,
) -> Result<TokenResponse> {
    let mut params = vec![
        ("grant_type", "authorization_code".to_string()),
        ("client_id", config.client_id.clone()),
        ("code", code.to_string()),
        ("code_verifier", verifier.to_string()),
        ("redirect_uri", config.redirect_uri.clone()),
    ];
    if !config.client_secret.is_empty() {
        params.push(("client_secret", config.client_secret.clone()));
    }
    request_token(http, config, &params).await
}

/// Trade a refresh token for a new token set (`refresh_token` grant).
pub async fn refresh_token(
    http: &reqwest::Client,
    config: &GitlabConfig,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let mut params = vec![
        ("grant_type", "refresh_token".to_string()),
        ("client_id", config.client_id.clone()),
        ("refresh_token", refresh_token.to_string()),
        ("redirect_uri", config.redirect_uri.clone()),
    ];
    if !config.client_secret.is_empty() {
        params.push(("client_secret", config.client_secret.clone()));
    }
    request_token(http, config, &params).await
}

async fn request_token(
    http: &reqwest::Client,
    config: &GitlabConfig,
    params: &[(&str, String)],
) -> Result<TokenResponse> {
    let response = http
        .post(config.token_url())
        .form(params)
        .send()
        .await
        .context("posting to the token endpoint")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("token endpoint returned {status}: {body}");
    }

    response
        .json::<TokenResponse>()
        .await
        .context("parsing the token endpoint response")
}

/// Identity payload of `GET /user`.
#[derive(Debug, Deserialize)]
struct GitlabUser {
    id: u64,
    username: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    web_url: Option<String>,
}

impl From<GitlabUser> for RemoteUser {
    fn from(user: GitlabUser) -> Self {
        RemoteUser {
            id: user.id,
            username: user.username,
            name: user.name,
            email: user.email,
            avatar_url: user.avatar_url,
            profile_url: user.web_url,
        }
    }
}

impl GitlabConnector {
    /// Fetch the logged-in identity through the gateway (so an expired
    /// token gets its one refresh attempt).
    pub(crate) async fn fetch_current_user(&self, session: &Session) -> Result<RemoteUser> {
        let value = self
            .gateway()
            .execute(session, reqwest::Method::GET, "user", &[], None)
            .await
            .context("fetching the current user")?;
        let user: GitlabUser =
            serde_json::from_value(value).context("parsing the current user")?;
        Ok(user.into())
    }
}

#[async_trait]
impl Connector for GitlabConnector {
    fn id(&self) -> &str {
        "gitlab"
    }

    fn display_name(&self) -> &str {
        "GitLab"
    }

    async fn begin_login(&self, session: &Session) -> Result<String> {
        let pkce = generate_pkce();
        let nonce = generate_nonce();

        // A fresh login replaces the whole slot; stale tokens from an
        // earlier account must not survive into the new attempt.
        session.put_tokens(
            self.id(),
            TokenSet {
                state_nonce: Some(nonce.clone()),
                code_verifier: Some(pkce.verifier.clone()),
                code_challenge: Some(pkce.challenge.clone()),
                ..Default::default()
            },
        );

        info!(connector = self.id(), session = session.id(), "login started");
        Ok(build_authorize_url(
            &self.config().gitlab,
            &nonce,
            &pkce.challenge,
        ))
    }

    async fn complete_login(
        &self,
        session: &Session,
        code: &str,
        state: &str,
    ) -> Result<RemoteUser> {
        let slot = session.tokens(self.id()).unwrap_or_default();

        if slot.state_nonce.as_deref() != Some(state) {
            self.logout(session);
            bail!("invalid state: the login nonce does not match");
        }
        let Some(verifier) = slot.code_verifier else {
            self.logout(session);
            bail!("missing code verifier: restart the login flow");
        };
        if slot.code_challenge.is_none() {
            self.logout(session);
            bail!("missing code challenge: restart the login flow");
        }

        let tokens = exchange_code(self.gateway().http(), &self.config().gitlab, code, &verifier)
            .await
            .context("exchanging the authorization code")?;
        session.update_tokens(self.id(), |slot| tokens.merge_into(slot));

        let user = self.fetch_current_user(session).await?;
        session.update_tokens(self.id(), |slot| {
            slot.user_id = Some(user.id);
            slot.username = Some(user.username.clone());
            // One-shot material; nothing should accept it twice
            slot.state_nonce = None;
            slot.code_verifier = None;
            slot.code_challenge = None;
        });

        info!(
            connector = self.id(),
            username = %user.username,
            "login completed"
        );
        Ok(user)
    }

    fn is_authenticated(&self, session: &Session) -> bool {
        session.is_authenticated(self.id())
    }

    async fn current_user(&self, session: &Session) -> Result<RemoteUser> {
        self.fetch_current_user(session).await
    }

    fn logout(&self, session: &Session) {
        if session.clear_tokens(self.id()) {
            info!(connector = self.id(), session = session.id(), "logged out");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sitegit::SessionRegistry;

    use super::*;
    use crate::config::ConnectorConfig;

    fn connector() -> GitlabConnector {
        let mut config = ConnectorConfig::default();
        config.gitlab.client_id = "client-123".to_string();
        GitlabConnector::new(Arc::new(config))
    }

    #[test]
    fn verifier_is_max_length_url_safe() {
        let pkce = generate_pkce();
        assert_eq!(pkce.verifier.len(), 128);
        assert!(pkce
            .verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn challenge_matches_the_rfc_7636_vector() {
        let challenge =
            URL_SAFE_NO_PAD.encode(Sha256::digest("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"));
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn pkce_pairs_are_unique_per_login() {
        let a = generate_pkce();
        let b = generate_pkce();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn authorize_url_carries_the_pkce_params() {
        let mut config = GitlabConfig::default();
        config.client_id = "client-123".to_string();
        config.redirect_uri = "http://localhost:6805/api/connector/callback".to_string();

        let url = build_authorize_url(&config, "nonce-abc", "challenge-xyz");
        assert!(url.starts_with("https://gitlab.com/oauth/authorize?"));
        assert!(url.contains("client_id=client-123"));
        assert!(url.contains("state=nonce-abc"));
        assert!(url.contains("code_challenge=challenge-xyz"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A6805%2Fapi%2Fconnector%2Fcallback"
        ));
    }

    #[tokio::test]
    async fn begin_login_stores_the_material() {
        let connector = connector();
        let registry = SessionRegistry::new();
        let session = registry.create();

        let url = connector.begin_login(&session).await.unwrap();
        let slot = session.tokens("gitlab").unwrap();
        assert!(slot.code_verifier.is_some());
        assert!(slot.code_challenge.is_some());
        let nonce = slot.state_nonce.unwrap();
        assert!(url.contains(&format!("state={}", urlencoding::encode(&nonce))));
        assert!(!connector.is_authenticated(&session));
    }

    #[tokio::test]
    async fn nonce_mismatch_fails_and_logs_out() {
        let connector = connector();
        let registry = SessionRegistry::new();
        let session = registry.create();
        connector.begin_login(&session).await.unwrap();

        let error = connector
            .complete_login(&session, "some-code", "wrong-nonce")
            .await
            .unwrap_err();
        assert!(error.to_string().contains("invalid state"));
        assert!(session.tokens("gitlab").is_none());
    }

    #[tokio::test]
    async fn missing_verifier_fails_and_logs_out() {
        let connector = connector();
        let registry = SessionRegistry::new();
        let session = registry.create();
        session.put_tokens(
            "gitlab",
            TokenSet {
                state_nonce: Some("nonce".to_string()),
                ..Default::default()
            },
        );

        let error = connector
            .complete_login(&session, "some-code", "nonce")
            .await
            .unwrap_err();
        assert!(error.to_string().contains("missing code verifier"));
        assert!(session.tokens("gitlab").is_none());
    }

    #[test]
    fn merge_keeps_fields_the_response_omits() {
        let mut slot = TokenSet {
            refresh_token: Some("keep-me".to_string()),
            user_id: Some(42),
            ..Default::default()
        };
        let response = TokenResponse {
            access_token: "fresh".to_string(),
            token_type: Some("bearer".to_string()),
            expires_in: Some(7200),
            refresh_token: None,
            created_at: Some(1_700_000_000),
            id_token: None,
            scope: None,
        };

        response.merge_into(&mut slot);
        assert_eq!(slot.access_token.as_deref(), Some("fresh"));
        assert_eq!(slot.refresh_token.as_deref(), Some("keep-me"));
        assert_eq!(slot.created_at, Some(1_700_000_000));
        assert_eq!(slot.user_id, Some(42));
    }
}
