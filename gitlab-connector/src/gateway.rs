//! Authenticated REST gateway to one GitLab instance.
//!
//! Every remote call of the connector funnels through [`Gateway::execute`]
//! (or its raw-text sibling): it builds the URL, attaches the session's
//! bearer token, serializes the body, and normalizes failures into
//! [`ApiError`]. A 401 with a refresh token on hand gets exactly one
//! transparent refresh-and-retry; a second rejection logs the session out.

use std::fmt;
use std::sync::Arc;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use sitegit::Session;
use tracing::{debug, warn};

use crate::config::ConnectorConfig;
use crate::oauth;

/// Failure taxonomy of one gateway call.
#[derive(Debug)]
pub enum ApiError {
    /// Network-level failure, surfaced as-is. Never retried.
    Transport(reqwest::Error),
    /// The provider says the target does not exist (404 status or a
    /// missing-file body). Tree listings tolerate this as "empty".
    NotFound { path: String },
    /// The session cannot authenticate anymore; it has already been
    /// logged out when this surfaces.
    Authorization(String),
    /// Any other non-success, status and body verbatim.
    Api { status: u16, body: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Transport(error) => write!(f, "transport error: {error}"),
            ApiError::NotFound { path } => write!(f, "not found: {path}"),
            ApiError::Authorization(message) => write!(f, "authorization failed: {message}"),
            ApiError::Api { status, body } => write!(f, "api error {status}: {body}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Transport(error) => Some(error),
            _ => None,
        }
    }
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, ApiError::Authorization(_))
    }
}

fn is_missing(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND || body.to_lowercase().contains("not found")
}

/// REST client bound to one GitLab instance and one connector id.
///
/// Holds no token itself; the token comes from the session passed to each
/// call, so one gateway serves every logged-in session. Cloning shares the
/// underlying HTTP client, which lets background work own a handle.
#[derive(Clone)]
pub struct Gateway {
    http: reqwest::Client,
    config: Arc<ConnectorConfig>,
    connector_id: String,
}

impl Gateway {
    pub fn new(config: Arc<ConnectorConfig>, connector_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            connector_id: connector_id.into(),
        }
    }

    /// Underlying HTTP client, shared with the token-endpoint calls.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.gitlab.api_root(),
            path.trim_start_matches('/')
        )
    }

    /// Call the API and parse the response as JSON, falling back to the
    /// raw text wrapped in a JSON string for non-JSON endpoints.
    pub async fn execute(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let response = self
            .request_with_refresh(session, method, path, query, body)
            .await?;
        let text = response.text().await.map_err(ApiError::Transport)?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        match serde_json::from_str(&text) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(text)),
        }
    }

    /// Call the API and return the raw response body (job traces, raw
    /// file reads).
    pub async fn execute_text(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<String, ApiError> {
        let response = self
            .request_with_refresh(session, method, path, query, None)
            .await?;
        response.text().await.map_err(ApiError::Transport)
    }

    /// Like [`execute`](Self::execute) but also hands back the response
    /// headers, for paginated listings driven by `x-total-pages`.
    pub async fn execute_with_headers(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<(Value, HeaderMap), ApiError> {
        let response = self
            .request_with_refresh(session, method, path, query, None)
            .await?;
        let headers = response.headers().clone();
        let text = response.text().await.map_err(ApiError::Transport)?;
        let value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((value, headers))
    }

    async fn send_once(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let mut request = self.http.request(method, self.url(path));

        let token = session
            .tokens(&self.connector_id)
            .and_then(|slot| slot.access_token);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            let encoded = body.to_string();
            if encoded.len() > self.config.repository.body_warn_bytes {
                warn!(
                    bytes = encoded.len(),
                    ceiling = self.config.repository.body_warn_bytes,
                    path = %path,
                    "request body exceeds the warning ceiling, the provider may reject it"
                );
            }
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(encoded);
        }

        request.send().await.map_err(ApiError::Transport)
    }

    async fn request_with_refresh(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let first = self
            .send_once(session, method.clone(), path, query, body)
            .await?;
        if first.status().is_success() {
            return Ok(first);
        }

        let status = first.status();
        let text = first.text().await.unwrap_or_default();

        // Missing-target classification outranks the refresh path: a 401
        // body complaining about a missing file is still a missing file.
        if is_missing(status, &text) {
            return Err(ApiError::NotFound {
                path: path.to_string(),
            });
        }

        if status == StatusCode::UNAUTHORIZED {
            let refresh = session
                .tokens(&self.connector_id)
                .and_then(|slot| slot.refresh_token);
            if let Some(refresh) = refresh {
                return self
                    .refresh_and_retry(session, method, path, query, body, &refresh)
                    .await;
            }
        }

        Err(ApiError::Api {
            status: status.as_u16(),
            body: text,
        })
    }

    async fn refresh_and_retry(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        refresh: &str,
    ) -> Result<reqwest::Response, ApiError> {
        debug!(path = %path, "access token rejected, attempting the single refresh");
        match oauth::refresh_token(&self.http, &self.config.gitlab, refresh).await {
            Ok(tokens) => {
                session.update_tokens(&self.connector_id, |slot| tokens.merge_into(slot));
            }
            Err(error) => {
                warn!(
                    connector = %self.connector_id,
                    error = %error,
                    "token refresh failed, logging the session out"
                );
                session.clear_tokens(&self.connector_id);
                return Err(ApiError::Authorization(
                    "token refresh failed, log in again".to_string(),
                ));
            }
        }

        let retried = self.send_once(session, method, path, query, body).await?;
        if retried.status().is_success() {
            return Ok(retried);
        }

        let status = retried.status();
        let text = retried.text().await.unwrap_or_default();
        if is_missing(status, &text) {
            return Err(ApiError::NotFound {
                path: path.to_string(),
            });
        }
        if status == StatusCode::UNAUTHORIZED {
            // One refresh per call. Still rejected means the grant is gone.
            warn!(
                connector = %self.connector_id,
                "access still rejected after refresh, logging the session out"
            );
            session.clear_tokens(&self.connector_id);
            return Err(ApiError::Authorization(
                "access rejected after token refresh, log in again".to_string(),
            ));
        }
        Err(ApiError::Api {
            status: status.as_u16(),
            body: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::Matcher;
    use sitegit::{SessionRegistry, TokenSet};

    use super::*;

    fn gateway_for(server: &mockito::ServerGuard) -> Gateway {
        let mut config = ConnectorConfig::default();
        config.gitlab.domain = server.url();
        config.gitlab.client_id = "client-123".to_string();
        Gateway::new(Arc::new(config), "gitlab")
    }

    fn logged_in_session(registry: &SessionRegistry, access: &str, refresh: Option<&str>) -> Arc<Session> {
        let session = registry.create();
        session.put_tokens(
            "gitlab",
            TokenSet {
                access_token: Some(access.to_string()),
                refresh_token: refresh.map(str::to_string),
                ..Default::default()
            },
        );
        session
    }

    #[tokio::test]
    async fn execute_parses_json_and_sends_the_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v4/user")
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_body(r#"{"id": 7, "username": "alice"}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "tok-1", None);

        let value = gateway
            .execute(&session, Method::GET, "user", &[], None)
            .await
            .unwrap();
        assert_eq!(value["username"], "alice");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_json_success_comes_back_as_raw_text() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/projects/1/jobs/9/trace")
            .with_status(200)
            .with_body("line one\nline two")
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "tok-1", None);

        let value = gateway
            .execute(&session, Method::GET, "projects/1/jobs/9/trace", &[], None)
            .await
            .unwrap();
        assert_eq!(value, Value::String("line one\nline two".to_string()));
    }

    #[tokio::test]
    async fn query_params_are_forwarded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v4/projects/1/repository/tree")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("page".into(), "2".into()),
                Matcher::UrlEncoded("per_page".into(), "100".into()),
            ]))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "tok-1", None);

        gateway
            .execute(
                &session,
                Method::GET,
                "projects/1/repository/tree",
                &[("page", "2".to_string()), ("per_page", "100".to_string())],
                None,
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn oversized_bodies_are_warned_about_but_still_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v4/projects/1/repository/commits")
            .match_body(Matcher::PartialJson(
                serde_json::json!({"commit_message": "big"}),
            ))
            .with_status(201)
            .with_body(r#"{"id": "c1"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut config = ConnectorConfig::default();
        config.gitlab.domain = server.url();
        config.repository.body_warn_bytes = 16;
        let gateway = Gateway::new(Arc::new(config), "gitlab");
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "tok-1", None);

        let body = serde_json::json!({
            "commit_message": "big",
            "padding": "x".repeat(64),
        });
        gateway
            .execute(
                &session,
                Method::POST,
                "projects/1/repository/commits",
                &[],
                Some(&body),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_targets_map_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/projects/1/repository/tree")
            .with_status(404)
            .with_body(r#"{"message": "404 Tree Not Found"}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "tok-1", None);

        let error = gateway
            .execute(&session, Method::GET, "projects/1/repository/tree", &[], None)
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn missing_file_bodies_map_to_not_found_regardless_of_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/projects/1/repository/files/website.json")
            .with_status(400)
            .with_body(r#"{"message": "A file with this name was not found"}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "tok-1", None);

        let error = gateway
            .execute(
                &session,
                Method::GET,
                "projects/1/repository/files/website.json",
                &[],
                None,
            )
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn a_401_triggers_exactly_one_refresh_and_retry() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/user")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .with_body(r#"{"message": "401 Unauthorized"}"#)
            .create_async()
            .await;
        let token_mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token": "fresh", "refresh_token": "refresh-2", "expires_in": 7200}"#)
            .expect(1)
            .create_async()
            .await;
        let retried = server
            .mock("GET", "/api/v4/user")
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_body(r#"{"id": 7, "username": "alice"}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "stale", Some("refresh-1"));

        let value = gateway
            .execute(&session, Method::GET, "user", &[], None)
            .await
            .unwrap();
        assert_eq!(value["id"], 7);
        token_mock.assert_async().await;
        retried.assert_async().await;

        let slot = session.tokens("gitlab").unwrap();
        assert_eq!(slot.access_token.as_deref(), Some("fresh"));
        assert_eq!(slot.refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn refresh_failure_logs_out_and_surfaces_authorization() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/user")
            .with_status(401)
            .with_body(r#"{"message": "401 Unauthorized"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "stale", Some("refresh-1"));

        let error = gateway
            .execute(&session, Method::GET, "user", &[], None)
            .await
            .unwrap_err();
        assert!(error.is_authorization());
        assert!(session.tokens("gitlab").is_none());
    }

    #[tokio::test]
    async fn a_second_401_never_refreshes_again() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/user")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .with_body(r#"{"message": "401 Unauthorized"}"#)
            .create_async()
            .await;
        let token_mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token": "fresh"}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v4/user")
            .match_header("authorization", "Bearer fresh")
            .with_status(401)
            .with_body(r#"{"message": "401 Unauthorized"}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "stale", Some("refresh-1"));

        let error = gateway
            .execute(&session, Method::GET, "user", &[], None)
            .await
            .unwrap_err();
        assert!(error.is_authorization());
        token_mock.assert_async().await;
        assert!(session.tokens("gitlab").is_none());
    }

    #[tokio::test]
    async fn a_401_without_a_refresh_token_is_a_plain_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/user")
            .with_status(401)
            .with_body(r#"{"message": "401 Unauthorized"}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "stale", None);

        let error = gateway
            .execute(&session, Method::GET, "user", &[], None)
            .await
            .unwrap_err();
        match error {
            ApiError::Api { status, .. } => assert_eq!(status, 401),
            other => panic!("expected a plain api error, got {other}"),
        }
        // No refresh token means no logout side effect either
        assert!(session.tokens("gitlab").is_some());
    }

    #[tokio::test]
    async fn other_failures_carry_status_and_body_verbatim() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v4/projects")
            .with_status(422)
            .with_body(r#"{"message": "name already taken"}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in_session(&registry, "tok-1", None);

        let error = gateway
            .execute(
                &session,
                Method::POST,
                "projects",
                &[],
                Some(&serde_json::json!({"name": "site"})),
            )
            .await
            .unwrap_err();
        match error {
            ApiError::Api { status, body } => {
                assert_eq!(status, 422);
                assert!(body.contains("name already taken"));
            }
            other => panic!("expected a plain api error, got {other}"),
        }
    }
}
