//! Connector HTTP API, the surface the visual editor talks to.
//!
//! Routes:
//! - `GET  /api/connector/login` — start a login, returns the authorize URL
//! - `GET  /api/connector/callback` — OAuth redirect target
//! - `GET  /api/connector/user` — identity of the logged-in account
//! - `POST /api/connector/logout` — drop this connector's tokens
//! - `GET|POST /api/website` — list / create websites
//! - `GET|PUT|DELETE /api/website/:id` — read / save / delete one website
//! - `PUT  /api/website/:id/name` — rename
//! - `POST /api/website/:id/assets` — upload asset files
//! - `GET  /api/website/:id/assets/*path` — read one asset back
//! - `POST /api/publication/:id` — start publishing, returns the job
//! - `GET  /api/publication/:id/url` — public URL of the site
//! - `GET  /api/publication/status?job=` — job snapshot
//! - `POST /api/publication/cancel?job=` — request cancellation
//!
//! The caller identifies its session with `Authorization: Bearer <id>`;
//! `login` mints one when none is presented. The callback has no bearer
//! (the browser lands there straight from the provider), so it finds the
//! session by the echoed state nonce.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sitegit::{
    AssetFile, Connector, FileContent, HostingConnector, PublishJob, RemoteUser, Session,
    SessionRegistry, StorageConnector, WebsiteDocument, WebsiteId, WebsiteMeta,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::gateway::ApiError;
use crate::website::GitlabConnector;

/// Shared state for the connector API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub connector: Arc<GitlabConnector>,
    pub sessions: Arc<SessionRegistry>,
}

/// Response for `GET /api/connector/login`.
#[derive(Serialize)]
pub struct LoginResponse {
    /// Provider authorize URL to open in the browser.
    pub url: String,
    /// Session id to present as the bearer token from now on.
    pub session: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

/// Request body for create and rename.
#[derive(Deserialize)]
pub struct NameRequest {
    pub name: String,
}

/// One asset file as the editor uploads it. Binary payloads arrive
/// base64-encoded with `"encoding": "base64"`.
#[derive(Deserialize)]
pub struct AssetUpload {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub uploaded: usize,
}

#[derive(Serialize)]
pub struct UrlResponse {
    pub url: String,
}

#[derive(Deserialize)]
pub struct JobQuery {
    pub job: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ---------------------------------------------------------------------------
// Business logic (called from HTTP handlers and unit tests)
// ---------------------------------------------------------------------------

/// Start a login. Reuses the caller's session when the bearer resolves,
/// mints a fresh one otherwise, and returns the authorize URL plus the
/// session id to present from now on.
pub async fn handle_login(state: &ApiState, session_id: Option<String>) -> Result<LoginResponse> {
    let session = match session_id.and_then(|id| state.sessions.get(&id)) {
        Some(session) => session,
        None => state.sessions.create(),
    };
    let url = state.connector.begin_login(&session).await?;
    Ok(LoginResponse {
        url,
        session: session.id().to_string(),
    })
}

/// Finish a login from the provider redirect. The session is the one
/// whose slot holds the echoed state nonce.
pub async fn handle_callback(
    state: &ApiState,
    code: &str,
    login_state: &str,
) -> Result<RemoteUser> {
    let connector_id = state.connector.id().to_string();
    let session = state
        .sessions
        .find(|session| {
            session
                .tokens(&connector_id)
                .and_then(|slot| slot.state_nonce)
                .as_deref()
                == Some(login_state)
        })
        .context("no login in progress matches this state")?;

    state
        .connector
        .complete_login(&session, code, login_state)
        .await
}

/// Decode uploaded payloads into asset files.
pub fn uploads_to_assets(uploads: Vec<AssetUpload>) -> Result<Vec<AssetFile>> {
    uploads
        .into_iter()
        .map(|upload| {
            let content = match upload.encoding.as_deref() {
                Some("base64") => FileContent::Binary(
                    BASE64
                        .decode(upload.content.trim())
                        .with_context(|| format!("invalid base64 content for {}", upload.path))?,
                ),
                _ => FileContent::Text(upload.content),
            };
            Ok(AssetFile {
                path: upload.path,
                content,
                mime: upload.mime,
            })
        })
        .collect()
}

/// Content type served for an asset path, by extension.
fn content_type_for(path: &str) -> &'static str {
    let extension = path.rsplit('.').next().unwrap_or_default();
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn bearer_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn require_session(state: &ApiState, headers: &HeaderMap) -> Result<Arc<Session>, AppError> {
    bearer_session_id(headers)
        .and_then(|id| state.sessions.get(&id))
        .ok_or_else(|| {
            AppError::Unauthorized(
                "missing or unknown session, start with /api/connector/login".to_string(),
            )
        })
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn get_login(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<LoginResponse>, AppError> {
    let response = handle_login(&state, bearer_session_id(&headers)).await?;
    Ok(Json(response))
}

async fn get_callback(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    match handle_callback(&state, &query.code, &query.state).await {
        Ok(user) => {
            info!(username = %user.username, "login callback completed");
            Html(
                "<!doctype html><html><body>\
                 <p>Login successful. You can close this window.</p>\
                 </body></html>"
                    .to_string(),
            )
            .into_response()
        }
        Err(error) => {
            warn!("login callback failed: {error:#}");
            (
                StatusCode::UNAUTHORIZED,
                Html(
                    "<!doctype html><html><body>\
                     <p>Login failed. Close this window and try again.</p>\
                     </body></html>"
                        .to_string(),
                ),
            )
                .into_response()
        }
    }
}

async fn get_user(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<RemoteUser>, AppError> {
    let session = require_session(&state, &headers)?;
    let user = state.connector.current_user(&session).await?;
    Ok(Json(user))
}

async fn post_logout(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> StatusCode {
    if let Some(session) = bearer_session_id(&headers).and_then(|id| state.sessions.get(&id)) {
        state.connector.logout(&session);
    }
    StatusCode::NO_CONTENT
}

async fn get_websites(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<WebsiteMeta>>, AppError> {
    let session = require_session(&state, &headers)?;
    let websites = state.connector.list_websites(&session).await?;
    Ok(Json(websites))
}

async fn post_website(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<NameRequest>,
) -> Result<(StatusCode, Json<WebsiteMeta>), AppError> {
    let session = require_session(&state, &headers)?;
    let meta = state.connector.create_website(&session, &request.name).await?;
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn get_website(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<WebsiteDocument>, AppError> {
    let session = require_session(&state, &headers)?;
    let document = state
        .connector
        .read_website(&session, &WebsiteId::new(id))
        .await?;
    Ok(Json(document))
}

async fn put_website(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(document): Json<WebsiteDocument>,
) -> Result<StatusCode, AppError> {
    let session = require_session(&state, &headers)?;
    state
        .connector
        .save_website(&session, &WebsiteId::new(id), &document)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_website_name(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<NameRequest>,
) -> Result<StatusCode, AppError> {
    let session = require_session(&state, &headers)?;
    state
        .connector
        .rename_website(&session, &WebsiteId::new(id), &request.name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_website(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let session = require_session(&state, &headers)?;
    state
        .connector
        .delete_website(&session, &WebsiteId::new(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_assets(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(uploads): Json<Vec<AssetUpload>>,
) -> Result<Json<UploadResponse>, AppError> {
    let session = require_session(&state, &headers)?;
    let assets = uploads_to_assets(uploads).map_err(|error| AppError::BadRequest(error.to_string()))?;
    let uploaded = assets.len();
    state
        .connector
        .upload_assets(&session, &WebsiteId::new(id), assets)
        .await?;
    Ok(Json(UploadResponse { uploaded }))
}

async fn get_asset(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let session = require_session(&state, &headers)?;
    let content = state
        .connector
        .read_asset(&session, &WebsiteId::new(id), &path)
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type_for(&path))],
        content.as_bytes().to_vec(),
    )
        .into_response())
}

async fn post_publication(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(uploads): Json<Vec<AssetUpload>>,
) -> Result<(StatusCode, Json<PublishJob>), AppError> {
    let session = require_session(&state, &headers)?;
    let assets = uploads_to_assets(uploads).map_err(|error| AppError::BadRequest(error.to_string()))?;
    let job = state
        .connector
        .publish(session, &WebsiteId::new(id), assets)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn get_publication_url(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<UrlResponse>, AppError> {
    let session = require_session(&state, &headers)?;
    let url = state
        .connector
        .site_url(&session, &WebsiteId::new(id))
        .await?;
    Ok(Json(UrlResponse { url }))
}

async fn get_publication_status(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> Result<Json<PublishJob>, AppError> {
    require_session(&state, &headers)?;
    match state.connector.job(&query.job) {
        Some(job) => Ok(Json(job)),
        None => Err(AppError::NotFound(format!("no publish job {}", query.job))),
    }
}

async fn post_publication_cancel(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> Result<StatusCode, AppError> {
    require_session(&state, &headers)?;
    if state.connector.cancel_job(&query.job) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("no publish job {}", query.job)))
    }
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

enum AppError {
    Unauthorized(String),
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        // Gateway failures keep their classification through the chain.
        for cause in error.chain() {
            match cause.downcast_ref::<ApiError>() {
                Some(api) if api.is_authorization() => {
                    return AppError::Unauthorized(api.to_string())
                }
                Some(api) if api.is_not_found() => return AppError::NotFound(api.to_string()),
                // A provider 401 with no refresh to fall back on means the
                // session was never logged in, or access was revoked.
                Some(ApiError::Api { status: 401, .. }) => {
                    return AppError::Unauthorized(
                        "not logged in to the provider, or access was revoked".to_string(),
                    )
                }
                _ => {}
            }
        }
        AppError::Internal(format!("{error:#}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/connector/login", get(get_login))
        .route("/api/connector/callback", get(get_callback))
        .route("/api/connector/user", get(get_user))
        .route("/api/connector/logout", post(post_logout))
        .route("/api/website", get(get_websites).post(post_website))
        .route(
            "/api/website/:id",
            get(get_website).put(put_website).delete(delete_website),
        )
        .route("/api/website/:id/name", put(put_website_name))
        .route("/api/website/:id/assets", post(post_assets))
        .route("/api/website/:id/assets/*path", get(get_asset))
        .route("/api/publication/:id", post(post_publication))
        .route("/api/publication/:id/url", get(get_publication_url))
        .route("/api/publication/status", get(get_publication_status))
        .route("/api/publication/cancel", post(post_publication_cancel))
        // The editor is a browser app served from another origin
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
