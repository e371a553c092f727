//! Connector interfaces the editor server programs against.
//!
//! A connector wraps one git-hosting provider. [`Connector`] covers the
//! login lifecycle, [`StorageConnector`] adds website CRUD on top of it,
//! and [`HostingConnector`] adds publication. One implementation may play
//! both roles; sessions keep the roles apart by connector id.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{AssetFile, FileContent, WebsiteDocument};
use crate::job::PublishJob;
use crate::session::Session;

/// Login lifecycle of one provider connector.
///
/// Connectors are stateless between calls - tokens and login state live in
/// the caller's [`Session`], keyed by `id()`, so several connectors can
/// serve the same session without collision.
///
/// # Lifecycle
/// 1. `begin_login` stores the PKCE/nonce material in the session and
///    returns the provider authorize URL
/// 2. The browser returns with `code` + `state`; `complete_login` validates
///    the nonce, exchanges the code and stores the token
/// 3. `is_authenticated` / `current_user` serve the editor UI
/// 4. `logout` clears this connector's slot only
///
/// # Example
/// ```no_run
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use sitegit::{Connector, RemoteUser, Session};
///
/// struct DemoConnector;
///
/// #[async_trait]
/// impl Connector for DemoConnector {
///     fn id(&self) -> &str {
///         "demo"
///     }
///
///     fn display_name(&self) -> &str {
///         "Demo provider"
///     }
///
///     async fn begin_login(&self, session: &Session) -> Result<String> {
///         session.update_tokens(self.id(), |slot| {
///             slot.state_nonce = Some("nonce".to_string());
///         });
///         Ok("https://git.example.com/oauth/authorize?...".to_string())
///     }
///
///     async fn complete_login(
///         &self,
///         _session: &Session,
///         _code: &str,
///         _state: &str,
///     ) -> Result<RemoteUser> {
///         Ok(RemoteUser {
///             id: 1,
///             username: "demo".to_string(),
///             name: None,
///             email: None,
///             avatar_url: None,
///             profile_url: None,
///         })
///     }
///
///     fn is_authenticated(&self, session: &Session) -> bool {
///         session.is_authenticated(self.id())
///     }
///
///     async fn current_user(&self, session: &Session) -> Result<RemoteUser> {
///         self.complete_login(session, "", "").await
///     }
///
///     fn logout(&self, session: &Session) {
///         session.clear_tokens(self.id());
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Unique identifier, used as the session slot key and in API routes.
    ///
    /// Must be lowercase alphanumeric (e.g., "gitlab").
    fn id(&self) -> &str;

    /// Human-readable provider name for the editor UI.
    fn display_name(&self) -> &str;

    /// Start the login flow: store the PKCE verifier/challenge and CSRF
    /// nonce in the session, return the authorize URL to redirect to.
    async fn begin_login(&self, session: &Session) -> Result<String>;

    /// Finish the login flow with the code and state the provider sent
    /// back. Validates the nonce against the stored one, exchanges the
    /// code for a token, fetches and stores the remote identity.
    ///
    /// Any validation failure logs the session out of this connector
    /// before surfacing, so the next attempt starts clean.
    async fn complete_login(
        &self,
        session: &Session,
        code: &str,
        state: &str,
    ) -> Result<RemoteUser>;

    /// Whether the session holds an access token. No remote validation.
    fn is_authenticated(&self, session: &Session) -> bool;

    /// Identity of the logged-in account, fetched from the provider.
    async fn current_user(&self, session: &Session) -> Result<RemoteUser>;

    /// Drop this connector's token slot from the session.
    fn logout(&self, session: &Session);
}

/// Website storage on top of a provider: one repository per website.
#[async_trait]
pub trait StorageConnector: Connector {
    /// Create the repository for a new website. The returned id is the
    /// handle every other call takes.
    async fn create_website(&self, session: &Session, name: &str) -> Result<WebsiteMeta>;

    /// Websites this account can open.
    async fn list_websites(&self, session: &Session) -> Result<Vec<WebsiteMeta>>;

    /// Load a website: manifest plus page files, merged back into one
    /// document.
    async fn read_website(&self, session: &Session, id: &WebsiteId) -> Result<WebsiteDocument>;

    /// Store a website: split into manifest plus page files, diff against
    /// the repository, commit what changed.
    async fn save_website(
        &self,
        session: &Session,
        id: &WebsiteId,
        document: &WebsiteDocument,
    ) -> Result<()>;

    async fn rename_website(&self, session: &Session, id: &WebsiteId, name: &str) -> Result<()>;

    /// Delete the repository. Irreversible.
    async fn delete_website(&self, session: &Session, id: &WebsiteId) -> Result<()>;

    /// Upload asset files under the assets folder, skipping unchanged ones.
    async fn upload_assets(
        &self,
        session: &Session,
        id: &WebsiteId,
        assets: Vec<AssetFile>,
    ) -> Result<()>;

    /// Read one asset back.
    async fn read_asset(
        &self,
        session: &Session,
        id: &WebsiteId,
        path: &str,
    ) -> Result<FileContent>;
}

/// Publication on top of a provider's CI.
#[async_trait]
pub trait HostingConnector: Connector {
    /// Start publishing a website: refresh the CI setup, sync `assets`
    /// as the full published asset tree (stale files pruned), trigger a
    /// build and track it. Returns a snapshot of the tracking job; the
    /// build runs in the background and the job is polled by id.
    ///
    /// Takes owned handles because the work outlives the HTTP request that
    /// started it.
    async fn publish(
        &self,
        session: Arc<Session>,
        id: &WebsiteId,
        assets: Vec<AssetFile>,
    ) -> Result<PublishJob>;

    /// Snapshot of a tracking job, if it exists.
    fn job(&self, job_id: &str) -> Option<PublishJob>;

    /// Ask a running job to stop at its next wait boundary. Returns
    /// whether the job existed.
    fn cancel_job(&self, job_id: &str) -> bool;

    /// Public URL the website is (or will be) served from.
    async fn site_url(&self, session: &Session, id: &WebsiteId) -> Result<String>;
}

/// Opaque handle to one remote repository. One repository is one website.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebsiteId(String);

impl WebsiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WebsiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WebsiteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WebsiteId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Listing entry for one website.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebsiteMeta {
    pub id: WebsiteId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Identity of the account behind a token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: u64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
}
