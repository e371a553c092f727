//! GitLab storage and hosting connector.
//!
//! Implements the `sitegit` connector traits against the GitLab REST API:
//! one repository per website, OAuth2/PKCE login, content-addressed saves
//! through batch commits, and tag-triggered GitLab Pages publication
//! tracked by polling CI jobs. The `api` module exposes the whole thing to
//! the editor over HTTP.

pub mod api;
pub mod commit;
pub mod config;
pub mod diff;
pub mod gateway;
pub mod oauth;
pub mod publish;
pub mod trace;
pub mod website;

pub use config::{load_config, ConnectorConfig};
pub use gateway::{ApiError, Gateway};
pub use website::GitlabConnector;
