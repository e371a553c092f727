use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Complete connector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub gitlab: GitlabConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub publication: PublicationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// GitLab instance and OAuth application settings
#[derive(Debug, Clone, Deserialize)]
pub struct GitlabConfig {
    /// Base URL of the GitLab instance
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Domain GitLab Pages sites are served from
    #[serde(default = "default_pages_domain")]
    pub pages_domain: String,
    /// OAuth application id
    #[serde(default)]
    pub client_id: String,
    /// OAuth application secret; empty for public (PKCE-only) applications
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_domain() -> String {
    "https://gitlab.com".to_string()
}

fn default_pages_domain() -> String {
    "gitlab.io".to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:6805/api/connector/callback".to_string()
}

fn default_scope() -> String {
    "api email profile".to_string()
}

impl Default for GitlabConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            pages_domain: default_pages_domain(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: default_redirect_uri(),
            scope: default_scope(),
        }
    }
}

impl GitlabConfig {
    /// REST API root, e.g. `https://gitlab.com/api/v4`.
    pub fn api_root(&self) -> String {
        format!("{}/api/v4", self.domain.trim_end_matches('/'))
    }

    /// OAuth token endpoint.
    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.domain.trim_end_matches('/'))
    }

    /// OAuth authorize endpoint.
    pub fn authorize_url(&self) -> String {
        format!("{}/oauth/authorize", self.domain.trim_end_matches('/'))
    }
}

/// Repository write settings
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Branch commits and tags are created on
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Maximum file actions per commit; longer change sets are chunked
    #[serde(default = "default_max_actions_per_commit")]
    pub max_actions_per_commit: usize,
    /// Outgoing body size that triggers a warning (provider may reject it)
    #[serde(default = "default_body_warn_bytes")]
    pub body_warn_bytes: usize,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_max_actions_per_commit() -> usize {
    100
}

fn default_body_warn_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            branch: default_branch(),
            max_actions_per_commit: default_max_actions_per_commit(),
            body_warn_bytes: default_body_warn_bytes(),
        }
    }
}

/// Publication poll loop settings
#[derive(Debug, Clone, Deserialize)]
pub struct PublicationConfig {
    /// Seconds between job-list polls while waiting for the build to appear
    #[serde(default = "default_wait_interval_secs")]
    pub wait_interval_secs: u64,
    /// Give up waiting for the build to appear after this many seconds
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Seconds between status/trace polls of a running build
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Stop following a running build after this many seconds (soft stop)
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_wait_interval_secs() -> u64 {
    5
}

fn default_wait_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_timeout_secs() -> u64 {
    600
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            wait_interval_secs: default_wait_interval_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl PublicationConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6805
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            gitlab: GitlabConfig::default(),
            repository: RepositoryConfig::default(),
            publication: PublicationConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<ConnectorConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {path}"))?;
    let config: ConnectorConfig =
        toml::from_str(&contents).with_context(|| format!("parsing config file {path}"))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectorConfig::default();
        assert_eq!(config.gitlab.domain, "https://gitlab.com");
        assert_eq!(config.gitlab.api_root(), "https://gitlab.com/api/v4");
        assert_eq!(config.gitlab.token_url(), "https://gitlab.com/oauth/token");
        assert_eq!(config.repository.branch, "main");
        assert_eq!(config.repository.max_actions_per_commit, 100);
        assert_eq!(config.publication.wait_timeout_secs, 120);
        assert_eq!(config.publication.poll_timeout_secs, 600);
        assert_eq!(config.server.port, 6805);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [gitlab]
            domain = "https://gitlab.example.com"
            pages_domain = "pages.example.com"
            client_id = "abc123"
            client_secret = "s3cret"
            redirect_uri = "https://editor.example.com/api/connector/callback"

            [repository]
            branch = "master"
            max_actions_per_commit = 50
            body_warn_bytes = 1048576

            [publication]
            wait_interval_secs = 2
            wait_timeout_secs = 30
            poll_interval_secs = 3
            poll_timeout_secs = 90

            [server]
            host = "127.0.0.1"
            port = 8080
        "#;

        let config: ConnectorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.gitlab.domain, "https://gitlab.example.com");
        assert_eq!(config.gitlab.api_root(), "https://gitlab.example.com/api/v4");
        assert_eq!(config.gitlab.client_id, "abc123");
        assert_eq!(config.repository.branch, "master");
        assert_eq!(config.repository.max_actions_per_commit, 50);
        assert_eq!(config.publication.wait_timeout_secs, 30);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections fall back to defaults
        let toml = r#"
            [gitlab]
            client_id = "abc123"
        "#;

        let config: ConnectorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.gitlab.client_id, "abc123");
        assert_eq!(config.gitlab.domain, "https://gitlab.com"); // Default
        assert_eq!(config.repository.max_actions_per_commit, 100); // Default
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[gitlab]\nclient_id = \"from-file\"\n\n[server]\nport = 7000"
        )
        .unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.gitlab.client_id, "from-file");
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn test_trailing_slash_domains_normalize() {
        let toml = r#"
            [gitlab]
            domain = "https://gitlab.example.com/"
        "#;
        let config: ConnectorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.gitlab.api_root(), "https://gitlab.example.com/api/v4");
        assert_eq!(
            config.gitlab.authorize_url(),
            "https://gitlab.example.com/oauth/authorize"
        );
    }
}
