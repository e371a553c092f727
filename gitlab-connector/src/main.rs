use std::sync::Arc;

use anyhow::{Context, Result};
use gitlab_connector::api::{create_router, ApiState};
use gitlab_connector::{load_config, ConnectorConfig, GitlabConnector};
use sitegit::SessionRegistry;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gitlab_connector=info".into()),
        )
        .init();

    info!("GitLab connector starting...");

    // Configuration: optional TOML file, then environment overrides.
    // Secrets belong in the environment, not in a committed config file.
    let config_path = std::env::var("GITLAB_CONNECTOR_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1));

    let mut config = match &config_path {
        Some(path) => load_config(path)?,
        None => ConnectorConfig::default(),
    };

    if let Ok(client_id) = std::env::var("GITLAB_CLIENT_ID") {
        config.gitlab.client_id = client_id;
    }
    if let Ok(client_secret) = std::env::var("GITLAB_CLIENT_SECRET") {
        config.gitlab.client_secret = client_secret;
    }
    if let Ok(domain) = std::env::var("GITLAB_DOMAIN") {
        config.gitlab.domain = domain;
    }
    if let Ok(redirect_uri) = std::env::var("GITLAB_REDIRECT_URI") {
        config.gitlab.redirect_uri = redirect_uri;
    }
    if let Ok(port) = std::env::var("GITLAB_CONNECTOR_PORT") {
        config.server.port = port
            .parse()
            .context("GITLAB_CONNECTOR_PORT must be a valid port number")?;
    }

    if config.gitlab.client_id.is_empty() {
        warn!("no OAuth client id configured, logins will fail (set GITLAB_CLIENT_ID)");
    }

    info!(
        domain = %config.gitlab.domain,
        pages_domain = %config.gitlab.pages_domain,
        branch = %config.repository.branch,
        config_file = config_path.as_deref().unwrap_or("<defaults>"),
        "Configuration loaded"
    );

    // Assemble the connector and its HTTP API
    let config = Arc::new(config);
    let api_state = ApiState {
        connector: Arc::new(GitlabConnector::new(Arc::clone(&config))),
        sessions: Arc::new(SessionRegistry::new()),
    };
    let router = create_router(api_state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding connector API to {bind_addr}"))?;
    info!(addr = %bind_addr, "Connector API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Connector API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("GitLab connector stopped");

    Ok(())
}
