//! GitLab-backed website storage: one repository per website.
//!
//! Saving splits the document, diffs the pieces against the repository
//! tree by blob digest, and commits only what changed. Deleting a page
//! never relies on "remove unlisted": the explicit difference between the
//! old and new manifest's page references decides what goes, so files the
//! connector does not own are left alone.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use sitegit::document::{codec, FileContent, WebsiteDocument, ASSETS_FOLDER, MANIFEST_FILE};
use sitegit::{AssetFile, JobBoard, Session, StorageConnector, WebsiteId, WebsiteMeta};
use tracing::{debug, info, warn};

use crate::commit::{commit_batch, CommitAction};
use crate::config::ConnectorConfig;
use crate::diff::{diff, fetch_remote_tree, DeleteMode, FileOp, TargetFile};
use crate::gateway::{ApiError, Gateway};

/// GitLab implementation of the storage and hosting connector traits.
///
/// The login lifecycle lives in `oauth`, publication in `publish`; this
/// module owns the struct and the repository CRUD.
pub struct GitlabConnector {
    config: Arc<ConnectorConfig>,
    gateway: Gateway,
    jobs: JobBoard,
}

impl GitlabConnector {
    pub fn new(config: Arc<ConnectorConfig>) -> Self {
        let gateway = Gateway::new(Arc::clone(&config), "gitlab");
        Self {
            config,
            gateway,
            jobs: JobBoard::new(),
        }
    }

    pub(crate) fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub(crate) fn config_handle(&self) -> Arc<ConnectorConfig> {
        Arc::clone(&self.config)
    }

    pub(crate) fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub(crate) fn jobs(&self) -> &JobBoard {
        &self.jobs
    }

    pub(crate) fn file_endpoint(id: &WebsiteId, path: &str) -> String {
        format!(
            "projects/{}/repository/files/{}",
            id,
            urlencoding::encode(path)
        )
    }

    /// Raw content of one repository file on the configured branch.
    pub(crate) async fn read_raw_file(
        &self,
        session: &Session,
        id: &WebsiteId,
        path: &str,
    ) -> Result<String, ApiError> {
        self.gateway
            .execute_text(
                session,
                Method::GET,
                &format!("{}/raw", Self::file_endpoint(id, path)),
                &[("ref", self.config.repository.branch.clone())],
            )
            .await
    }

    async fn load_page_file(
        &self,
        session: &Session,
        id: &WebsiteId,
        path: String,
    ) -> Result<String> {
        self.read_raw_file(session, id, &path)
            .await
            .with_context(|| format!("loading page file {path}"))
    }

    /// Project metadata, used for publish URLs and listings.
    pub(crate) async fn fetch_project(
        &self,
        session: &Session,
        id: &WebsiteId,
    ) -> Result<GitlabProject> {
        let value = self
            .gateway
            .execute(
                session,
                Method::GET,
                &format!("projects/{id}"),
                &[],
                None,
            )
            .await
            .with_context(|| format!("fetching project {id}"))?;
        serde_json::from_value(value).context("parsing the project payload")
    }
}

/// Project payload subset of the provider API.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GitlabProject {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub path_with_namespace: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl From<GitlabProject> for WebsiteMeta {
    fn from(project: GitlabProject) -> Self {
        WebsiteMeta {
            id: WebsiteId::new(project.id.to_string()),
            name: project.name,
            created_at: project.created_at,
            updated_at: project.last_activity_at,
        }
    }
}

#[async_trait]
impl StorageConnector for GitlabConnector {
    async fn create_website(&self, session: &Session, name: &str) -> Result<WebsiteMeta> {
        let body = json!({
            "name": name,
            "visibility": "public",
            "initialize_with_readme": false,
        });
        let value = self
            .gateway
            .execute(session, Method::POST, "projects", &[], Some(&body))
            .await
            .context("creating the website repository")?;
        let project: GitlabProject =
            serde_json::from_value(value).context("parsing the created project")?;
        let meta: WebsiteMeta = project.into();

        // Seed an empty manifest so the website reads back before its
        // first save. An empty page list is legal at creation time.
        let seed = codec::split(&WebsiteDocument::default())?;
        let actions = vec![CommitAction::from(FileOp::Create {
            path: MANIFEST_FILE.to_string(),
            content: FileContent::Text(seed.manifest),
        })];
        commit_batch(
            &self.gateway,
            session,
            meta.id.as_str(),
            &self.config.repository.branch,
            "Initialize website",
            actions,
            self.config.repository.max_actions_per_commit,
        )
        .await
        .context("seeding the website manifest")?;

        info!(website = %meta.id, name = %meta.name, "website created");
        Ok(meta)
    }

    async fn list_websites(&self, session: &Session) -> Result<Vec<WebsiteMeta>> {
        // Membership listings paginate like tree listings: walk the pages
        // until `x-total-pages` says there are no more.
        let mut websites = Vec::new();
        let mut page = 1u32;
        loop {
            let (value, headers) = self
                .gateway
                .execute_with_headers(
                    session,
                    Method::GET,
                    "projects",
                    &[
                        ("membership", "true".to_string()),
                        ("order_by", "last_activity_at".to_string()),
                        ("per_page", "100".to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await
                .context("listing websites")?;
            let projects: Vec<GitlabProject> =
                serde_json::from_value(value).context("parsing the project listing")?;
            websites.extend(projects.into_iter().map(Into::into));

            let total_pages = headers
                .get("x-total-pages")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(1);
            if page >= total_pages {
                return Ok(websites);
            }
            page += 1;
        }
    }

    async fn read_website(&self, session: &Session, id: &WebsiteId) -> Result<WebsiteDocument> {
        // The not-found variant stays in the chain so the HTTP layer can
        // classify it.
        let manifest = self
            .read_raw_file(session, id, MANIFEST_FILE)
            .await
            .with_context(|| format!("website {id} has no manifest, or was never saved"))?;

        codec::merge(&manifest, |path| self.load_page_file(session, id, path))
            .await
            .with_context(|| format!("merging website {id}"))
    }

    async fn save_website(
        &self,
        session: &Session,
        id: &WebsiteId,
        document: &WebsiteDocument,
    ) -> Result<()> {
        let split = codec::split(document)?;

        // The previous manifest's references decide which page files are
        // stale now. A missing manifest just means a first save.
        let old_paths: HashSet<String> = match self.read_raw_file(session, id, MANIFEST_FILE).await
        {
            Ok(manifest) => match serde_json::from_str::<WebsiteDocument>(&manifest) {
                Ok(previous) => previous.page_file_paths().into_iter().collect(),
                Err(error) => {
                    warn!(
                        website = %id,
                        error = %error,
                        "stored manifest does not parse, skipping stale page cleanup"
                    );
                    HashSet::new()
                }
            },
            Err(error) if error.is_not_found() => HashSet::new(),
            Err(error) => return Err(error).context("reading the previous manifest"),
        };

        let remote = fetch_remote_tree(&self.gateway, session, id.as_str(), None)
            .await
            .context("listing the repository tree")?;

        let mut targets: Vec<TargetFile> = split
            .pages
            .iter()
            .map(|page| TargetFile::text(page.path.clone(), page.content.clone()))
            .collect();
        targets.push(TargetFile::text(MANIFEST_FILE, split.manifest));

        let mut ops = diff(&targets, &remote, &DeleteMode::KeepUnlisted);

        let new_paths: HashSet<&str> = split.pages.iter().map(|page| page.path.as_str()).collect();
        let remote_paths: HashSet<&str> = remote
            .iter()
            .filter(|entry| entry.is_blob())
            .map(|entry| entry.path.as_str())
            .collect();
        let mut stale: Vec<&String> = old_paths
            .iter()
            .filter(|path| {
                !new_paths.contains(path.as_str()) && remote_paths.contains(path.as_str())
            })
            .collect();
        stale.sort_unstable();
        ops.extend(stale.into_iter().map(|path| FileOp::Delete {
            path: path.clone(),
        }));

        if ops.is_empty() {
            debug!(website = %id, "nothing changed, no commit issued");
            return Ok(());
        }

        let count = ops.len();
        let actions: Vec<CommitAction> = ops.into_iter().map(Into::into).collect();
        let commits = commit_batch(
            &self.gateway,
            session,
            id.as_str(),
            &self.config.repository.branch,
            "Update website",
            actions,
            self.config.repository.max_actions_per_commit,
        )
        .await?;

        info!(website = %id, operations = count, commits = commits, "website saved");
        Ok(())
    }

    async fn rename_website(&self, session: &Session, id: &WebsiteId, name: &str) -> Result<()> {
        self.gateway
            .execute(
                session,
                Method::PUT,
                &format!("projects/{id}"),
                &[],
                Some(&json!({ "name": name })),
            )
            .await
            .with_context(|| format!("renaming website {id}"))?;
        info!(website = %id, name = %name, "website renamed");
        Ok(())
    }

    async fn delete_website(&self, session: &Session, id: &WebsiteId) -> Result<()> {
        self.gateway
            .execute(
                session,
                Method::DELETE,
                &format!("projects/{id}"),
                &[],
                None,
            )
            .await
            .with_context(|| format!("deleting website {id}"))?;
        info!(website = %id, "website deleted");
        Ok(())
    }

    async fn upload_assets(
        &self,
        session: &Session,
        id: &WebsiteId,
        assets: Vec<AssetFile>,
    ) -> Result<()> {
        if assets.is_empty() {
            return Ok(());
        }

        let targets: Vec<TargetFile> = assets
            .into_iter()
            .map(|asset| TargetFile::new(asset.repo_path(), asset.content))
            .collect();
        let remote = fetch_remote_tree(&self.gateway, session, id.as_str(), Some(ASSETS_FOLDER))
            .await
            .context("listing the assets folder")?;

        // Uploads add and refresh; pruning is the publish flow's call.
        let ops = diff(&targets, &remote, &DeleteMode::KeepUnlisted);
        if ops.is_empty() {
            debug!(website = %id, "assets already up to date");
            return Ok(());
        }

        let count = ops.len();
        let actions: Vec<CommitAction> = ops.into_iter().map(Into::into).collect();
        commit_batch(
            &self.gateway,
            session,
            id.as_str(),
            &self.config.repository.branch,
            "Upload assets",
            actions,
            self.config.repository.max_actions_per_commit,
        )
        .await?;

        info!(website = %id, files = count, "assets uploaded");
        Ok(())
    }

    async fn read_asset(
        &self,
        session: &Session,
        id: &WebsiteId,
        path: &str,
    ) -> Result<FileContent> {
        let repo_path = if path.starts_with(&format!("{ASSETS_FOLDER}/")) {
            path.to_string()
        } else {
            format!("{ASSETS_FOLDER}/{}", path.trim_start_matches('/'))
        };

        // The file endpoint ships content base64-encoded, which keeps
        // binary assets intact (the raw endpoint would re-decode text).
        let value = self
            .gateway
            .execute(
                session,
                Method::GET,
                &Self::file_endpoint(id, &repo_path),
                &[("ref", self.config.repository.branch.clone())],
                None,
            )
            .await
            .with_context(|| format!("reading asset {repo_path}"))?;

        let encoded = value
            .get("content")
            .and_then(|content| content.as_str())
            .context("asset payload carries no content")?;
        let bytes = BASE64
            .decode(encoded.replace('\n', ""))
            .context("decoding the asset content")?;
        Ok(FileContent::Binary(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_endpoints_encode_nested_paths() {
        let id = WebsiteId::new("42");
        assert_eq!(
            GitlabConnector::file_endpoint(&id, "src/home-p1.json"),
            "projects/42/repository/files/src%2Fhome-p1.json"
        );
        assert_eq!(
            GitlabConnector::file_endpoint(&id, "website.json"),
            "projects/42/repository/files/website.json"
        );
    }

    #[test]
    fn project_payloads_map_to_website_meta() {
        let project: GitlabProject = serde_json::from_value(json!({
            "id": 1042,
            "name": "my-site",
            "path_with_namespace": "alice/my-site",
            "web_url": "https://gitlab.com/alice/my-site",
            "created_at": "2024-03-01T10:00:00Z",
            "last_activity_at": "2024-06-01T12:30:00Z"
        }))
        .unwrap();

        let meta: WebsiteMeta = project.into();
        assert_eq!(meta.id.as_str(), "1042");
        assert_eq!(meta.name, "my-site");
        assert!(meta.created_at.is_some());
        assert!(meta.updated_at.is_some());
    }
}
