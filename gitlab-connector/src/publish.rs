//! Publication through GitLab CI and Pages.
//!
//! A publish is a background run: make sure the pipeline file is in
//! place, sync the published asset tree (stale files pruned), tag the
//! branch to trigger the Pages build, then follow the remote job and
//! stream its trace into the tracking job. The caller gets a job id back
//! immediately and polls snapshots off the board.
//!
//! Every wait boundary checks the job's cancel flag, so navigating away
//! in the editor stops the run at the next sleep instead of riding out
//! the timeouts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use sitegit::document::{FileContent, ASSETS_FOLDER};
use sitegit::{
    AssetFile, Connector, HostingConnector, JobHandle, JobStatus, PublishJob, PublishResult,
    Session, WebsiteId,
};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::commit::commit_batch;
use crate::config::ConnectorConfig;
use crate::diff::{blob_digest, diff, fetch_remote_tree, DeleteMode, FileOp, TargetFile};
use crate::gateway::Gateway;
use crate::trace::{clean_lines, map_job_status, milestone_for, RemoteJobStatus, TraceCursor};
use crate::website::GitlabConnector;

const CI_FILE: &str = ".gitlab-ci.yml";

/// First line of the managed pipeline file. Only a file carrying this
/// marker is ever overwritten; a hand-written pipeline stays untouched.
const MANAGED_MARKER: &str = "# Managed by the sitegit connector";

/// Tag prefix that triggers the Pages deployment. The job watcher also
/// uses it to find the build a publish started.
pub(crate) const TAG_PREFIX: &str = "_silex_";

const CI_TEMPLATE: &str = r#"# Managed by the sitegit connector. Publishing overwrites this file.
image: node:20

pages:
  stage: deploy
  environment: production
  script:
    - npm install @11ty/eleventy@2
    - npx @11ty/eleventy --input=. --output=public
  artifacts:
    paths:
      - public
  rules:
    - if: '$CI_COMMIT_TAG =~ /^_silex_/'
"#;

/// Public Pages URL of a project, derived from its namespace path.
///
/// `alice/my-site` serves at `https://alice.<pages domain>/my-site`. A
/// repository named like the Pages host itself (`alice/alice.gitlab.io`)
/// is the account's root site and serves without a path suffix.
pub(crate) fn pages_url(pages_domain: &str, path_with_namespace: &str) -> Option<String> {
    let (owner, rest) = path_with_namespace.split_once('/')?;
    let host = format!("{owner}.{pages_domain}");
    if rest == host {
        Some(format!("https://{host}"))
    } else {
        Some(format!("https://{host}/{rest}"))
    }
}

/// Pipeline job as listed by the provider.
#[derive(Debug, Clone, Deserialize)]
struct RemoteJob {
    id: u64,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "ref")]
    git_ref: Option<String>,
    #[serde(default)]
    web_url: Option<String>,
}

/// How one publish run ended, aside from hard errors.
#[derive(Debug)]
enum Outcome {
    /// A terminal job state has been written (success, failure, or the
    /// soft stop after the poll deadline).
    Finished,
    /// The cancel flag was observed at a wait boundary.
    Cancelled,
}

/// One publish in flight. Owns everything it needs so it can outlive the
/// HTTP request that started it.
struct PublishRun {
    gateway: Gateway,
    config: Arc<ConnectorConfig>,
    session: Arc<Session>,
    website: WebsiteId,
    job: JobHandle,
    /// Digests of asset paths already handled in this run. Scoped to the
    /// run, so the next publish re-checks everything against the remote.
    uploaded: HashMap<String, String>,
    /// Asset tree to publish, taken by the run when it starts.
    pending_assets: Vec<AssetFile>,
}

impl PublishRun {
    async fn run(mut self) {
        self.job.set_status(JobStatus::InProgress);
        let assets = std::mem::take(&mut self.pending_assets);
        match self.execute(assets).await {
            Ok(Outcome::Finished) => {}
            Ok(Outcome::Cancelled) => {
                info!(website = %self.website, job = %self.job.id(), "publication cancelled");
                self.job.fail("Publication cancelled");
            }
            Err(error) => {
                error!(
                    website = %self.website,
                    job = %self.job.id(),
                    "publication failed: {error:#}"
                );
                self.job.fail(format!("Publication failed: {error:#}"));
            }
        }
    }

    async fn execute(&mut self, assets: Vec<AssetFile>) -> Result<Outcome> {
        self.job.set_message("Preparing the build pipeline");
        self.ensure_ci_config().await?;
        if self.cancelled() {
            return Ok(Outcome::Cancelled);
        }

        self.job.set_message("Uploading assets");
        self.sync_assets(assets).await?;
        if self.cancelled() {
            return Ok(Outcome::Cancelled);
        }

        self.job.set_message("Triggering the build");
        let tag = self.trigger_build().await?;

        self.job.set_message("Waiting for the build to start");
        let remote = match self.wait_for_build(&tag).await? {
            Some(remote) => remote,
            None => return Ok(Outcome::Cancelled),
        };

        self.job.set_message("Building");
        self.follow_build(remote).await
    }

    fn cancelled(&self) -> bool {
        self.job.is_cancelled()
    }

    async fn read_repo_file(&self, path: &str) -> Result<String, crate::gateway::ApiError> {
        self.gateway
            .execute_text(
                &self.session,
                Method::GET,
                &format!(
                    "{}/raw",
                    GitlabConnector::file_endpoint(&self.website, path)
                ),
                &[("ref", self.config.repository.branch.clone())],
            )
            .await
    }

    async fn ensure_ci_config(&self) -> Result<()> {
        match self.read_repo_file(CI_FILE).await {
            Ok(current) if current == CI_TEMPLATE => {
                debug!(website = %self.website, "build pipeline already up to date");
                Ok(())
            }
            Ok(current) if current.contains(MANAGED_MARKER) => {
                info!(website = %self.website, "refreshing the managed build pipeline");
                self.write_ci_config(true).await
            }
            Ok(_) => {
                info!(
                    website = %self.website,
                    "existing pipeline configuration is not ours, leaving it untouched"
                );
                self.job.log("Keeping the existing pipeline configuration");
                Ok(())
            }
            Err(error) if error.is_not_found() => {
                info!(website = %self.website, "creating the build pipeline");
                self.write_ci_config(false).await
            }
            Err(error) => Err(error).context("reading the pipeline configuration"),
        }
    }

    async fn write_ci_config(&self, exists: bool) -> Result<()> {
        let op = if exists {
            FileOp::Update {
                path: CI_FILE.to_string(),
                content: FileContent::Text(CI_TEMPLATE.to_string()),
            }
        } else {
            FileOp::Create {
                path: CI_FILE.to_string(),
                content: FileContent::Text(CI_TEMPLATE.to_string()),
            }
        };
        commit_batch(
            &self.gateway,
            &self.session,
            self.website.as_str(),
            &self.config.repository.branch,
            "Configure the build pipeline",
            vec![op.into()],
            self.config.repository.max_actions_per_commit,
        )
        .await
        .context("writing the pipeline configuration")?;
        self.job.log("Build pipeline configured");
        Ok(())
    }

    /// Sync the published asset tree: upsert what changed, prune what is
    /// no longer referenced. Duplicate paths in the input collapse to
    /// their first occurrence.
    async fn sync_assets(&mut self, assets: Vec<AssetFile>) -> Result<()> {
        let mut targets: Vec<TargetFile> = Vec::with_capacity(assets.len());
        for asset in assets {
            let path = asset.repo_path();
            let digest = blob_digest(asset.content.as_bytes());
            match self.uploaded.get(&path) {
                Some(previous) if *previous == digest => {
                    debug!(path = %path, "asset already handled in this publish run");
                }
                Some(_) => {
                    warn!(
                        path = %path,
                        "conflicting content for one path in a single publish run, keeping the first"
                    );
                }
                None => {
                    self.uploaded.insert(path.clone(), digest);
                    targets.push(TargetFile::new(path, asset.content));
                }
            }
        }

        let remote = fetch_remote_tree(
            &self.gateway,
            &self.session,
            self.website.as_str(),
            Some(ASSETS_FOLDER),
        )
        .await
        .context("listing the published assets")?;

        let ops = diff(
            &targets,
            &remote,
            &DeleteMode::RemoveUnlisted {
                prefix: format!("{ASSETS_FOLDER}/"),
            },
        );
        if ops.is_empty() {
            self.job.log("Assets already up to date");
            return Ok(());
        }

        let removed = ops
            .iter()
            .filter(|op| matches!(op, FileOp::Delete { .. }))
            .count();
        let changed = ops.len() - removed;
        commit_batch(
            &self.gateway,
            &self.session,
            self.website.as_str(),
            &self.config.repository.branch,
            "Publish assets",
            ops.into_iter().map(Into::into).collect(),
            self.config.repository.max_actions_per_commit,
        )
        .await
        .context("committing the published assets")?;
        self.job
            .log(format!("Assets synced: {changed} changed, {removed} removed"));
        Ok(())
    }

    /// Tag the branch to trigger the Pages pipeline. The timestamped tag
    /// doubles as the handle the job watcher looks for.
    async fn trigger_build(&self) -> Result<String> {
        let tag = format!("{TAG_PREFIX}{}", Utc::now().timestamp());
        self.gateway
            .execute(
                &self.session,
                Method::POST,
                &format!("projects/{}/repository/tags", self.website),
                &[
                    ("tag_name", tag.clone()),
                    ("ref", self.config.repository.branch.clone()),
                ],
                None,
            )
            .await
            .context("creating the build tag")?;
        self.job.log(format!("Tagged {tag} to trigger the build"));
        Ok(tag)
    }

    /// Wait for the pipeline job our tag spawned to show up in the job
    /// listing. `None` means the run was cancelled while waiting.
    async fn wait_for_build(&self, tag: &str) -> Result<Option<RemoteJob>> {
        let started = Instant::now();
        loop {
            if self.cancelled() {
                return Ok(None);
            }

            let value = self
                .gateway
                .execute(
                    &self.session,
                    Method::GET,
                    &format!("projects/{}/jobs", self.website),
                    &[("per_page", "50".to_string())],
                    None,
                )
                .await
                .context("listing pipeline jobs")?;
            let jobs: Vec<RemoteJob> = serde_json::from_value(value).unwrap_or_else(|parse| {
                warn!(error = %parse, "unexpected job listing payload");
                Vec::new()
            });
            if let Some(remote) = jobs
                .into_iter()
                .find(|job| job.git_ref.as_deref() == Some(tag))
            {
                self.job.log(format!("Build job #{} queued", remote.id));
                return Ok(Some(remote));
            }

            if started.elapsed() >= self.config.publication.wait_timeout() {
                bail!(
                    "no build job appeared for tag {tag} within {}s. Check that CI runners \
                     are available for this project; new gitlab.com accounts must verify \
                     their identity before shared runners pick up jobs",
                    self.config.publication.wait_timeout().as_secs()
                );
            }
            sleep(self.config.publication.wait_interval()).await;
        }
    }

    /// Follow the remote job to a terminal state, streaming its cleaned
    /// trace into the tracking job. Past the poll deadline the run soft
    /// stops: terminal, but with no error line, since the remote build
    /// keeps going without us.
    async fn follow_build(&self, remote: RemoteJob) -> Result<Outcome> {
        let path = format!("projects/{}/jobs/{}", self.website, remote.id);
        let mut cursor = TraceCursor::new();
        let mut last_status = remote.status.clone();
        let mut web_url = remote.web_url.clone();
        let started = Instant::now();

        loop {
            if self.cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let value = self
                .gateway
                .execute(&self.session, Method::GET, &path, &[], None)
                .await
                .context("fetching the build job")?;
            match serde_json::from_value::<RemoteJob>(value) {
                Ok(current) => {
                    last_status = current.status;
                    if current.web_url.is_some() {
                        web_url = current.web_url;
                    }
                }
                Err(parse) => {
                    debug!(error = %parse, "unexpected job payload, keeping the last known status");
                }
            }

            match self
                .gateway
                .execute_text(&self.session, Method::GET, &format!("{path}/trace"), &[])
                .await
            {
                Ok(trace) => {
                    for line in clean_lines(cursor.advance(&trace)) {
                        if let Some(milestone) = milestone_for(&line) {
                            self.job.set_message(milestone);
                        }
                        self.job.log(line);
                    }
                }
                Err(fetch) => debug!(error = %fetch, "build trace not available yet"),
            }

            match map_job_status(&last_status) {
                RemoteJobStatus::Success => {
                    info!(website = %self.website, job = %self.job.id(), "build succeeded");
                    match self.published_result().await {
                        Some(result) => self.job.succeed("Website published", result),
                        None => {
                            self.job
                                .set_message("Website published, but its public URL could not be determined");
                            self.job.set_status(JobStatus::Success);
                        }
                    }
                    return Ok(Outcome::Finished);
                }
                RemoteJobStatus::Failed => {
                    let mut message = format!("The build ended as {last_status}");
                    if let Some(url) = &web_url {
                        message.push_str(&format!(", details at {url}"));
                    }
                    self.job.fail(message);
                    return Ok(Outcome::Finished);
                }
                RemoteJobStatus::Running => {}
            }

            if started.elapsed() >= self.config.publication.poll_timeout() {
                let mut message = format!(
                    "Stopped following the build after {}s, it may still succeed",
                    self.config.publication.poll_timeout().as_secs()
                );
                if let Some(url) = &web_url {
                    message.push_str(&format!("; follow it at {url}"));
                }
                warn!(website = %self.website, job = %self.job.id(), "poll deadline reached");
                self.job.set_message(message);
                self.job.set_status(JobStatus::Error);
                return Ok(Outcome::Finished);
            }
            sleep(self.config.publication.poll_interval()).await;
        }
    }

    async fn published_result(&self) -> Option<PublishResult> {
        let value = match self
            .gateway
            .execute(
                &self.session,
                Method::GET,
                &format!("projects/{}", self.website),
                &[],
                None,
            )
            .await
        {
            Ok(value) => value,
            Err(fetch) => {
                warn!(error = %fetch, "cannot fetch the project for its published url");
                return None;
            }
        };

        let namespace_path = value.get("path_with_namespace").and_then(Value::as_str)?;
        let site_url = pages_url(&self.config.gitlab.pages_domain, namespace_path)?;
        let admin_url = value
            .get("web_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        let pages_url = admin_url.as_ref().map(|url| format!("{url}/pages"));
        Some(PublishResult {
            site_url,
            admin_url,
            pages_url,
        })
    }
}

#[async_trait]
impl HostingConnector for GitlabConnector {
    async fn publish(
        &self,
        session: Arc<Session>,
        id: &WebsiteId,
        assets: Vec<AssetFile>,
    ) -> Result<PublishJob> {
        if !self.is_authenticated(&session) {
            bail!("the session is not logged in to {}", self.display_name());
        }

        let job = self.jobs().create("Publication queued");
        let run = PublishRun {
            gateway: self.gateway().clone(),
            config: self.config_handle(),
            session,
            website: id.clone(),
            job: job.clone(),
            uploaded: HashMap::new(),
            pending_assets: assets,
        };
        info!(website = %id, job = %job.id(), "publication started");
        tokio::spawn(run.run());
        Ok(job.snapshot())
    }

    fn job(&self, job_id: &str) -> Option<PublishJob> {
        self.jobs().snapshot(job_id)
    }

    fn cancel_job(&self, job_id: &str) -> bool {
        self.jobs().cancel(job_id)
    }

    async fn site_url(&self, session: &Session, id: &WebsiteId) -> Result<String> {
        let project = self.fetch_project(session, id).await?;
        let namespace_path = project
            .path_with_namespace
            .ok_or_else(|| anyhow!("project {id} carries no namespace path"))?;
        pages_url(&self.config().gitlab.pages_domain, &namespace_path)
            .ok_or_else(|| anyhow!("cannot derive a pages url from {namespace_path}"))
    }
}
