//! Batch commit builder.
//!
//! GitLab applies one ordered action list atomically per commit, but caps
//! how many actions a single commit may carry. The builder chunks long
//! change sets and issues one commit per chunk, sequentially. A chunk
//! failure stops the batch; earlier commits stay in place (accepted
//! partial application), and the error says exactly which chunk died.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Method;
use serde::Serialize;
use serde_json::json;
use sitegit::document::FileContent;
use sitegit::Session;
use tracing::debug;

use crate::diff::FileOp;
use crate::gateway::{ApiError, Gateway};

/// One file action of a commit payload, in the provider's wire shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitAction {
    pub action: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl CommitAction {
    fn upsert(action: &str, file_path: String, content: FileContent) -> Self {
        let (content, encoding) = match content {
            FileContent::Text(text) => (Some(text), None),
            // Binary bytes survive the JSON body base64-encoded
            FileContent::Binary(bytes) => (Some(BASE64.encode(bytes)), Some("base64".to_string())),
        };
        Self {
            action: action.to_string(),
            file_path,
            content,
            encoding,
        }
    }
}

impl From<FileOp> for CommitAction {
    fn from(op: FileOp) -> Self {
        match op {
            FileOp::Create { path, content } => CommitAction::upsert("create", path, content),
            FileOp::Update { path, content } => CommitAction::upsert("update", path, content),
            FileOp::Delete { path } => CommitAction {
                action: "delete".to_string(),
                file_path: path,
                content: None,
                encoding: None,
            },
        }
    }
}

/// Failure of one chunk, with enough context to know what already landed.
#[derive(Debug)]
pub struct ChunkError {
    /// Zero-based index of the chunk that failed
    pub chunk_index: usize,
    /// How many chunks the batch had in total
    pub chunk_count: usize,
    /// Chunks committed before the failure; their effects persist
    pub committed: usize,
    pub source: ApiError,
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "commit chunk {} of {} failed ({} chunk(s) already committed): {}",
            self.chunk_index + 1,
            self.chunk_count,
            self.committed,
            self.source
        )
    }
}

impl std::error::Error for ChunkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Apply an ordered action list to a branch, one commit per chunk of at
/// most `max_per_commit` actions. Returns the number of commits issued;
/// an empty list is a successful no-op without any remote call.
pub async fn commit_batch(
    gateway: &Gateway,
    session: &Session,
    project_id: &str,
    branch: &str,
    message: &str,
    actions: Vec<CommitAction>,
    max_per_commit: usize,
) -> Result<usize, ChunkError> {
    if actions.is_empty() {
        return Ok(0);
    }

    let max = max_per_commit.max(1);
    let chunks: Vec<&[CommitAction]> = actions.chunks(max).collect();
    let chunk_count = chunks.len();
    let endpoint = format!("projects/{project_id}/repository/commits");

    for (index, chunk) in chunks.iter().enumerate() {
        let chunk_message = if chunk_count > 1 {
            format!("{message} ({}/{chunk_count})", index + 1)
        } else {
            message.to_string()
        };
        let body = json!({
            "branch": branch,
            "commit_message": chunk_message,
            "actions": chunk,
        });

        debug!(
            project = %project_id,
            chunk = index + 1,
            chunks = chunk_count,
            actions = chunk.len(),
            "committing chunk"
        );
        gateway
            .execute(session, Method::POST, &endpoint, &[], Some(&body))
            .await
            .map_err(|source| ChunkError {
                chunk_index: index,
                chunk_count,
                committed: index,
                source,
            })?;
    }

    Ok(chunk_count)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::Matcher;
    use sitegit::{SessionRegistry, TokenSet};

    use super::*;
    use crate::config::ConnectorConfig;

    fn gateway_for(server: &mockito::ServerGuard) -> Gateway {
        let mut config = ConnectorConfig::default();
        config.gitlab.domain = server.url();
        Gateway::new(Arc::new(config), "gitlab")
    }

    fn logged_in(registry: &SessionRegistry) -> Arc<sitegit::Session> {
        let session = registry.create();
        session.put_tokens(
            "gitlab",
            TokenSet {
                access_token: Some("tok".to_string()),
                ..Default::default()
            },
        );
        session
    }

    fn create_action(path: &str) -> CommitAction {
        CommitAction::from(FileOp::Create {
            path: path.to_string(),
            content: FileContent::Text(format!("content of {path}")),
        })
    }

    #[test]
    fn file_ops_map_to_wire_actions() {
        let create = create_action("src/home-p1.json");
        assert_eq!(create.action, "create");
        assert_eq!(create.file_path, "src/home-p1.json");
        assert!(create.encoding.is_none());

        let binary = CommitAction::from(FileOp::Update {
            path: "assets/logo.png".to_string(),
            content: FileContent::Binary(vec![0x89, 0x50, 0x4e, 0x47]),
        });
        assert_eq!(binary.action, "update");
        assert_eq!(binary.encoding.as_deref(), Some("base64"));
        assert_eq!(binary.content.as_deref(), Some("iVBORw=="));

        let delete = CommitAction::from(FileOp::Delete {
            path: "src/about-p2.json".to_string(),
        });
        assert_eq!(delete.action, "delete");
        assert!(delete.content.is_none());
    }

    #[tokio::test]
    async fn an_empty_batch_makes_no_remote_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v4/projects/42/repository/commits")
            .expect(0)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in(&registry);

        let commits = commit_batch(&gateway, &session, "42", "main", "Save", vec![], 100)
            .await
            .unwrap();
        assert_eq!(commits, 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_short_batch_is_one_commit_with_the_plain_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v4/projects/42/repository/commits")
            .match_body(Matcher::PartialJson(json!({
                "branch": "main",
                "commit_message": "Save my-site",
            })))
            .with_status(201)
            .with_body(r#"{"id": "abc123"}"#)
            .expect(1)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in(&registry);

        let actions = vec![create_action("website.json"), create_action("src/home-p1.json")];
        let commits = commit_batch(&gateway, &session, "42", "main", "Save my-site", actions, 100)
            .await
            .unwrap();
        assert_eq!(commits, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn long_batches_chunk_into_ceil_len_over_max_commits() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v4/projects/42/repository/commits")
            .with_status(201)
            .with_body(r#"{"id": "abc123"}"#)
            .expect(3)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in(&registry);

        let actions: Vec<CommitAction> = (0..5)
            .map(|i| create_action(&format!("assets/file-{i}.css")))
            .collect();
        let commits = commit_batch(&gateway, &session, "42", "main", "Sync assets", actions, 2)
            .await
            .unwrap();
        assert_eq!(commits, 3); // 5 actions, 2 per commit
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_chunk_failure_stops_the_batch_and_names_the_chunk() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v4/projects/42/repository/commits")
            .match_body(Matcher::PartialJson(json!({"commit_message": "Sync (1/3)"})))
            .with_status(201)
            .with_body(r#"{"id": "abc123"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v4/projects/42/repository/commits")
            .match_body(Matcher::PartialJson(json!({"commit_message": "Sync (2/3)"})))
            .with_status(400)
            .with_body(r#"{"message": "A file with this name already exists"}"#)
            .create_async()
            .await;
        let third = server
            .mock("POST", "/api/v4/projects/42/repository/commits")
            .match_body(Matcher::PartialJson(json!({"commit_message": "Sync (3/3)"})))
            .expect(0)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let registry = SessionRegistry::new();
        let session = logged_in(&registry);

        let actions: Vec<CommitAction> = (0..6)
            .map(|i| create_action(&format!("assets/file-{i}.css")))
            .collect();
        let error = commit_batch(&gateway, &session, "42", "main", "Sync", actions, 2)
            .await
            .unwrap_err();

        assert_eq!(error.chunk_index, 1);
        assert_eq!(error.chunk_count, 3);
        assert_eq!(error.committed, 1);
        assert!(error.to_string().contains("chunk 2 of 3"));
        third.assert_async().await;
    }

    #[test]
    fn chunking_preserves_order_and_content() {
        let actions: Vec<CommitAction> = (0..7)
            .map(|i| create_action(&format!("assets/file-{i}.css")))
            .collect();

        let chunks: Vec<&[CommitAction]> = actions.chunks(3).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(chunks[2].len(), 1);

        let rejoined: Vec<CommitAction> = chunks.into_iter().flatten().cloned().collect();
        assert_eq!(rejoined, actions);
    }
}
