//! Content-addressable diff between target files and the remote tree.
//!
//! The remote tree listing already carries each blob's git object digest,
//! so deciding create/update/unchanged never needs a download: hash the
//! candidate bytes the way git does and compare. Deletions are opt-in;
//! document saves compute them explicitly from old/new page references,
//! while full asset syncs remove every unlisted file under their prefix.

use std::collections::{HashMap, HashSet};

use reqwest::Method;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use sitegit::document::FileContent;
use sitegit::Session;
use tracing::warn;

use crate::gateway::{ApiError, Gateway};

/// Git object digest of one blob: SHA-1 over `blob {len}\0{bytes}`,
/// hex-encoded. Runs over raw bytes so text and binary content frame
/// identically on both comparison sides.
pub fn blob_digest(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", content.len()).as_bytes());
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// One entry of the remote tree listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    /// Object digest as reported by the provider
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl TreeEntry {
    pub fn is_blob(&self) -> bool {
        self.kind == "blob"
    }
}

/// One candidate file on the local side of the diff.
#[derive(Debug, Clone)]
pub struct TargetFile {
    pub path: String,
    pub content: FileContent,
}

impl TargetFile {
    pub fn new(path: impl Into<String>, content: FileContent) -> Self {
        Self {
            path: path.into(),
            content,
        }
    }

    pub fn text(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: FileContent::Text(content.into()),
        }
    }
}

/// Classified change for one path.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOp {
    Create { path: String, content: FileContent },
    Update { path: String, content: FileContent },
    Delete { path: String },
}

impl FileOp {
    pub fn path(&self) -> &str {
        match self {
            FileOp::Create { path, .. } | FileOp::Update { path, .. } | FileOp::Delete { path } => {
                path
            }
        }
    }
}

/// What happens to remote paths absent from the target set.
#[derive(Debug, Clone)]
pub enum DeleteMode {
    /// Leave them alone. Document saves pass explicit deletions instead.
    KeepUnlisted,
    /// Delete every unlisted remote blob under this prefix (full sync of
    /// a published folder).
    RemoveUnlisted { prefix: String },
}

/// Classify every target against the remote tree.
///
/// Each target path maps to exactly one of create/update/unchanged;
/// unchanged paths emit no operation. Duplicate target paths keep their
/// first occurrence. Deletions, when enabled, come after the upserts in
/// sorted path order so the result is deterministic.
pub fn diff(targets: &[TargetFile], remote: &[TreeEntry], mode: &DeleteMode) -> Vec<FileOp> {
    let remote_digests: HashMap<&str, &str> = remote
        .iter()
        .filter(|entry| entry.is_blob())
        .map(|entry| (entry.path.as_str(), entry.id.as_str()))
        .collect();

    let mut ops = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for target in targets {
        if !seen.insert(target.path.as_str()) {
            continue;
        }
        match remote_digests.get(target.path.as_str()) {
            None => ops.push(FileOp::Create {
                path: target.path.clone(),
                content: target.content.clone(),
            }),
            Some(&digest) if digest != blob_digest(target.content.as_bytes()) => {
                ops.push(FileOp::Update {
                    path: target.path.clone(),
                    content: target.content.clone(),
                })
            }
            Some(_) => {}
        }
    }

    if let DeleteMode::RemoveUnlisted { prefix } = mode {
        let mut stale: Vec<&str> = remote
            .iter()
            .filter(|entry| {
                entry.is_blob()
                    && entry.path.starts_with(prefix.as_str())
                    && !seen.contains(entry.path.as_str())
            })
            .map(|entry| entry.path.as_str())
            .collect();
        stale.sort_unstable();
        ops.extend(stale.into_iter().map(|path| FileOp::Delete {
            path: path.to_string(),
        }));
    }

    ops
}

/// Fetch the remote tree, recursively, blobs and trees alike.
///
/// GitLab paginates the listing by page number and reports the page count
/// in the `x-total-pages` response header; the loop keeps requesting while
/// more pages remain. A repository without a tree yet (fresh project)
/// reports not-found, which callers want as an empty listing.
pub async fn fetch_remote_tree(
    gateway: &Gateway,
    session: &Session,
    project_id: &str,
    path: Option<&str>,
) -> Result<Vec<TreeEntry>, ApiError> {
    let endpoint = format!("projects/{project_id}/repository/tree");
    let mut entries = Vec::new();
    let mut page = 1u32;

    loop {
        let mut query = vec![
            ("recursive", "true".to_string()),
            ("per_page", "100".to_string()),
            ("page", page.to_string()),
        ];
        if let Some(path) = path {
            query.push(("path", path.to_string()));
        }

        let (value, headers) = match gateway
            .execute_with_headers(session, Method::GET, &endpoint, &query)
            .await
        {
            Ok(result) => result,
            Err(error) if error.is_not_found() => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        match serde_json::from_value::<Vec<TreeEntry>>(value) {
            Ok(batch) => entries.extend(batch),
            Err(error) => {
                warn!(error = %error, page = page, "unexpected tree listing payload, skipping page");
            }
        }

        let total_pages = headers
            .get("x-total-pages")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(1);
        if page >= total_pages {
            return Ok(entries);
        }
        page += 1;
    }
}
