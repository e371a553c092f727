//! Website document model.
//!
//! The editor hands the connector one JSON document per website: global
//! settings plus a page list. On the wire (and in the repository) the
//! document is split into a manifest and one file per page; [`codec`] owns
//! that split/merge. The model keeps every section the editor writes —
//! known sections get fields, everything else rides in `extra` untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codec;


/// Manifest file name at the repository root.
pub const MANIFEST_FILE: &str = "website.json";

/// Folder page files land in when the manifest does not name one.
pub const DEFAULT_PAGES_FOLDER: &str = "src";

/// Folder uploaded asset files land in.
pub const ASSETS_FOLDER: &str = "assets";

/// Manifest format this build writes.
pub const FILE_FORMAT_VERSION: u32 = 1;

/// Canonical in-memory form of one website.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fonts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub styles: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication: Option<Value>,
    #[serde(default)]
    pub pages: Vec<PageEntry>,
    /// Folder the page files live under; recorded on split so reads stay
    /// self-describing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_format_version: Option<u32>,
    /// Editor-owned sections this connector does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl WebsiteDocument {
    /// Pages folder, falling back to the legacy default.
    pub fn pages_folder(&self) -> &str {
        self.pages_folder.as_deref().unwrap_or(DEFAULT_PAGES_FOLDER)
    }

    /// Repository paths of every page stored as a side file.
    pub fn page_file_paths(&self) -> Vec<String> {
        let folder = self.pages_folder().to_string();
        self.pages
            .iter()
            .filter_map(|page| page.as_reference())
            .filter(|page_ref| page_ref.is_file)
            .map(|page_ref| codec::page_file_path(&folder, &page_ref.name, &page_ref.id))
            .collect()
    }
}

/// One entry in the manifest's page list: either a reference to a side
/// file, or the full page object embedded in place (legacy manifests, and
/// documents as the editor hands them over).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageEntry {
    Reference(PageRef),
    Full(Value),
}

impl PageEntry {
    pub fn as_reference(&self) -> Option<&PageRef> {
        match self {
            PageEntry::Reference(page_ref) => Some(page_ref),
            PageEntry::Full(_) => None,
        }
    }

    /// Page name, from either representation.
    pub fn name(&self) -> Option<&str> {
        match self {
            PageEntry::Reference(page_ref) => Some(page_ref.name.as_str()),
            PageEntry::Full(value) => value.get("name").and_then(Value::as_str),
        }
    }

    /// Page id, from either representation.
    pub fn id(&self) -> Option<&str> {
        match self {
            PageEntry::Reference(page_ref) => Some(page_ref.id.as_str()),
            PageEntry::Full(value) => value.get("id").and_then(Value::as_str),
        }
    }
}

/// Manifest-side stand-in for a page whose content lives in a side file.
///
/// `deny_unknown_fields` keeps full page objects from parsing as
/// references under the untagged [`PageEntry`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageRef {
    pub name: String,
    pub id: String,
    #[serde(rename = "isFile")]
    pub is_file: bool,
}

/// One asset file to upload: a logical path under the assets folder plus
/// its raw bytes. Identity is the resolved path.
#[derive(Clone, Debug)]
pub struct AssetFile {
    pub path: String,
    pub content: FileContent,
    pub mime: Option<String>,
}

impl AssetFile {
    /// Path of this asset inside the repository.
    pub fn repo_path(&self) -> String {
        let trimmed = self.path.trim_start_matches('/');
        if trimmed.starts_with(&format!("{ASSETS_FOLDER}/")) {
            trimmed.to_string()
        } else {
            format!("{ASSETS_FOLDER}/{trimmed}")
        }
    }
}

/// File payload as handed to the remote: text goes up as-is, binary goes
/// up base64-encoded. The distinction must survive into hashing so both
/// comparison sides frame the same bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    /// Raw bytes, regardless of representation.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(text) => text.as_bytes(),
            FileContent::Binary(bytes) => bytes.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        FileContent::Text(text)
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        FileContent::Text(text.to_string())
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        FileContent::Binary(bytes)
    }
}
