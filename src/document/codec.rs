//! Split/merge codec between the in-memory document and its stored form.
//!
//! Stored form: one manifest plus one JSON file per page, every file
//! encoded with key-sorted pretty JSON so identical content always
//! produces identical bytes (content-addressed diffing depends on that).

use std::future::Future;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::{PageEntry, PageRef, WebsiteDocument, FILE_FORMAT_VERSION};

/// Result of splitting a document for storage: a manifest whose pages are
/// references, plus one file per externalized page.
#[derive(Clone, Debug)]
pub struct SplitDocument {
    pub manifest: String,
    pub pages: Vec<PageFile>,
}

/// One externalized page: repository path and encoded content.
#[derive(Clone, Debug)]
pub struct PageFile {
    pub path: String,
    pub content: String,
}

/// Slug used in page file names: lowercase alphanumeric runs joined by
/// `-`, anything else dropped. Falls back to `page` when nothing usable
/// remains.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut gap = false;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            if gap && !slug.is_empty() {
                slug.push('-');
            }
            gap = false;
            slug.extend(ch.to_lowercase());
        } else {
            gap = true;
        }
    }
    if slug.is_empty() {
        "page".to_string()
    } else {
        slug
    }
}

/// Repository path of the side file for a page: `{folder}/{slug}-{id}.json`.
pub fn page_file_path(pages_folder: &str, name: &str, id: &str) -> String {
    format!(
        "{}/{}-{}.json",
        pages_folder.trim_end_matches('/'),
        slugify(name),
        id
    )
}

/// Encode with sorted keys and stable formatting. Routing through
/// [`serde_json::Value`] sorts every object's keys (its map is ordered by
/// key), so field order in the source never leaks into the bytes.
pub fn to_sorted_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).context("serializing document content")?;
    serde_json::to_string_pretty(&value).context("encoding document content")
}

/// Split a document into its stored form.
///
/// Every embedded page with a usable string `name` and `id` moves to a
/// side file and is replaced in the manifest by a `{name, id, isFile}`
/// reference. Pages missing either field stay embedded; that is a
/// data-integrity condition worth a warning, not a failure. The manifest
/// records the pages folder and format version it was written with.
pub fn split(document: &WebsiteDocument) -> Result<SplitDocument> {
    let mut manifest = document.clone();
    let folder = manifest.pages_folder().to_string();
    manifest.pages_folder = Some(folder.clone());
    manifest.file_format_version = Some(FILE_FORMAT_VERSION);

    let mut pages = Vec::new();
    for (index, entry) in manifest.pages.iter_mut().enumerate() {
        let PageEntry::Full(value) = entry else {
            // Already a reference, nothing to externalize.
            continue;
        };
        let name = value.get("name").and_then(Value::as_str).map(str::to_string);
        let id = value.get("id").and_then(Value::as_str).map(str::to_string);
        let (Some(name), Some(id)) = (name, id) else {
            warn!(page = index, "page without a usable name/id left embedded in the manifest");
            continue;
        };
        pages.push(PageFile {
            path: page_file_path(&folder, &name, &id),
            content: to_sorted_json(value)?,
        });
        *entry = PageEntry::Reference(PageRef {
            name,
            id,
            is_file: true,
        });
    }

    Ok(SplitDocument {
        manifest: to_sorted_json(&manifest)?,
        pages,
    })
}

/// Merge a stored manifest back into the in-memory document, loading each
/// referenced page file through `load`.
///
/// Legacy manifests (no pages array, or pages still embedded) pass
/// through unchanged. A page file that fails to load or parse keeps its
/// raw reference in place, so one damaged file costs one page and not the
/// whole website.
pub async fn merge<F, Fut>(manifest: &str, mut load: F) -> Result<WebsiteDocument>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut document: WebsiteDocument =
        serde_json::from_str(manifest).context("parsing website manifest")?;

    if let Some(version) = document.file_format_version {
        if version != FILE_FORMAT_VERSION {
            warn!(
                found = version,
                expected = FILE_FORMAT_VERSION,
                "manifest format version differs from this build, merging anyway"
            );
        }
    }

    let folder = document.pages_folder().to_string();
    for entry in &mut document.pages {
        let PageEntry::Reference(page_ref) = entry else {
            // Embedded page, nothing to load.
            continue;
        };
        if !page_ref.is_file {
            continue;
        }
        let path = page_file_path(&folder, &page_ref.name, &page_ref.id);
        let loaded = match load(path.clone()).await {
            Ok(content) => content,
            Err(error) => {
                warn!(path = %path, error = %error, "page file failed to load, keeping the reference");
                continue;
            }
        };
        match serde_json::from_str::<Value>(&loaded) {
            Ok(value) => *entry = PageEntry::Full(value),
            Err(error) => {
                warn!(path = %path, error = %error, "page file is not valid JSON, keeping the reference");
            }
        }
    }

    Ok(document)
}
