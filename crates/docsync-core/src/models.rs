//! Core data models that flow through the synchronization pipeline.
//!
//! A [`SourceDocument`] is what a lister reports about a file at the
//! source; an [`IndexedDocument`] is what ends up in the search index.
//! The two are tied together by [`derive_index_id`], which is the only
//! place an index key is ever computed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A file found at the remote source during one listing pass.
///
/// Content is not part of the descriptor; it is fetched lazily through
/// the lister that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    /// Source-assigned identifier, stable across runs.
    pub id: String,
    /// File name including extension.
    pub name: String,
    /// Path of the file within the scope (display and logging only).
    pub path: String,
    /// Lower-cased extension without the dot, empty when the name has none.
    pub extension: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// Content hash reported by the source, if it has one.
    pub content_hash: Option<String>,
    /// Browsable location of the file.
    pub url: Option<String>,
}

impl SourceDocument {
    /// Build a descriptor, deriving `extension` from `name`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<String>,
        size: u64,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            extension: normalize_extension(&name),
            name,
            path: path.into(),
            size,
            last_modified,
            content_hash: None,
            url: None,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// The searchable representation written to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    /// Index key, always [`derive_index_id`] of `scope` and `source_id`.
    pub id: String,
    /// Scope label of the source this document was attributed to.
    pub scope: String,
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub last_modified: DateTime<Utc>,
    pub content_hash: Option<String>,
    /// Hash of the transform chain the content was produced with.
    #[serde(default)]
    pub rules_hash: Option<String>,
}

impl IndexedDocument {
    pub fn fingerprint(&self) -> DocumentFingerprint {
        DocumentFingerprint {
            last_modified: self.last_modified,
            content_hash: self.content_hash.clone(),
            rules_hash: self.rules_hash.clone(),
        }
    }
}

/// What the index remembers about the version of a document it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFingerprint {
    pub last_modified: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub rules_hash: Option<String>,
}

impl DocumentFingerprint {
    /// True when `doc` is not newer than the indexed version and was
    /// indexed with the chain hashing to `rules_hash`.
    ///
    /// Content hashes are compared only when both sides have one; a
    /// differing hash always counts as a change, whatever the timestamps
    /// say. An entry without a recorded chain hash never matches.
    pub fn matches(&self, doc: &SourceDocument, rules_hash: &str) -> bool {
        if self.rules_hash.as_deref() != Some(rules_hash) {
            return false;
        }
        if doc.last_modified > self.last_modified {
            return false;
        }
        match (&self.content_hash, &doc.content_hash) {
            (Some(indexed), Some(current)) => indexed == current,
            _ => true,
        }
    }
}

/// Derive the index key for a source document.
///
/// Deterministic in (`scope`, `source_id`) so re-processing a document
/// always overwrites the same entry. The result is lower-case hex, which
/// every supported index backend accepts as a key.
pub fn derive_index_id(scope: &str, source_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract the lower-cased extension of a file name, without the dot.
pub fn normalize_extension(name: &str) -> String {
    let file = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.trim().to_ascii_lowercase(),
        _ => String::new(),
    }
}
