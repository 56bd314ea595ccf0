//! Index writer: turns a transformed document into its searchable
//! representation and upserts it.
//!
//! The index key is always [`derive_index_id`] of the writer's scope and
//! the source id, so writing the same source document twice overwrites
//! one entry. Every failure is returned as a [`DocumentError`] for that
//! document only.

use std::sync::Arc;

use docsync_core::models::{derive_index_id, IndexedDocument, SourceDocument};
use docsync_core::store::SearchIndex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::DocumentError;
use crate::extract::{extract_text, ExtractError};
use crate::transform::TransformedArtifact;

pub struct IndexWriter {
    index: Arc<dyn SearchIndex>,
    scope: String,
    max_content_bytes: usize,
}

impl IndexWriter {
    pub fn new(index: Arc<dyn SearchIndex>, scope: impl Into<String>, max_content_bytes: usize) -> Self {
        Self {
            index,
            scope: scope.into(),
            max_content_bytes,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn index_id(&self, source_id: &str) -> String {
        derive_index_id(&self.scope, source_id)
    }

    /// Build the indexed representation of `doc` from its transformed
    /// content. `raw` is the content as fetched, used to fingerprint the
    /// document when the source reports no hash of its own.
    pub async fn build(
        &self,
        doc: &SourceDocument,
        raw: &[u8],
        artifact: &TransformedArtifact,
    ) -> Result<IndexedDocument, DocumentError> {
        let bytes = artifact.content.clone();
        let extension = doc.extension.clone();
        let content = tokio::task::spawn_blocking(move || extract_text(&bytes, &extension))
            .await
            .map_err(|e| ExtractError::Aborted(e.to_string()))??;

        let content_hash = doc
            .content_hash
            .clone()
            .unwrap_or_else(|| format!("{:x}", Sha256::digest(raw)));

        Ok(IndexedDocument {
            id: self.index_id(&doc.id),
            scope: self.scope.clone(),
            source_id: doc.id.clone(),
            title: doc.name.clone(),
            content,
            metadata: metadata(doc, artifact),
            last_modified: doc.last_modified,
            content_hash: Some(content_hash),
            rules_hash: Some(artifact.rules_hash.clone()),
        })
    }

    /// Insert or overwrite `doc`. Oversized payloads are rejected before
    /// they reach the index.
    pub async fn upsert(&self, doc: &IndexedDocument) -> Result<(), DocumentError> {
        if doc.content.len() > self.max_content_bytes {
            return Err(DocumentError::Upsert(format!(
                "payload too large: {} bytes of text exceeds the {} byte limit",
                doc.content.len(),
                self.max_content_bytes
            )));
        }
        self.index
            .upsert(doc)
            .await
            .map_err(|e| DocumentError::Upsert(format!("{:#}", e)))
    }
}

fn metadata(doc: &SourceDocument, artifact: &TransformedArtifact) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("name".into(), json!(doc.name));
    m.insert("path".into(), json!(doc.path));
    m.insert("extension".into(), json!(doc.extension));
    m.insert("size".into(), json!(doc.size));
    if let Some(ref url) = doc.url {
        m.insert("url".into(), json!(url));
    }
    let applied = artifact.applied_names();
    if !applied.is_empty() {
        m.insert("transforms".into(), json!(applied));
    }
    if !artifact.side_artifacts.is_empty() {
        let names: Vec<&str> = artifact.side_artifacts.iter().map(|s| s.name.as_str()).collect();
        m.insert("side_artifacts".into(), json!(names));
    }
    m
}
