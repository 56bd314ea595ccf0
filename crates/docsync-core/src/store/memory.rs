//! In-memory [`SearchIndex`] implementation for tests and dry runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Locks are never held
//! across an await point.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{DocumentFingerprint, IndexedDocument};

use super::SearchIndex;

/// In-memory index keyed by document id.
#[derive(Default)]
pub struct InMemoryIndex {
    docs: RwLock<HashMap<String, IndexedDocument>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index pre-populated with `docs`.
    pub fn with_documents(docs: impl IntoIterator<Item = IndexedDocument>) -> Self {
        let map = docs.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self {
            docs: RwLock::new(map),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored document, sorted by id.
    pub fn snapshot(&self) -> Vec<IndexedDocument> {
        let mut docs: Vec<IndexedDocument> = self
            .docs
            .read()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }
}

fn poisoned() -> anyhow::Error {
    anyhow!("in-memory index lock poisoned")
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn upsert(&self, doc: &IndexedDocument) -> Result<()> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn fingerprint(&self, id: &str) -> Result<Option<DocumentFingerprint>> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.get(id).map(IndexedDocument::fingerprint))
    }

    async fn list_ids(&self, scope: &str) -> Result<HashSet<String>> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs
            .values()
            .filter(|d| d.scope == scope)
            .map(|d| d.id.clone())
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        docs.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<IndexedDocument>> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.get(id).cloned())
    }
}
