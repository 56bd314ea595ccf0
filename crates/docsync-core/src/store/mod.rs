//! Search index abstraction.
//!
//! The [`SearchIndex`] trait is the document API of the target index: the
//! pipeline upserts through it, change detection reads fingerprints from
//! it, and reconciliation enumerates and deletes through it. Backends
//! (SQLite, Azure AI Search, in-memory) live behind this trait.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DocumentFingerprint, IndexedDocument};

/// Abstract document store of the search index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](SearchIndex::upsert) | Insert or overwrite a document by id |
/// | [`fingerprint`](SearchIndex::fingerprint) | Version info of an indexed document |
/// | [`list_ids`](SearchIndex::list_ids) | Ids attributed to one scope |
/// | [`delete`](SearchIndex::delete) | Remove a document by id |
/// | [`get`](SearchIndex::get) | Retrieve a stored document |
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or overwrite the document stored under `doc.id`.
    async fn upsert(&self, doc: &IndexedDocument) -> Result<()>;

    /// Fingerprint of the document stored under `id`, if any.
    async fn fingerprint(&self, id: &str) -> Result<Option<DocumentFingerprint>>;

    /// Ids of every document attributed to `scope`. Documents from other
    /// scopes must never appear here.
    async fn list_ids(&self, scope: &str) -> Result<HashSet<String>>;

    /// Delete the document stored under `id`. Deleting a missing id is not
    /// an error.
    async fn delete(&self, id: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<IndexedDocument>>;
}
