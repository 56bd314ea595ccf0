//! Index reconciliation: purge entries whose source document is gone.
//!
//! The reconciler only ever looks at ids attributed to one scope, so
//! content written by other sources into the same index is never a
//! deletion candidate.

use std::collections::HashSet;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::store::SearchIndex;

/// A single deletion that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of one purge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Ids in the index for the scope when the pass started.
    pub examined: usize,
    /// Entries actually deleted.
    pub removed: usize,
    pub failures: Vec<PurgeFailure>,
}

/// Computes and deletes the reconciliation set of a scope.
pub struct IndexReconciler<'a> {
    index: &'a dyn SearchIndex,
}

impl<'a> IndexReconciler<'a> {
    pub fn new(index: &'a dyn SearchIndex) -> Self {
        Self { index }
    }

    /// Ids present in the index for `scope` but absent from `current_ids`,
    /// sorted for deterministic processing.
    pub async fn stale_ids(
        &self,
        current_ids: &HashSet<String>,
        scope: &str,
    ) -> Result<(usize, Vec<String>)> {
        let index_ids = self
            .index
            .list_ids(scope)
            .await
            .with_context(|| format!("failed to enumerate index ids for scope '{}'", scope))?;
        let mut stale: Vec<String> = index_ids.difference(current_ids).cloned().collect();
        stale.sort();
        Ok((index_ids.len(), stale))
    }

    /// Delete every index entry of `scope` whose id is not in `current_ids`.
    ///
    /// Only a failure to enumerate the index is returned as an error. Each
    /// deletion is attempted even when earlier ones fail; those failures
    /// are collected in the report.
    pub async fn purge(&self, current_ids: &HashSet<String>, scope: &str) -> Result<PurgeReport> {
        let (examined, stale) = self.stale_ids(current_ids, scope).await?;
        info!(
            scope,
            examined,
            stale = stale.len(),
            "reconciling index against source listing"
        );

        let mut report = PurgeReport {
            examined,
            ..Default::default()
        };
        for id in stale {
            match self.index.delete(&id).await {
                Ok(()) => {
                    debug!(id = %id, "purged index entry");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "failed to purge index entry");
                    report.failures.push(PurgeFailure {
                        id,
                        error: format!("{:#}", e),
                    });
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentFingerprint, IndexedDocument};
    use crate::store::memory::InMemoryIndex;
    use async_trait::async_trait;
    use chrono::Utc;

    fn doc(scope: &str, id: &str) -> IndexedDocument {
        IndexedDocument {
            id: id.to_string(),
            scope: scope.to_string(),
            source_id: id.to_string(),
            title: id.to_string(),
            content: String::new(),
            metadata: Default::default(),
            last_modified: Utc::now(),
            content_hash: None,
            rules_hash: None,
        }
    }

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn purges_only_missing_ids() {
        let index = InMemoryIndex::with_documents(
            ["a", "b", "c", "d"].iter().map(|id| doc("sp", id)),
        );
        let report = IndexReconciler::new(&index)
            .purge(&ids(&["a", "b", "c"]), "sp")
            .await
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.examined, 4);
        assert!(report.failures.is_empty());
        let remaining = index.list_ids("sp").await.unwrap();
        assert_eq!(remaining, ids(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn other_scopes_are_untouched() {
        let index = InMemoryIndex::with_documents(vec![doc("sp", "a"), doc("blob", "z")]);
        let report = IndexReconciler::new(&index)
            .purge(&HashSet::new(), "sp")
            .await
            .unwrap();
        assert_eq!(report.removed, 1);
        assert!(index.get("z").await.unwrap().is_some());
    }

    /// Refuses to delete selected ids.
    struct StubbornIndex {
        inner: InMemoryIndex,
        refuse: HashSet<String>,
    }

    #[async_trait]
    impl SearchIndex for StubbornIndex {
        async fn upsert(&self, doc: &IndexedDocument) -> Result<()> {
            self.inner.upsert(doc).await
        }
        async fn fingerprint(&self, id: &str) -> Result<Option<DocumentFingerprint>> {
            self.inner.fingerprint(id).await
        }
        async fn list_ids(&self, scope: &str) -> Result<HashSet<String>> {
            self.inner.list_ids(scope).await
        }
        async fn delete(&self, id: &str) -> Result<()> {
            if self.refuse.contains(id) {
                anyhow::bail!("delete rejected for {}", id);
            }
            self.inner.delete(id).await
        }
        async fn get(&self, id: &str) -> Result<Option<IndexedDocument>> {
            self.inner.get(id).await
        }
    }

    #[tokio::test]
    async fn failed_deletions_do_not_stop_the_pass() {
        let index = StubbornIndex {
            inner: InMemoryIndex::with_documents(["a", "b", "c"].iter().map(|id| doc("sp", id))),
            refuse: ids(&["a"]),
        };
        let report = IndexReconciler::new(&index)
            .purge(&HashSet::new(), "sp")
            .await
            .unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "a");
        assert_eq!(index.list_ids("sp").await.unwrap(), ids(&["a"]));
    }
}
