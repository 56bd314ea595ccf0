//! Selects and opens the configured index backend.

use std::sync::Arc;

use docsync_core::store::SearchIndex;

use crate::config::{Config, IndexBackend};
use crate::error::SyncError;
use crate::index_azure::AzureSearchIndex;
use crate::index_sqlite::SqliteIndex;
use crate::secrets::SecretProvider;

/// Open the index named by `[index]`.
///
/// Any failure here happens before a run starts, so it is reported as
/// [`SyncError::IndexUnavailable`] (or a configuration error for a
/// missing api key).
pub async fn open_index(
    config: &Config,
    secrets: &dyn SecretProvider,
) -> Result<Arc<dyn SearchIndex>, SyncError> {
    match config.index.backend {
        IndexBackend::Sqlite => {
            let index = SqliteIndex::open(&config.index.path, config.chunking.max_tokens)
                .await
                .map_err(|e| SyncError::IndexUnavailable(format!("{:#}", e)))?;
            Ok(Arc::new(index))
        }
        IndexBackend::Azure => {
            let key = secrets
                .get_secret(&config.index.api_key_secret)
                .await
                .map_err(|e| SyncError::config(format!("{:#}", e)))?;
            let index = AzureSearchIndex::new(&config.index, key)
                .map_err(|e| SyncError::config(format!("{:#}", e)))?;
            Ok(Arc::new(index))
        }
    }
}
