//! Source listing.
//!
//! A [`SourceLister`] enumerates the documents currently present in one
//! scope as a lazy, flat stream: paging and folder recursion are hidden
//! from the caller. Every call to [`SourceLister::list`] starts a fresh
//! enumeration from the beginning of the scope.
//!
//! | Kind | Module | Document id |
//! |------|--------|-------------|
//! | `filesystem` | [`connector_fs`](crate::connector_fs) | path relative to root |
//! | `s3` | [`connector_s3`](crate::connector_s3) | object key |
//! | `sharepoint` | [`connector_sharepoint`](crate::connector_sharepoint) | drive item id |
//!
//! Listers report every document. The extension [`AllowList`] is applied
//! by the orchestrator, which still needs to see excluded documents so
//! their index entries are never mistaken for deletions.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use docsync_core::models::SourceDocument;
use futures::stream::BoxStream;

use crate::config::{Config, SourceKind};
use crate::connector_fs::FilesystemLister;
use crate::connector_s3::S3Lister;
use crate::connector_sharepoint::SharePointLister;
use crate::error::SyncError;
use crate::s3::{AwsCredentials, S3Client};
use crate::secrets::SecretProvider;

/// Flat stream of listed documents. An `Err` item means the listing
/// could not be completed.
pub type DocumentStream<'a> = BoxStream<'a, Result<SourceDocument>>;

#[async_trait]
pub trait SourceLister: Send + Sync {
    /// Scope label attributed to every listed document.
    fn scope(&self) -> &str;

    /// Start a fresh enumeration of the scope.
    fn list(&self) -> DocumentStream<'_>;

    /// Download the content of a listed document.
    async fn fetch(&self, doc: &SourceDocument) -> Result<Vec<u8>>;
}

/// Extensions a run may index. Empty means every extension.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: HashSet<String>,
}

impl AllowList {
    pub fn new(allowed_formats: &[String]) -> Self {
        let allowed = allowed_formats
            .iter()
            .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .collect();
        Self { allowed }
    }

    /// `extension` is the normalized form carried by [`SourceDocument`].
    pub fn allows(&self, extension: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(extension)
    }
}

/// Build the configured lister.
pub async fn build_lister(
    config: &Config,
    secrets: &dyn SecretProvider,
) -> Result<Box<dyn SourceLister>, SyncError> {
    let source = &config.source;
    let scope = source.scope();
    let inner: Box<dyn SourceLister> = match source.kind {
        SourceKind::Filesystem => {
            let fs = source
                .filesystem
                .as_ref()
                .ok_or_else(|| SyncError::config("[source.filesystem] is missing"))?;
            Box::new(
                FilesystemLister::new(scope, fs)
                    .map_err(|e| SyncError::config(format!("{:#}", e)))?,
            )
        }
        SourceKind::S3 => {
            let s3 = source
                .s3
                .as_ref()
                .ok_or_else(|| SyncError::config("[source.s3] is missing"))?;
            let creds = AwsCredentials::from_secrets(secrets)
                .await
                .map_err(|e| SyncError::config(format!("{:#}", e)))?;
            let client =
                S3Client::new(s3, creds).map_err(|e| SyncError::config(format!("{:#}", e)))?;
            Box::new(S3Lister::new(scope, client, &s3.prefix))
        }
        SourceKind::Sharepoint => {
            let sp = source
                .sharepoint
                .as_ref()
                .ok_or_else(|| SyncError::config("[source.sharepoint] is missing"))?;
            let secret = secrets
                .get_secret(&sp.client_secret_name)
                .await
                .map_err(|e| SyncError::config(format!("{:#}", e)))?;
            Box::new(
                SharePointLister::new(scope, sp, secret)
                    .map_err(|e| SyncError::config(format!("{:#}", e)))?,
            )
        }
    };
    Ok(inner)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory lister used by unit and pipeline tests.

    use super::*;
    use futures::StreamExt;
    use std::collections::HashMap;

    pub struct StaticLister {
        pub scope: String,
        pub docs: Vec<(SourceDocument, Vec<u8>)>,
        /// Fail the listing after this many documents.
        pub fail_after: Option<usize>,
    }

    impl StaticLister {
        pub fn new(scope: &str, docs: Vec<(SourceDocument, Vec<u8>)>) -> Self {
            Self {
                scope: scope.to_string(),
                docs,
                fail_after: None,
            }
        }
    }

    #[async_trait]
    impl SourceLister for StaticLister {
        fn scope(&self) -> &str {
            &self.scope
        }

        fn list(&self) -> DocumentStream<'_> {
            let mut items: Vec<Result<SourceDocument>> =
                self.docs.iter().map(|(d, _)| Ok(d.clone())).collect();
            if let Some(n) = self.fail_after {
                items.truncate(n);
                items.push(Err(anyhow::anyhow!("listing interrupted")));
            }
            futures::stream::iter(items).boxed()
        }

        async fn fetch(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
            let contents: HashMap<&str, &Vec<u8>> =
                self.docs.iter().map(|(d, c)| (d.id.as_str(), c)).collect();
            contents
                .get(doc.id.as_str())
                .map(|c| c.to_vec())
                .ok_or_else(|| anyhow::anyhow!("no content for {}", doc.id))
        }
    }
}
