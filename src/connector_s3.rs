//! S3 bucket lister.
//!
//! Objects are listed with `ListObjectsV2`, one page (up to 1000 keys)
//! at a time: the next page is only requested once the consumer has
//! drained the current one. Object keys are the document ids and the
//! ETag is the content hash.
//!
//! # Configuration
//!
//! ```toml
//! [source]
//! kind = "s3"
//! name = "contracts"
//!
//! [source.s3]
//! bucket = "acme-docs"
//! prefix = "legal/contracts/"
//! region = "eu-west-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```

use anyhow::Result;
use async_trait::async_trait;
use docsync_core::models::SourceDocument;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use crate::lister::{DocumentStream, SourceLister};
use crate::s3::{S3Client, S3Object};

pub struct S3Lister {
    scope: String,
    client: S3Client,
    prefix: String,
}

impl S3Lister {
    pub fn new(scope: String, client: S3Client, prefix: &str) -> Self {
        Self {
            scope,
            client,
            prefix: prefix.to_string(),
        }
    }

    fn document(&self, obj: S3Object) -> SourceDocument {
        let name = obj.key.rsplit('/').next().unwrap_or(&obj.key).to_string();
        let url = format!("s3://{}/{}", self.client.bucket(), obj.key);
        let doc = SourceDocument::new(&obj.key, name, &obj.key, obj.size, obj.last_modified)
            .with_url(url);
        if obj.etag.is_empty() {
            doc
        } else {
            doc.with_content_hash(obj.etag)
        }
    }
}

#[async_trait]
impl SourceLister for S3Lister {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn list(&self) -> DocumentStream<'_> {
        // State: `Some(token)` while pages remain, `None` once the last page was read.
        let pages = stream::try_unfold(Some(None::<String>), move |state| async move {
            let Some(token) = state else {
                return Ok::<_, anyhow::Error>(None);
            };
            let page = self.client.list_page(&self.prefix, token.as_deref()).await?;
            debug!(
                bucket = self.client.bucket(),
                objects = page.objects.len(),
                more = page.next_token.is_some(),
                "listed S3 page"
            );
            let next = page.next_token.map(Some);
            Ok(Some((page.objects, next)))
        });
        pages
            .map_ok(|objects| stream::iter(objects.into_iter().map(Ok::<_, anyhow::Error>)))
            .try_flatten()
            .map_ok(move |obj| self.document(obj))
            .boxed()
    }

    async fn fetch(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
        self.client.get_object(&doc.id).await
    }
}
