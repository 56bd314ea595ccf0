//! Azure AI Search backed [`SearchIndex`] (REST, `api-key` auth).
//!
//! | Operation | Request |
//! |-----------|---------|
//! | upsert | `POST /indexes/{name}/docs/index` with `mergeOrUpload` |
//! | delete | `POST /indexes/{name}/docs/index` with `delete` |
//! | fingerprint, get | `GET /indexes/{name}/docs/{id}` |
//! | list_ids | `POST /indexes/{name}/docs/search`, `scope eq '...'`, paged by `$skip` |
//! | ensure_index | `PUT /indexes/{name}` |
//!
//! The index is expected to define `id` (key), `scope` (filterable),
//! `source_id`, `title`, `content`, `metadata`, `last_modified`,
//! `content_hash` and `rules_hash` as strings. `metadata` carries the
//! JSON-encoded map.

use std::collections::HashSet;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsync_core::models::{DocumentFingerprint, IndexedDocument};
use docsync_core::store::SearchIndex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::IndexConfig;
use crate::s3::uri_encode;

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Serialize, Deserialize)]
struct AzureDocument {
    id: String,
    scope: String,
    source_id: String,
    title: String,
    content: String,
    metadata: String,
    last_modified: String,
    content_hash: Option<String>,
    #[serde(default)]
    rules_hash: Option<String>,
}

impl AzureDocument {
    fn from_indexed(doc: &IndexedDocument) -> Result<Self> {
        Ok(Self {
            id: doc.id.clone(),
            scope: doc.scope.clone(),
            source_id: doc.source_id.clone(),
            title: doc.title.clone(),
            content: doc.content.clone(),
            metadata: serde_json::to_string(&doc.metadata)?,
            last_modified: doc.last_modified.to_rfc3339(),
            content_hash: doc.content_hash.clone(),
            rules_hash: doc.rules_hash.clone(),
        })
    }

    fn into_indexed(self) -> Result<IndexedDocument> {
        Ok(IndexedDocument {
            metadata: serde_json::from_str(&self.metadata)
                .with_context(|| format!("corrupt metadata for document {}", self.id))?,
            last_modified: parse_timestamp(&self.last_modified)?,
            id: self.id,
            scope: self.scope,
            source_id: self.source_id,
            title: self.title,
            content: self.content,
            content_hash: self.content_hash,
            rules_hash: self.rules_hash,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FingerprintFields {
    last_modified: String,
    content_hash: Option<String>,
    #[serde(default)]
    rules_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    value: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct IndexingResults {
    #[serde(default)]
    value: Vec<IndexingResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexingResult {
    key: String,
    status: bool,
    error_message: Option<String>,
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid last_modified '{}'", s))?
        .with_timezone(&Utc))
}

/// OData string literal: single quotes are doubled.
fn odata_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub struct AzureSearchIndex {
    http: Client,
    endpoint: String,
    index: String,
    api_key: String,
    api_version: String,
}

impl AzureSearchIndex {
    pub fn new(config: &IndexConfig, api_key: String) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow!("index.endpoint is required for the azure backend"))?;
        Ok(Self {
            http: Client::new(),
            endpoint,
            index: config.name.clone(),
            api_key,
            api_version: config.api_version.clone(),
        })
    }

    /// Create or update the index definition (`PUT /indexes/{name}`).
    pub async fn ensure_index(&self) -> Result<()> {
        let field = |name: &str, searchable: bool, filterable: bool| {
            json!({
                "name": name,
                "type": "Edm.String",
                "searchable": searchable,
                "filterable": filterable,
                "retrievable": true,
            })
        };
        let mut id = field("id", false, true);
        id["key"] = json!(true);
        let definition = json!({
            "name": self.index,
            "fields": [
                id,
                field("scope", false, true),
                field("source_id", false, true),
                field("title", true, false),
                field("content", true, false),
                field("metadata", false, false),
                field("last_modified", false, true),
                field("content_hash", false, false),
                field("rules_hash", false, false),
            ],
        });
        let url = format!(
            "{}/indexes/{}?api-version={}",
            self.endpoint, self.index, self.api_version
        );
        let resp = self
            .http
            .put(&url)
            .header("api-key", &self.api_key)
            .json(&definition)
            .send()
            .await
            .context("index definition request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("index definition rejected ({}): {}", status, body);
        }
        Ok(())
    }

    fn docs_url(&self, suffix: &str) -> String {
        format!(
            "{}/indexes/{}/docs{}?api-version={}",
            self.endpoint, self.index, suffix, self.api_version
        )
    }

    /// Submit one batch action and check the per-document status.
    async fn index_action(&self, action: &str, doc: serde_json::Value, key: &str) -> Result<()> {
        let mut doc = doc;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("@search.action".to_string(), json!(action));
        }
        let resp = self
            .http
            .post(self.docs_url("/index"))
            .header("api-key", &self.api_key)
            .json(&json!({ "value": [doc] }))
            .send()
            .await
            .with_context(|| format!("{} request failed for {}", action, key))?;

        let status = resp.status();
        if !(status.is_success() || status == StatusCode::MULTI_STATUS) {
            let body = resp.text().await.unwrap_or_default();
            bail!("{} of {} returned {}: {}", action, key, status, body);
        }
        let results: IndexingResults = resp
            .json()
            .await
            .context("failed to parse indexing response")?;
        for r in results.value {
            if r.key == key && !r.status {
                bail!(
                    "{} of {} rejected: {}",
                    action,
                    key,
                    r.error_message.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
        Ok(())
    }

    /// Lookup by key; `None` on 404.
    async fn lookup<T: serde::de::DeserializeOwned>(
        &self,
        id: &str,
        select: Option<&str>,
    ) -> Result<Option<T>> {
        let mut req = self
            .http
            .get(self.docs_url(&format!("/{}", uri_encode(id))))
            .header("api-key", &self.api_key);
        if let Some(select) = select {
            req = req.query(&[("$select", select)]);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("lookup of {} failed", id))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("lookup of {} returned error status", id))?;
        Ok(Some(resp.json().await.with_context(|| {
            format!("failed to parse lookup response for {}", id)
        })?))
    }
}

#[async_trait]
impl SearchIndex for AzureSearchIndex {
    async fn upsert(&self, doc: &IndexedDocument) -> Result<()> {
        let body = serde_json::to_value(AzureDocument::from_indexed(doc)?)?;
        self.index_action("mergeOrUpload", body, &doc.id).await
    }

    async fn fingerprint(&self, id: &str) -> Result<Option<DocumentFingerprint>> {
        let fields: Option<FingerprintFields> =
            self.lookup(id, Some("last_modified,content_hash,rules_hash")).await?;
        fields
            .map(|f| {
                Ok(DocumentFingerprint {
                    last_modified: parse_timestamp(&f.last_modified)?,
                    content_hash: f.content_hash,
                    rules_hash: f.rules_hash,
                })
            })
            .transpose()
    }

    async fn list_ids(&self, scope: &str) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        let mut skip = 0usize;
        loop {
            let page: SearchPage = self
                .http
                .post(self.docs_url("/search"))
                .header("api-key", &self.api_key)
                .json(&json!({
                    "search": "*",
                    "filter": format!("scope eq {}", odata_literal(scope)),
                    "select": "id",
                    "top": PAGE_SIZE,
                    "skip": skip,
                }))
                .send()
                .await
                .context("index search request failed")?
                .error_for_status()
                .context("index search returned error status")?
                .json()
                .await
                .context("failed to parse index search response")?;
            let n = page.value.len();
            ids.extend(page.value.into_iter().map(|d| d.id));
            debug!(scope, fetched = ids.len(), "listed index ids");
            if n < PAGE_SIZE {
                break;
            }
            skip += PAGE_SIZE;
        }
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.index_action("delete", json!({ "id": id }), id).await
    }

    async fn get(&self, id: &str) -> Result<Option<IndexedDocument>> {
        let doc: Option<AzureDocument> = self.lookup(id, None).await?;
        doc.map(AzureDocument::into_indexed).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odata_literals_escape_quotes() {
        assert_eq!(odata_literal("sharepoint:o'brien"), "'sharepoint:o''brien'");
    }

    #[test]
    fn document_mapping_keeps_metadata_and_timestamp() {
        let mut metadata = serde_json::Map::new();
        metadata.insert("extension".into(), json!("pdf"));
        let doc = IndexedDocument {
            id: "abc".into(),
            scope: "s3:docs".into(),
            source_id: "a.pdf".into(),
            title: "a.pdf".into(),
            content: "text".into(),
            metadata,
            last_modified: parse_timestamp("2024-03-01T10:00:00Z").unwrap(),
            content_hash: Some("etag".into()),
            rules_hash: Some("rules-a".into()),
        };
        let wire = AzureDocument::from_indexed(&doc).unwrap();
        assert_eq!(wire.metadata, r#"{"extension":"pdf"}"#);
        assert_eq!(wire.into_indexed().unwrap(), doc);
    }

    #[test]
    fn endpoint_is_required() {
        let config: IndexConfig = toml::from_str("backend = \"azure\"").unwrap();
        assert!(AzureSearchIndex::new(&config, "k".into()).is_err());
    }
}
