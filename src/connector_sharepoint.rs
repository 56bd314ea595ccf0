//! SharePoint document library lister (Microsoft Graph v1.0).
//!
//! # Workflow
//!
//! 1. Obtain an app-only token with the client-credentials grant.
//! 2. Resolve the site id from `site_domain` + `site_name`, then the
//!    drive id (configured, or the site's default document library).
//! 3. Traverse `/children` of the drive root (or of each configured
//!    sub-folder), following `@odata.nextLink` pages and descending into
//!    sub-folders whose name matches `folder_regex`.
//!
//! Pages are fetched on demand while the stream is consumed. Drive item
//! ids survive renames and moves inside the drive, so a renamed file
//! keeps its index entry.
//!
//! # Configuration
//!
//! ```toml
//! [source]
//! kind = "sharepoint"
//! name = "policies"
//!
//! [source.sharepoint]
//! tenant_id = "..."
//! client_id = "..."
//! client_secret_name = "sharepointClientSecret"
//! site_domain = "contoso.sharepoint.com"
//! site_name = "Policies"
//! subfolders = ["HR", "Finance/2024"]
//! folder_regex = "^[^_]"   # skip folders starting with an underscore
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsync_core::models::SourceDocument;
use futures::stream::{self, StreamExt, TryStreamExt};
use regex::Regex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::config::SharePointSourceConfig;
use crate::lister::{DocumentStream, SourceLister};
use crate::s3::uri_encode;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// ============ Graph response types ============

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    size: Option<u64>,
    last_modified_date_time: Option<DateTime<Utc>>,
    web_url: Option<String>,
    file: Option<FileFacet>,
    folder: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FileFacet {
    hashes: Option<Hashes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hashes {
    quick_xor_hash: Option<String>,
}

// ============ Lister ============

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// A `/children` page still to be fetched, with the folder path it lists.
struct PendingPage {
    url: String,
    folder: String,
}

pub struct SharePointLister {
    scope: String,
    http: Client,
    graph_base: String,
    login_base: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    site_domain: String,
    site_name: String,
    configured_drive: Option<String>,
    subfolders: Vec<String>,
    folder_regex: Regex,
    token: Mutex<Option<CachedToken>>,
    drive: OnceCell<String>,
}

impl SharePointLister {
    pub fn new(scope: String, config: &SharePointSourceConfig, client_secret: String) -> Result<Self> {
        let folder_regex = Regex::new(&config.folder_regex)
            .with_context(|| format!("invalid folder_regex '{}'", config.folder_regex))?;
        Ok(Self {
            scope,
            http: Client::new(),
            graph_base: config.graph_base_url.trim_end_matches('/').to_string(),
            login_base: config.login_base_url.trim_end_matches('/').to_string(),
            tenant_id: config.tenant_id.clone(),
            client_id: config.client_id.clone(),
            client_secret,
            site_domain: config.site_domain.clone(),
            site_name: config.site_name.clone(),
            configured_drive: config.drive_id.clone().filter(|d| !d.trim().is_empty()),
            subfolders: config
                .subfolders
                .iter()
                .map(|f| f.trim_matches('/').to_string())
                .filter(|f| !f.is_empty())
                .collect(),
            folder_regex,
            token: Mutex::new(None),
            drive: OnceCell::new(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok(token.value.clone());
            }
        }
        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base, self.tenant_id);
        let resp: TokenResponse = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .context("failed to request Graph access token")?
            .error_for_status()
            .context("Graph token request was rejected")?
            .json()
            .await
            .context("failed to parse Graph token response")?;
        debug!(expires_in = resp.expires_in, "obtained Graph access token");
        let value = resp.access_token.clone();
        *cached = Some(CachedToken {
            value: resp.access_token,
            expires_at: Instant::now() + Duration::from_secs(resp.expires_in),
        });
        Ok(value)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.access_token().await?;
        self.http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Graph request failed: {}", url))?
            .error_for_status()
            .with_context(|| format!("Graph request returned error status: {}", url))?
            .json()
            .await
            .with_context(|| format!("failed to parse Graph response: {}", url))
    }

    /// Drive id, resolved once per lister.
    async fn drive_id(&self) -> Result<&str> {
        let id = self
            .drive
            .get_or_try_init(|| async {
                if let Some(ref drive) = self.configured_drive {
                    return Ok::<_, anyhow::Error>(drive.clone());
                }
                let site: IdResponse = self
                    .get_json(&format!(
                        "{}/sites/{}:/sites/{}",
                        self.graph_base,
                        self.site_domain,
                        uri_encode(&self.site_name)
                    ))
                    .await
                    .context("failed to resolve SharePoint site")?;
                let drive: IdResponse = self
                    .get_json(&format!("{}/sites/{}/drive", self.graph_base, site.id))
                    .await
                    .context("failed to resolve default document library")?;
                debug!(site = %site.id, drive = %drive.id, "resolved SharePoint drive");
                Ok(drive.id)
            })
            .await?;
        Ok(id.as_str())
    }

    fn start_pages(&self, drive: &str) -> VecDeque<PendingPage> {
        if self.subfolders.is_empty() {
            return VecDeque::from([PendingPage {
                url: format!("{}/drives/{}/root/children", self.graph_base, drive),
                folder: String::new(),
            }]);
        }
        self.subfolders
            .iter()
            .map(|folder| PendingPage {
                url: format!(
                    "{}/drives/{}/root:/{}:/children",
                    self.graph_base,
                    drive,
                    encode_path(folder)
                ),
                folder: folder.clone(),
            })
            .collect()
    }

    /// Fetch one page, queue its follow-ups and return its files.
    async fn next_page(
        &self,
        queue: &mut VecDeque<PendingPage>,
        drive: &str,
    ) -> Result<Option<Vec<SourceDocument>>> {
        let Some(pending) = queue.pop_front() else {
            return Ok(None);
        };
        let page: ChildrenPage = self.get_json(&pending.url).await?;
        if let Some(next) = page.next_link {
            queue.push_front(PendingPage {
                url: next,
                folder: pending.folder.clone(),
            });
        }

        let mut files = Vec::new();
        for item in page.value {
            let path = join_path(&pending.folder, &item.name);
            if item.folder.is_some() {
                if self.folder_regex.is_match(&item.name) {
                    queue.push_back(PendingPage {
                        url: format!("{}/drives/{}/items/{}/children", self.graph_base, drive, item.id),
                        folder: path,
                    });
                } else {
                    debug!(folder = %path, "folder excluded by folder_regex");
                }
                continue;
            }
            if let Some(file) = item.file {
                let mut doc = SourceDocument::new(
                    item.id,
                    item.name,
                    path,
                    item.size.unwrap_or(0),
                    item.last_modified_date_time.unwrap_or_default(),
                );
                if let Some(hash) = file.hashes.and_then(|h| h.quick_xor_hash) {
                    doc = doc.with_content_hash(hash);
                }
                if let Some(url) = item.web_url {
                    doc = doc.with_url(url);
                }
                files.push(doc);
            }
        }
        debug!(folder = %pending.folder, files = files.len(), queued = queue.len(), "listed SharePoint page");
        Ok(Some(files))
    }
}

fn join_path(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

fn encode_path(path: &str) -> String {
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

#[async_trait]
impl SourceLister for SharePointLister {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn list(&self) -> DocumentStream<'_> {
        // `None` until the drive is resolved, then the queue of pending pages.
        let pages = stream::try_unfold(None::<VecDeque<PendingPage>>, move |state| async move {
            let drive = self.drive_id().await?;
            let mut queue = match state {
                Some(queue) => queue,
                None => self.start_pages(drive),
            };
            let files = self.next_page(&mut queue, drive).await?;
            Ok::<_, anyhow::Error>(files.map(|files| (files, Some(queue))))
        });
        pages
            .map_ok(|files| stream::iter(files.into_iter().map(Ok::<_, anyhow::Error>)))
            .try_flatten()
            .boxed()
    }

    async fn fetch(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
        let drive = self.drive_id().await?;
        let token = self.access_token().await?;
        let url = format!("{}/drives/{}/items/{}/content", self.graph_base, drive, doc.id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("failed to download '{}'", doc.path))?;
        if !resp.status().is_success() {
            return Err(anyhow!(
                "download of '{}' failed (HTTP {})",
                doc.path,
                resp.status()
            ));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_page_parses_files_and_folders() {
        let json = serde_json::json!({
            "value": [
                {"id": "F1", "name": "Policies", "folder": {"childCount": 3}},
                {"id": "D1", "name": "a.pdf", "size": 10,
                 "lastModifiedDateTime": "2024-05-01T08:00:00Z",
                 "webUrl": "https://contoso.sharepoint.com/a.pdf",
                 "file": {"mimeType": "application/pdf", "hashes": {"quickXorHash": "qx=="}}}
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/next"
        });
        let page: ChildrenPage = serde_json::from_value(json).unwrap();
        assert_eq!(page.value.len(), 2);
        assert!(page.value[0].folder.is_some());
        assert_eq!(
            page.value[1]
                .file
                .as_ref()
                .and_then(|f| f.hashes.as_ref())
                .and_then(|h| h.quick_xor_hash.as_deref()),
            Some("qx==")
        );
        assert!(page.next_link.is_some());
    }

    #[test]
    fn folder_paths_are_encoded_per_segment() {
        assert_eq!(encode_path("Finance/Q1 2024"), "Finance/Q1%202024");
        assert_eq!(join_path("", "a.pdf"), "a.pdf");
        assert_eq!(join_path("HR", "a.pdf"), "HR/a.pdf");
    }
}
