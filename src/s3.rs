//! Minimal S3 REST client shared by the S3 lister and the S3 relocation
//! destination.
//!
//! Requests are signed with
//! [AWS Signature Version 4](https://docs.aws.amazon.com/AmazonS3/latest/API/sigv4-auth-using-authorization-header.html)
//! using only `hmac` + `sha2`.
//!
//! Addressing:
//!
//! | Endpoint | URL form |
//! |----------|----------|
//! | none (AWS) | `https://<bucket>.s3.<region>.amazonaws.com/<key>` |
//! | `endpoint_url` set | `<scheme>://<host>/<bucket>/<key>` (path style, for MinIO/LocalStack) |
//!
//! # Credentials
//!
//! Read through the secret provider under the names `aws-access-key-id`,
//! `aws-secret-access-key` and (optional) `aws-session-token`; with the
//! environment provider these are the usual `AWS_*` variables.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::S3SourceConfig;
use crate::secrets::SecretProvider;

type HmacSha256 = Hmac<Sha256>;

/// Keys requested per `ListObjectsV2` page.
pub const LIST_PAGE_SIZE: u32 = 1000;

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub async fn from_secrets(secrets: &dyn SecretProvider) -> Result<Self> {
        let access_key_id = secrets
            .get_secret("aws-access-key-id")
            .await
            .context("AWS access key id is not available")?;
        let secret_access_key = secrets
            .get_secret("aws-secret-access-key")
            .await
            .context("AWS secret access key is not available")?;
        let session_token = secrets.get_secret("aws-session-token").await.ok();
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// One object from a `ListObjectsV2` page.
#[derive(Debug, Clone, PartialEq)]
pub struct S3Object {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    /// Entity tag without the surrounding quotes.
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<S3Object>,
    /// Continuation token of the next page, `None` on the last page.
    pub next_token: Option<String>,
}

#[derive(Clone)]
pub struct S3Client {
    http: reqwest::Client,
    bucket: String,
    region: String,
    scheme: String,
    host: String,
    path_style: bool,
    creds: AwsCredentials,
}

impl S3Client {
    pub fn new(config: &S3SourceConfig, creds: AwsCredentials) -> Result<Self> {
        let (scheme, host, path_style) = match &config.endpoint_url {
            Some(endpoint) => {
                let (scheme, rest) = endpoint
                    .split_once("://")
                    .ok_or_else(|| anyhow!("endpoint_url '{}' has no scheme", endpoint))?;
                (
                    scheme.to_ascii_lowercase(),
                    rest.trim_end_matches('/').to_string(),
                    true,
                )
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
                false,
            ),
        };
        Ok(Self {
            http: reqwest::Client::new(),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            scheme,
            host,
            path_style,
            creds,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Fetch one `ListObjectsV2` page. Folder placeholder keys (ending in
    /// `/`) are dropped.
    pub async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("max-keys".to_string(), LIST_PAGE_SIZE.to_string()),
        ];
        if !prefix.is_empty() {
            query.push(("prefix".to_string(), prefix.to_string()));
        }
        if let Some(token) = token {
            query.push(("continuation-token".to_string(), token.to_string()));
        }

        let resp = self
            .signed(reqwest::Method::GET, None, &query, b"")
            .send()
            .await
            .with_context(|| format!("failed to list s3://{}/{}", self.bucket, prefix))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 ListObjectsV2 failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }
        let body = resp.text().await?;
        Ok(parse_list_objects_response(&body))
    }

    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .signed(reqwest::Method::GET, Some(key), &[], b"")
            .send()
            .await
            .with_context(|| format!("failed to get s3://{}/{}", self.bucket, key))?;
        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Upload `body` under `key`, replacing any existing object.
    pub async fn put_object(&self, key: &str, body: &[u8]) -> Result<()> {
        let resp = self
            .signed(reqwest::Method::PUT, Some(key), &[], body)
            .body(body.to_vec())
            .send()
            .await
            .with_context(|| format!("failed to put s3://{}/{}", self.bucket, key))?;
        if !resp.status().is_success() {
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }
        Ok(())
    }

    fn canonical_uri(&self, key: Option<&str>) -> String {
        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        match (self.path_style, key) {
            (true, Some(_)) => format!("/{}/{}", self.bucket, encoded_key),
            (true, None) => format!("/{}", self.bucket),
            (false, _) => format!("/{}", encoded_key),
        }
    }

    fn signed(
        &self,
        method: reqwest::Method,
        key: Option<&str>,
        query: &[(String, String)],
        payload: &[u8],
    ) -> reqwest::RequestBuilder {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_uri = self.canonical_uri(key);
        let canonical_querystring = canonical_query(query);
        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme, self.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut builder = self
            .http
            .request(method, url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        builder
    }
}

fn canonical_query(params: &[(String, String)]) -> String {
    let mut sorted = params.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
pub(crate) fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn parse_list_objects_response(xml: &str) -> ListPage {
    let truncated = xml_value(xml, "IsTruncated").as_deref() == Some("true");
    let next_token = if truncated {
        xml_value(xml, "NextContinuationToken")
    } else {
        None
    };

    let mut objects = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = xml_value(block, "Key").map(|k| xml_unescape(&k)).unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let last_modified = xml_value(block, "LastModified")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default();
        let etag = xml_value(block, "ETag")
            .map(|e| xml_unescape(&e).trim_matches('"').to_string())
            .unwrap_or_default();
        let size = xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        objects.push(S3Object {
            key,
            last_modified,
            etag,
            size,
        });
    }

    ListPage {
        objects,
        next_token,
    }
}

fn xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
