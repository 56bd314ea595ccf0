//! Secondary storage destinations for the `move` operation and for
//! preview side artifacts.
//!
//! A destination accepts overwrite-uploads by name. Names are relative
//! paths (`folder/report.pdf`); absolute paths and `..` components are
//! rejected.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::{RelocationConfig, RelocationKind};
use crate::s3::{AwsCredentials, S3Client};
use crate::secrets::SecretProvider;

#[async_trait]
pub trait SecondaryStorage: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Store `bytes` under `name`, replacing any previous upload.
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<()>;
}

fn validate_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    if name.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("invalid relocation target name '{}'", name);
    }
    Ok(())
}

/// Writes into a local directory tree.
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SecondaryStorage for LocalDirStorage {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_name(name)?;
        let target = self.root.join(name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("failed to write {}", target.display()))
    }
}

/// Uploads objects into an S3 bucket under an optional prefix.
pub struct S3Storage {
    client: S3Client,
    prefix: String,
}

impl S3Storage {
    pub fn new(client: S3Client, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        Self {
            client,
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("{}/", prefix)
            },
        }
    }
}

#[async_trait]
impl SecondaryStorage for S3Storage {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.client.bucket(), self.prefix)
    }

    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_name(name)?;
        let key = format!("{}{}", self.prefix, name.replace('\\', "/"));
        self.client.put_object(&key, bytes).await
    }
}

/// Build the configured destination, if any.
pub async fn build_storage(
    config: &RelocationConfig,
    secrets: &dyn SecretProvider,
) -> Result<Option<Box<dyn SecondaryStorage>>> {
    match config.destination {
        RelocationKind::None => Ok(None),
        RelocationKind::Local => {
            let path = config
                .path
                .as_ref()
                .context("relocation.path is not set")?;
            Ok(Some(Box::new(LocalDirStorage::new(path.clone()))))
        }
        RelocationKind::S3 => {
            let s3 = config.s3.as_ref().context("[relocation.s3] is not set")?;
            let creds = AwsCredentials::from_secrets(secrets).await?;
            let client = S3Client::new(s3, creds)?;
            Ok(Some(Box::new(S3Storage::new(client, &s3.prefix))))
        }
    }
}
