//! Secret lookup.
//!
//! Credentials (Graph client secret, AWS keys, search api-key) are only
//! ever obtained through [`SecretProvider::get_secret`]. Two providers:
//!
//! | Provider | Lookup of `sharepointClientSecret` |
//! |----------|-----------------------------------|
//! | `env` | `$SHAREPOINTCLIENTSECRET` (upper-cased, `-` → `_`) |
//! | `dir` | contents of `<dir>/sharepointClientSecret`, trimmed |

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::{SecretsConfig, SecretsProviderKind};

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String>;
}

/// Reads secrets from process environment variables.
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    pub fn var_name(name: &str) -> String {
        name.to_ascii_uppercase().replace('-', "_")
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<String> {
        let var = Self::var_name(name);
        match std::env::var(&var) {
            Ok(v) if !v.is_empty() => Ok(v),
            _ => bail!("secret '{}' not found (environment variable {})", name, var),
        }
    }
}

/// Reads secrets from files in a directory, one file per secret (the
/// layout of mounted key-vault or Kubernetes secrets).
pub struct DirSecretProvider {
    dir: PathBuf,
}

impl DirSecretProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretProvider for DirSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<String> {
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            bail!("invalid secret name '{}'", name);
        }
        let path = self.dir.join(name);
        let value = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("secret '{}' not found at {}", name, path.display()))?;
        let value = value.trim().to_string();
        if value.is_empty() {
            bail!("secret '{}' is empty", name);
        }
        Ok(value)
    }
}

pub fn build_secret_provider(config: &SecretsConfig) -> Box<dyn SecretProvider> {
    match (config.provider, &config.dir) {
        (SecretsProviderKind::Dir, Some(dir)) => Box::new(DirSecretProvider::new(dir.clone())),
        _ => Box::new(EnvSecretProvider),
    }
}
