//! Configuration loading.
//!
//! The configuration is read once at process start from a TOML file,
//! overlaid with environment overrides, validated, and then passed by
//! reference into every component. Nothing downstream reads the
//! environment on its own.
//!
//! # Example
//!
//! ```toml
//! [index]
//! backend = "sqlite"
//! path = "./data/docsync.sqlite"
//!
//! [source]
//! kind = "sharepoint"
//! name = "policies"
//! allowed_formats = ["pdf", "docx"]
//!
//! [source.sharepoint]
//! tenant_id = "00000000-0000-0000-0000-000000000000"
//! client_id = "11111111-1111-1111-1111-111111111111"
//! site_domain = "contoso.sharepoint.com"
//! site_name = "Policies"
//!
//! [sync]
//! concurrency = 10
//!
//! [[transform.pdf]]
//! operation = "max_pages"
//! parameters = { num_max_pages = 20 }
//! ```

use std::path::{Path, PathBuf};

use docsync_core::rules::{TransformConfig, OP_MAX_PAGES, OP_MOVE};
use serde::Deserialize;

use crate::error::SyncError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub relocation: RelocationConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
}

// ============ Index ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Sqlite,
    Azure,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub backend: IndexBackend,
    /// SQLite database file (sqlite backend).
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Index name (azure backend).
    #[serde(default = "default_index_name")]
    pub name: String,
    /// Search service endpoint, e.g. `https://svc.search.windows.net` (azure backend).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Secret holding the admin api-key (azure backend).
    #[serde(default = "default_api_key_secret")]
    pub api_key_secret: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Payloads above this size are rejected before reaching the index.
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/docsync.sqlite")
}
fn default_index_name() -> String {
    "ragindex".to_string()
}
fn default_api_key_secret() -> String {
    "searchApiKey".to_string()
}
fn default_api_version() -> String {
    "2024-07-01".to_string()
}
fn default_max_content_bytes() -> usize {
    16 * 1024 * 1024
}

// ============ Source ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Filesystem,
    S3,
    Sharepoint,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Filesystem => "filesystem",
            SourceKind::S3 => "s3",
            SourceKind::Sharepoint => "sharepoint",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Connector enable flag; a disabled source makes `sync` a no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Instance name, combined with the kind into the scope label.
    #[serde(default = "default_source_name")]
    pub name: String,
    /// Extensions to include (without dot). Empty allows every extension.
    #[serde(default)]
    pub allowed_formats: Vec<String>,
    #[serde(default)]
    pub filesystem: Option<FilesystemSourceConfig>,
    #[serde(default)]
    pub s3: Option<S3SourceConfig>,
    #[serde(default)]
    pub sharepoint: Option<SharePointSourceConfig>,
}

impl SourceConfig {
    /// Scope label that attributes index entries to this source.
    pub fn scope(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.name)
    }
}

fn default_true() -> bool {
    true
}
fn default_source_name() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3SourceConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SharePointSourceConfig {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_client_secret_name")]
    pub client_secret_name: String,
    #[serde(default)]
    pub site_domain: String,
    #[serde(default)]
    pub site_name: String,
    /// Document library id; the site's default drive when unset.
    #[serde(default)]
    pub drive_id: Option<String>,
    /// Folders under the drive root to traverse. Empty means the root.
    #[serde(default)]
    pub subfolders: Vec<String>,
    /// Sub-folders whose name does not match are not descended into.
    #[serde(default = "default_folder_regex")]
    pub folder_regex: String,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    #[serde(default = "default_login_base_url")]
    pub login_base_url: String,
}

fn default_client_secret_name() -> String {
    "sharepointClientSecret".to_string()
}
fn default_folder_regex() -> String {
    ".*".to_string()
}
fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_login_base_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

// ============ Sync ============

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    /// Maximum documents transformed and upserted at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Log a progress line every N processed documents.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
    /// Re-process documents even when the index holds the same version.
    #[serde(default)]
    pub full: bool,
    /// Write the JSON summary of every run to this file.
    #[serde(default)]
    pub summary_path: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            progress_interval: default_progress_interval(),
            full: false,
            summary_path: None,
        }
    }
}

fn default_concurrency() -> usize {
    10
}
fn default_progress_interval() -> u64 {
    20
}

// ============ Relocation ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelocationKind {
    #[default]
    None,
    Local,
    S3,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelocationConfig {
    #[serde(default)]
    pub destination: RelocationKind,
    /// Target directory (local destination).
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub s3: Option<S3SourceConfig>,
}

// ============ Secrets ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretsProviderKind {
    #[default]
    Env,
    Dir,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecretsConfig {
    #[serde(default)]
    pub provider: SecretsProviderKind,
    /// Directory holding one file per secret (dir provider).
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// ============ Logging / chunking ============

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_tokens: 700 }
    }
}

// ============ Loading ============

/// Read, override from the process environment, and validate.
pub fn load_config(path: &Path) -> Result<Config, SyncError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SyncError::config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config, SyncError> {
    toml::from_str(content).map_err(|e| SyncError::config(format!("failed to parse config: {}", e)))
}

/// Overlay environment-style settings on a parsed configuration.
pub fn apply_env_overrides<F>(config: &mut Config, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = var("DOCSYNC_SOURCE_ENABLED").or_else(|| var("SHAREPOINT_CONNECTOR_ENABLED"))
    {
        config.source.enabled = v.trim().eq_ignore_ascii_case("true");
    }
    if let Some(v) = var("DOCSYNC_INDEX_NAME") {
        config.index.name = v;
    }
    if let Some(v) = var("DOCSYNC_ALLOWED_FORMATS").or_else(|| var("SHAREPOINT_FILES_FORMAT")) {
        config.source.allowed_formats = split_list(&v);
    }
    if let Some(v) = var("DOCSYNC_LOG_LEVEL") {
        config.logging.level = v;
    }

    if config.source.kind == SourceKind::Sharepoint {
        let sp = config.source.sharepoint.get_or_insert_with(Default::default);
        if let Some(v) = var("SHAREPOINT_TENANT_ID") {
            sp.tenant_id = v;
        }
        if let Some(v) = var("SHAREPOINT_CLIENT_ID") {
            sp.client_id = v;
        }
        if let Some(v) = var("SHAREPOINT_CLIENT_SECRET_NAME") {
            sp.client_secret_name = v;
        }
        if let Some(v) = var("SHAREPOINT_SITE_DOMAIN") {
            sp.site_domain = v;
        }
        if let Some(v) = var("SHAREPOINT_SITE_NAME") {
            sp.site_name = v;
        }
        if let Some(v) = var("SHAREPOINT_DRIVE_ID") {
            sp.drive_id = Some(v);
        }
        if let Some(v) = var("SHAREPOINT_SUBFOLDERS_NAMES") {
            sp.subfolders = split_list(&v);
        }
        if let Some(v) = var("SHAREPOINT_SUBFOLDERS_REGEX") {
            sp.folder_regex = v.trim().to_string();
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn validate(config: &Config) -> Result<(), SyncError> {
    if config.sync.concurrency == 0 {
        return Err(SyncError::config("sync.concurrency must be > 0"));
    }
    if config.sync.progress_interval == 0 {
        return Err(SyncError::config("sync.progress_interval must be > 0"));
    }
    if config.chunking.max_tokens == 0 {
        return Err(SyncError::config("chunking.max_tokens must be > 0"));
    }
    if config.source.name.trim().is_empty() {
        return Err(SyncError::config("source.name must not be empty"));
    }

    if config.index.backend == IndexBackend::Azure && config.index.endpoint.is_none() {
        return Err(SyncError::config(
            "index.endpoint is required for the azure backend",
        ));
    }

    match config.source.kind {
        SourceKind::Filesystem => {
            if config.source.filesystem.is_none() {
                return Err(SyncError::config(
                    "[source.filesystem] is required when source.kind = \"filesystem\"",
                ));
            }
        }
        SourceKind::S3 => match &config.source.s3 {
            Some(s3) if !s3.bucket.trim().is_empty() => {}
            _ => {
                return Err(SyncError::config(
                    "source.s3.bucket is required when source.kind = \"s3\"",
                ))
            }
        },
        SourceKind::Sharepoint => {
            let sp = config.source.sharepoint.clone().unwrap_or_default();
            let missing: Vec<&str> = [
                ("tenant_id", &sp.tenant_id),
                ("client_id", &sp.client_id),
                ("site_domain", &sp.site_domain),
                ("site_name", &sp.site_name),
            ]
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| *k)
            .collect();
            if !missing.is_empty() {
                return Err(SyncError::config(format!(
                    "missing SharePoint settings: {}",
                    missing.join(", ")
                )));
            }
            if let Err(e) = regex::Regex::new(&sp.folder_regex) {
                return Err(SyncError::config(format!(
                    "invalid source.sharepoint.folder_regex: {}",
                    e
                )));
            }
        }
    }

    match config.relocation.destination {
        RelocationKind::None => {}
        RelocationKind::Local => {
            if config.relocation.path.is_none() {
                return Err(SyncError::config(
                    "relocation.path is required for the local destination",
                ));
            }
        }
        RelocationKind::S3 => {
            if config.relocation.s3.is_none() {
                return Err(SyncError::config(
                    "[relocation.s3] is required for the s3 destination",
                ));
            }
        }
    }

    if config.secrets.provider == SecretsProviderKind::Dir && config.secrets.dir.is_none() {
        return Err(SyncError::config("secrets.dir is required for the dir provider"));
    }

    for (key, rule) in config.transform.all_rules() {
        match rule.operation.as_str() {
            OP_MAX_PAGES => {
                if rule.param(MAX_PAGES_PARAM).is_some()
                    && !matches!(rule.param_u64(MAX_PAGES_PARAM), Some(n) if n > 0)
                {
                    return Err(SyncError::config(format!(
                        "transform.{}: max_pages.num_max_pages must be a positive integer",
                        key
                    )));
                }
            }
            OP_MOVE => {
                if rule.param("output_format").is_some() && rule.param_str("output_format").is_none()
                {
                    return Err(SyncError::config(format!(
                        "transform.{}: move.output_format must be a string",
                        key
                    )));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

const MAX_PAGES_PARAM: &str = "num_max_pages";
