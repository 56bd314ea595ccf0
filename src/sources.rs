//! `docsync sources` and `docsync rules`: inspect the configuration
//! without running a sync.

use anyhow::Result;
use futures::StreamExt;

use crate::config::{Config, RelocationKind};
use crate::lister::build_lister;
use crate::secrets::SecretProvider;
use crate::transform::OperationRegistry;
use docsync_core::rules::TransformRuleEngine;

/// Health of the configured source, checked by pulling the first listed
/// document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceHealth {
    Disabled,
    Ok,
    Empty,
    Unhealthy(String),
}

impl SourceHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, SourceHealth::Ok | SourceHealth::Empty | SourceHealth::Disabled)
    }
}

pub async fn check_source(config: &Config, secrets: &dyn SecretProvider) -> SourceHealth {
    if !config.source.enabled {
        return SourceHealth::Disabled;
    }
    let lister = match build_lister(config, secrets).await {
        Ok(l) => l,
        Err(e) => return SourceHealth::Unhealthy(e.to_string()),
    };
    let first = lister.list().next().await;
    match first {
        Some(Ok(_)) => SourceHealth::Ok,
        None => SourceHealth::Empty,
        Some(Err(e)) => SourceHealth::Unhealthy(format!("{:#}", e)),
    }
}

pub async fn list_sources(config: &Config, secrets: &dyn SecretProvider) -> Result<bool> {
    let health = check_source(config, secrets).await;
    let status = match &health {
        SourceHealth::Disabled => "DISABLED".to_string(),
        SourceHealth::Ok => "OK".to_string(),
        SourceHealth::Empty => "OK (empty)".to_string(),
        SourceHealth::Unhealthy(e) => format!("ERROR: {}", e),
    };

    let formats = if config.source.allowed_formats.is_empty() {
        "*".to_string()
    } else {
        config.source.allowed_formats.join(",")
    };
    let relocation = match config.relocation.destination {
        RelocationKind::None => "none",
        RelocationKind::Local => "local",
        RelocationKind::S3 => "s3",
    };

    println!("{:<28} {:<10} {:<16} STATUS", "SCOPE", "INDEX", "FORMATS");
    println!(
        "{:<28} {:<10} {:<16} {}",
        config.source.scope(),
        format!("{:?}", config.index.backend).to_lowercase(),
        formats,
        status
    );
    println!();
    println!("relocation destination: {}", relocation);
    Ok(health.is_healthy())
}

/// Print the chain `sync` would apply to files with `extension`.
pub fn print_rules(config: &Config, extension: &str) {
    let engine = TransformRuleEngine::new(&config.transform);
    let registry = OperationRegistry::with_builtins();
    let key = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    let rules = engine.resolve(&key);

    let origin = if engine.extensions().any(|e| e == key) && !rules.is_empty() {
        key.as_str()
    } else if !rules.is_empty() {
        "default"
    } else {
        "none"
    };
    println!("rules for .{} (from {}):", key, origin);
    if rules.is_empty() {
        println!("  (none; content is indexed unmodified)");
        return;
    }
    for (i, rule) in rules.iter().enumerate() {
        let mut params = rule.parameters.clone();
        params.extend(rule.extra.clone());
        let marker = if registry.is_registered(&rule.operation) {
            ""
        } else {
            "  [unknown, will be skipped]"
        };
        println!(
            "  {}. {} {}{}",
            i + 1,
            rule.operation,
            serde_json::Value::Object(params),
            marker
        );
    }
}
