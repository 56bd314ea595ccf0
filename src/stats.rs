//! Index statistics.
//!
//! Used by `docsync stats` to show what is indexed per scope. The SQLite
//! backend reports document and chunk counts for every scope in the
//! database; the Azure backend reports the document count of the
//! configured scope.

use anyhow::Result;

use crate::backend::open_index;
use crate::config::{Config, IndexBackend};
use crate::index_sqlite::SqliteIndex;
use crate::progress::format_number;
use crate::secrets::SecretProvider;

pub async fn run_stats(config: &Config, secrets: &dyn SecretProvider) -> Result<()> {
    match config.index.backend {
        IndexBackend::Sqlite => sqlite_stats(config).await,
        IndexBackend::Azure => {
            let index = open_index(config, secrets).await?;
            let scope = config.source.scope();
            let ids = index.list_ids(&scope).await?;
            println!("docsync index stats");
            println!("===================");
            println!();
            println!("  Backend:     azure");
            println!("  Index:       {}", config.index.name);
            println!("  Scope:       {}", scope);
            println!("  Documents:   {}", format_number(ids.len() as u64));
            println!();
            Ok(())
        }
    }
}

async fn sqlite_stats(config: &Config) -> Result<()> {
    let path = &config.index.path;
    let index = SqliteIndex::open(path, config.chunking.max_tokens).await?;
    let scopes = index.scope_stats().await?;
    let db_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let total_docs: i64 = scopes.iter().map(|s| s.documents).sum();
    let total_chunks: i64 = scopes.iter().map(|s| s.chunks).sum();

    println!("docsync index stats");
    println!("===================");
    println!();
    println!("  Database:    {}", path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Chunks:      {}", total_chunks);

    if !scopes.is_empty() {
        println!();
        println!("  By scope:");
        println!(
            "  {:<32} {:>8} {:>8}   {}",
            "SCOPE", "DOCS", "CHUNKS", "LAST INDEXED"
        );
        println!("  {}", "-".repeat(72));
        for s in &scopes {
            let last = s
                .last_indexed
                .map(|t| format_ts_relative(t.timestamp()))
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  {:<32} {:>8} {:>8}   {}",
                s.scope, s.documents, s.chunks, last
            );
        }
    }
    println!();

    index.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }
}
