//! Schema of the SQLite index. Every statement is idempotent, so `init`
//! can be re-run against an existing database.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            source_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            last_modified INTEGER NOT NULL,
            content_hash TEXT,
            rules_hash TEXT,
            indexed_at INTEGER NOT NULL,
            UNIQUE(scope, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before the rule chain was fingerprinted.
    let has_rules_hash: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('documents') WHERE name = 'rules_hash'",
    )
    .fetch_one(pool)
    .await?;
    if !has_rules_hash {
        sqlx::query("ALTER TABLE documents ADD COLUMN rules_hash TEXT")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 has no IF NOT EXISTS for virtual tables on older SQLite builds.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_scope ON documents(scope)")
        .execute(pool)
        .await?;

    Ok(())
}
