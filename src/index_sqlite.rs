//! SQLite-backed [`SearchIndex`].
//!
//! One row per document in `documents`, keyed by the derived index id
//! and tagged with its scope. The extracted text is also chunked on
//! paragraph boundaries into `chunks` and mirrored into the `chunks_fts`
//! FTS5 table so the database can be queried with `MATCH`.
//!
//! An upsert rewrites the document row and all of its chunks in one
//! transaction; a delete removes all three in one transaction.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsync_core::models::{DocumentFingerprint, IndexedDocument};
use docsync_core::store::SearchIndex;
use sqlx::{Row, SqlitePool};

use crate::chunk::chunk_text;
use crate::{db, migrate};

pub struct SqliteIndex {
    pool: SqlitePool,
    max_tokens: usize,
}

/// Document and chunk counts of one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeStats {
    pub scope: String,
    pub documents: i64,
    pub chunks: i64,
    pub last_indexed: Option<DateTime<Utc>>,
}

impl SqliteIndex {
    /// Open the database and make sure the schema exists.
    pub async fn open(path: &Path, max_tokens: usize) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("failed to initialize index schema")?;
        Ok(Self { pool, max_tokens })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn scope_stats(&self) -> Result<Vec<ScopeStats>> {
        let rows = sqlx::query(
            r#"
            SELECT
                d.scope AS scope,
                COUNT(DISTINCT d.id) AS doc_count,
                COUNT(c.id) AS chunk_count,
                MAX(d.indexed_at) AS last_indexed
            FROM documents d
            LEFT JOIN chunks c ON c.document_id = d.id
            GROUP BY d.scope
            ORDER BY d.scope
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ScopeStats {
                scope: row.get("scope"),
                documents: row.get("doc_count"),
                chunks: row.get("chunk_count"),
                last_indexed: row
                    .get::<Option<i64>, _>("last_indexed")
                    .and_then(DateTime::from_timestamp_millis),
            })
            .collect())
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn upsert(&self, doc: &IndexedDocument) -> Result<()> {
        let metadata = serde_json::to_string(&doc.metadata)?;
        let chunks = chunk_text(&doc.id, &doc.content, self.max_tokens);
        let now = Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, scope, source_id, title, content, metadata_json, last_modified, content_hash, rules_hash, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                scope = excluded.scope,
                source_id = excluded.source_id,
                title = excluded.title,
                content = excluded.content,
                metadata_json = excluded.metadata_json,
                last_modified = excluded.last_modified,
                content_hash = excluded.content_hash,
                rules_hash = excluded.rules_hash,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.scope)
        .bind(&doc.source_id)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&metadata)
        .bind(doc.last_modified.timestamp_millis())
        .bind(&doc.content_hash)
        .bind(&doc.rules_hash)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to write document {}", doc.id))?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fingerprint(&self, id: &str) -> Result<Option<DocumentFingerprint>> {
        let row = sqlx::query(
            "SELECT last_modified, content_hash, rules_hash FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| DocumentFingerprint {
            last_modified: from_millis(r.get("last_modified")),
            content_hash: r.get("content_hash"),
            rules_hash: r.get("rules_hash"),
        }))
    }

    async fn list_ids(&self, scope: &str) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM documents WHERE scope = ?")
            .bind(scope)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<IndexedDocument>> {
        let row = sqlx::query(
            "SELECT id, scope, source_id, title, content, metadata_json, last_modified, content_hash, rules_hash FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let metadata_json: String = row.get("metadata_json");
        Ok(Some(IndexedDocument {
            id: row.get("id"),
            scope: row.get("scope"),
            source_id: row.get("source_id"),
            title: row.get("title"),
            content: row.get("content"),
            metadata: serde_json::from_str(&metadata_json)
                .with_context(|| format!("corrupt metadata for document {}", id))?,
            last_modified: from_millis(row.get("last_modified")),
            content_hash: row.get("content_hash"),
            rules_hash: row.get("rules_hash"),
        }))
    }
}
