//! Idempotent schema migrations (`cw init`).
//!
//! | Table | Contents |
//! |-------|----------|
//! | `chunks` | One row per chunk, keyed by chunk ID, with `embedding_pending` |
//! | `chunks_fts` | FTS5 keyword index over enriched chunk text |
//! | `chunk_vectors` | Little-endian f32 BLOB vectors with the model that produced them |
//! | `tree_digests` | One serialized `TreeDigest` per indexed root |
//! | `index_runs` | History of indexing passes, for `cw status` |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index that does not exist yet.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            root TEXT NOT NULL,
            file_path TEXT NOT NULL,
            start_byte INTEGER NOT NULL,
            end_byte INTEGER NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            kind TEXT NOT NULL,
            language TEXT,
            symbol TEXT,
            signature TEXT,
            scope TEXT,
            heading TEXT,
            part INTEGER NOT NULL DEFAULT 0,
            text TEXT NOT NULL,
            enriched_text TEXT NOT NULL,
            parent_summary TEXT NOT NULL DEFAULT '',
            content_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            embedding_pending INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tree_digests (
            root TEXT PRIMARY KEY,
            digest_json TEXT NOT NULL,
            root_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            files_scanned INTEGER NOT NULL,
            added INTEGER NOT NULL,
            modified INTEGER NOT NULL,
            removed INTEGER NOT NULL,
            chunks_written INTEGER NOT NULL,
            chunks_deleted INTEGER NOT NULL,
            embeddings_pending INTEGER NOT NULL,
            failed_files INTEGER NOT NULL,
            degraded INTEGER NOT NULL,
            full_rescan INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
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
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(root, file_path)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_pending ON chunks(embedding_pending) WHERE embedding_pending = 1",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_runs_root ON index_runs(root, finished_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
