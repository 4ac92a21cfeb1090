//! SQLite-backed [`ChunkStore`] implementation.
//!
//! Maps the core storage traits onto the schema created by
//! [`migrate`](crate::migrate): keyword search runs through FTS5 over the
//! enriched chunk text, vector search is a brute-force cosine scan over
//! `chunk_vectors`, and a file's chunk replacement (stale rows, FTS rows,
//! vectors, new rows) is one transaction.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

use context_weave_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use context_weave_core::models::{Chunk, ChunkKind, ChunkRange};
use context_weave_core::store::{
    ChunkStore, ChunkWrite, IndexMetadata, KeywordIndex, ScoredId, StoreStats, VectorIndex,
    WriteStats,
};
use context_weave_core::text::tokenize;

use crate::indexer::IndexRunReport;

const CHUNK_COLUMNS: &str = "id, root, file_path, start_byte, end_byte, start_line, end_line, \
    kind, language, symbol, signature, scope, heading, part, text, enriched_text, \
    parent_summary, content_hash, updated_at";

/// Max bound parameters per `IN (...)` query.
const ID_BATCH: usize = 500;

/// SQLite implementation of the core storage traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

/// The most recent recorded indexing pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LastRun {
    pub root: String,
    pub finished_at: DateTime<Utc>,
    pub degraded: bool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append a finished pass to `index_runs`.
    pub async fn record_run(&self, report: &IndexRunReport, started_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_runs (root, started_at, finished_at, files_scanned, added, modified,
                                    removed, chunks_written, chunks_deleted, embeddings_pending,
                                    failed_files, degraded, full_rescan)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.root)
        .bind(started_at.timestamp())
        .bind(Utc::now().timestamp())
        .bind(report.files_scanned as i64)
        .bind(report.added as i64)
        .bind(report.modified as i64)
        .bind(report.removed as i64)
        .bind(report.chunks_written as i64)
        .bind(report.chunks_deleted as i64)
        .bind(report.embeddings_pending as i64)
        .bind(report.failed_files.len() as i64)
        .bind(report.degraded)
        .bind(report.full_rescan)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_run(&self) -> Result<Option<LastRun>> {
        let row = sqlx::query(
            "SELECT root, finished_at, degraded FROM index_runs ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| LastRun {
            root: r.get("root"),
            finished_at: from_ts(r.get("finished_at")),
            degraded: r.get("degraded"),
        }))
    }

    async fn delete_ids(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        ids: &[String],
    ) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let kind: String = row.get("kind");
    let kind = ChunkKind::parse(&kind).ok_or_else(|| anyhow!("unknown chunk kind '{}'", kind))?;
    let start_byte: i64 = row.get("start_byte");
    let end_byte: i64 = row.get("end_byte");
    let start_line: i64 = row.get("start_line");
    let end_line: i64 = row.get("end_line");
    let part: i64 = row.get("part");
    Ok(Chunk {
        id: row.get("id"),
        source_id: row.get("root"),
        file_path: row.get("file_path"),
        range: ChunkRange {
            start_byte: start_byte as usize,
            end_byte: end_byte as usize,
            start_line: start_line as usize,
            end_line: end_line as usize,
        },
        kind,
        language: row.get("language"),
        symbol: row.get("symbol"),
        signature: row.get("signature"),
        scope: row.get("scope"),
        heading: row.get("heading"),
        part: part as u32,
        text: row.get("text"),
        enriched_text: row.get("enriched_text"),
        parent_summary: row.get("parent_summary"),
        content_hash: row.get("content_hash"),
        updated_at: from_ts(row.get("updated_at")),
    })
}

/// FTS5 expression matching any query token. Tokens are quoted so user
/// input never reaches the FTS5 query grammar.
fn fts_query(query: &str) -> Option<String> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[async_trait]
impl KeywordIndex for SqliteStore {
    async fn upsert_text(&self, id: &str, text: &str, _metadata: &IndexMetadata) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, text) VALUES (?, ?)")
            .bind(id)
            .bind(text)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        let Some(expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                // FTS5 rank is negated bm25: lower is better.
                ScoredId::new(row.get::<String, _>("chunk_id"), -rank)
            })
            .collect())
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn upsert_vector(
        &self,
        id: &str,
        vector: &[f32],
        metadata: &IndexMetadata,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, model, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(id)
        .bind(metadata.model.as_deref().unwrap_or("unknown"))
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE chunks SET embedding_pending = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn vector_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<ScoredId> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(vector, &blob_to_vec(&blob)) as f64;
                ScoredId::new(row.get::<String, _>("chunk_id"), similarity)
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(k);
        Ok(scored)
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn replace_file_chunks(
        &self,
        root: &str,
        file_path: &str,
        writes: &[ChunkWrite],
        model: Option<&str>,
    ) -> Result<WriteStats> {
        let mut tx = self.pool.begin().await?;
        let mut stats = WriteStats::default();

        let existing: HashMap<String, (String, String)> = sqlx::query(
            "SELECT id, content_hash, enriched_text FROM chunks WHERE root = ? AND file_path = ?",
        )
        .bind(root)
        .bind(file_path)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| (r.get("id"), (r.get("content_hash"), r.get("enriched_text"))))
        .collect();

        let stale: Vec<String> = existing
            .keys()
            .filter(|id| !writes.iter().any(|w| &w.chunk.id == *id))
            .cloned()
            .collect();
        Self::delete_ids(&mut tx, &stale).await?;
        stats.deleted = stale.len();

        let now = Utc::now().timestamp();
        for w in writes {
            let c = &w.chunk;
            if let Some((hash, enriched)) = existing.get(&c.id) {
                if *hash == c.content_hash && *enriched == c.enriched_text {
                    stats.unchanged += 1;
                    continue;
                }
            }

            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(&c.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, root, file_path, start_byte, end_byte, start_line, end_line,
                                    kind, language, symbol, signature, scope, heading, part, text,
                                    enriched_text, parent_summary, content_hash, updated_at,
                                    embedding_pending)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    language = excluded.language,
                    symbol = excluded.symbol,
                    signature = excluded.signature,
                    scope = excluded.scope,
                    heading = excluded.heading,
                    part = excluded.part,
                    text = excluded.text,
                    enriched_text = excluded.enriched_text,
                    parent_summary = excluded.parent_summary,
                    content_hash = excluded.content_hash,
                    updated_at = excluded.updated_at,
                    embedding_pending = excluded.embedding_pending
                "#,
            )
            .bind(&c.id)
            .bind(root)
            .bind(file_path)
            .bind(c.range.start_byte as i64)
            .bind(c.range.end_byte as i64)
            .bind(c.range.start_line as i64)
            .bind(c.range.end_line as i64)
            .bind(c.kind.as_str())
            .bind(&c.language)
            .bind(&c.symbol)
            .bind(&c.signature)
            .bind(&c.scope)
            .bind(&c.heading)
            .bind(c.part as i64)
            .bind(&c.text)
            .bind(&c.enriched_text)
            .bind(&c.parent_summary)
            .bind(&c.content_hash)
            .bind(c.updated_at.timestamp())
            .bind(w.vector.is_none() && w.embedding_pending)
            .execute(&mut *tx)
            .await?;
            sqlx::query("INSERT INTO chunks_fts (chunk_id, text) VALUES (?, ?)")
                .bind(&c.id)
                .bind(&c.enriched_text)
                .execute(&mut *tx)
                .await?;

            match &w.vector {
                Some(vector) => {
                    sqlx::query(
                        r#"
                        INSERT INTO chunk_vectors (chunk_id, model, dims, embedding, created_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(chunk_id) DO UPDATE SET
                            model = excluded.model,
                            dims = excluded.dims,
                            embedding = excluded.embedding,
                            created_at = excluded.created_at
                        "#,
                    )
                    .bind(&c.id)
                    .bind(model.unwrap_or("unknown"))
                    .bind(vector.len() as i64)
                    .bind(vec_to_blob(vector))
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    stats.vectors += 1;
                }
                None => {
                    sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                        .bind(&c.id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            stats.inserted += 1;
        }

        tx.commit().await?;
        Ok(stats)
    }

    async fn delete_file_chunks(&self, root: &str, file_path: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE root = ? AND file_path = ?")
                .bind(root)
                .bind(file_path)
                .fetch_all(&mut *tx)
                .await?;
        Self::delete_ids(&mut tx, &ids).await?;
        tx.commit().await?;
        Ok(ids.len())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let sql = format!("SELECT {} FROM chunks WHERE id = ?", CHUNK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let mut found: HashMap<String, Chunk> = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(ID_BATCH) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {} FROM chunks WHERE id IN (", CHUNK_COLUMNS));
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(id.as_str());
            }
            sep.push_unseparated(")");
            for row in qb.build().fetch_all(&self.pool).await? {
                let chunk = row_to_chunk(&row)?;
                found.insert(chunk.id.clone(), chunk);
            }
        }
        // Preserve the caller's order.
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn file_chunk_ids(&self, root: &str, file_path: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE root = ? AND file_path = ? ORDER BY id",
        )
        .bind(root)
        .bind(file_path)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn indexed_files(&self, root: &str) -> Result<Vec<String>> {
        let files = sqlx::query_scalar(
            "SELECT DISTINCT file_path FROM chunks WHERE root = ? ORDER BY file_path",
        )
        .bind(root)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    async fn load_digest(&self, root: &str) -> Result<Option<String>> {
        let json = sqlx::query_scalar("SELECT digest_json FROM tree_digests WHERE root = ?")
            .bind(root)
            .fetch_optional(&self.pool)
            .await?;
        Ok(json)
    }

    async fn save_digest(&self, root: &str, digest_json: &str, root_hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tree_digests (root, digest_json, root_hash, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(root) DO UPDATE SET
                digest_json = excluded.digest_json,
                root_hash = excluded.root_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(root)
        .bind(digest_json)
        .bind(root_hash)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE embedding_pending = 1 ORDER BY id LIMIT ?",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn stats(&self) -> Result<StoreStats> {
        let files: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM (SELECT DISTINCT root, file_path FROM chunks)")
                .fetch_one(&self.pool)
                .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding_pending = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(StoreStats {
            files: files as usize,
            chunks: chunks as usize,
            vectors: vectors as usize,
            pending_embeddings: pending as usize,
        })
    }
}
