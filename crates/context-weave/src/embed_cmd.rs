use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use context_weave_core::models::Chunk;
use context_weave_core::store::IndexMetadata;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::indexer::Indexer;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbedPendingReport {
    pub pending: usize,
    pub embedded: usize,
    pub failed: usize,
    /// Chunks re-chunked or deleted between listing and writing.
    pub stale: usize,
}

/// Embed chunks that were written keyword-only.
///
/// Each vector is written under the file's write gate and only if the
/// stored chunk still has the content that was embedded.
pub async fn embed_pending(indexer: &Indexer, limit: usize) -> Result<EmbedPendingReport> {
    let embedder = indexer.embedder();
    if !embedder.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let store = indexer.store();
    let pending = store.pending_embeddings(limit).await?;
    let mut report = EmbedPendingReport {
        pending: pending.len(),
        ..Default::default()
    };

    for batch in pending.chunks(indexer.batch_size()) {
        let texts: Vec<String> = batch.iter().map(|c| c.enriched_text.clone()).collect();
        let vectors = match embedder.embed(&texts).await {
            Ok(v) if v.len() == batch.len() => v,
            Ok(v) => {
                warn!(got = v.len(), expected = batch.len(), "embedding count mismatch");
                report.failed += batch.len();
                continue;
            }
            Err(e) => {
                warn!(error = %e, "embedding batch failed");
                report.failed += batch.len();
                continue;
            }
        };
        for (chunk, vector) in batch.iter().zip(vectors) {
            if write_vector(indexer, chunk, &vector).await? {
                report.embedded += 1;
            } else {
                report.stale += 1;
            }
        }
    }
    Ok(report)
}

async fn write_vector(indexer: &Indexer, chunk: &Chunk, vector: &[f32]) -> Result<bool> {
    let gate = indexer.gates().gate(&chunk.source_id, &chunk.file_path);
    let _guard = gate.lock().await;
    let store = indexer.store();
    match store.get_chunk(&chunk.id).await? {
        Some(current) if current.content_hash == chunk.content_hash => {
            let mut metadata = IndexMetadata::for_chunk(chunk);
            metadata.model = Some(indexer.embedder().model_name().to_string());
            store.upsert_vector(&chunk.id, vector, &metadata).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// `cw embed pending`.
pub async fn run_embed_pending(config: &Config, limit: usize, dry_run: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = SqliteStore::new(pool.clone());

    if dry_run {
        let stats = context_weave_core::store::ChunkStore::stats(&store).await?;
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", stats.pending_embeddings);
        pool.close().await;
        return Ok(());
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let indexer = Indexer::new(Arc::new(store), provider, config);
    let report = embed_pending(&indexer, limit).await?;

    println!("embed pending");
    if report.pending == 0 {
        println!("  all chunks up to date");
    } else {
        println!("  total pending: {}", report.pending);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.failed);
        if report.stale > 0 {
            println!("  skipped (changed since listing): {}", report.stale);
        }
    }

    pool.close().await;
    Ok(())
}
