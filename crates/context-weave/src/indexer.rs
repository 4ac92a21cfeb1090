//! Incremental indexing pipeline.
//!
//! One pass over a root:
//!
//! ```text
//! scan ─► load previous digest ─► diff ─► chunk + enrich (worker pool)
//!      ─► embed (batched) ─► write per file (gated, transactional)
//!      ─► delete removed files ─► save + publish new digest
//! ```
//!
//! Only files whose content hash changed are re-chunked. A missing digest
//! means a first run (full scan); an undecodable or tampered digest is a
//! corruption event: the pass rebuilds against what the store actually
//! holds and is reported `degraded`. Embedding failures never fail a pass;
//! the affected chunks are written keyword-only and marked pending.
//!
//! Files that fail to read or write keep their previous digest entry (or
//! none), so the next pass sees them as changed and retries them.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use context_weave_core::chunk::Chunker;
use context_weave_core::digest::{diff, hash_content, ChangeSet, TreeDigest};
use context_weave_core::embedding::EmbeddingProvider;
use context_weave_core::enrich::{ContextEnricher, ParentDocument};
use context_weave_core::models::Chunk;
use context_weave_core::store::{ChunkStore, ChunkWrite};
use context_weave_core::EngineError;

use crate::config::{Config, RootConfig};
use crate::scan::{read_text, scan_root, ScannedRoot};

/// Outcome of one [`Indexer::run_pass`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexRunReport {
    pub root: String,
    pub files_scanned: usize,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub chunks_written: usize,
    pub chunks_deleted: usize,
    pub embeddings_written: usize,
    pub embeddings_pending: usize,
    pub failed_files: Vec<String>,
    pub degraded: bool,
    pub full_rescan: bool,
    pub elapsed_ms: u64,
}

/// The latest published digest per root.
///
/// Readers get an `Arc` snapshot; a pass publishes a whole new digest in
/// one swap, so nobody observes a half-updated one.
#[derive(Debug, Default)]
pub struct DigestRegistry {
    inner: RwLock<HashMap<String, Arc<TreeDigest>>>,
}

impl DigestRegistry {
    pub fn get(&self, root: &str) -> Option<Arc<TreeDigest>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(root)
            .cloned()
    }

    pub fn publish(&self, root: &str, digest: TreeDigest) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(root.to_string(), Arc::new(digest));
    }
}

/// One async mutex per `(root, file)`.
///
/// Chunk IDs derive from the file path, so serializing writes per file
/// serializes writes per chunk ID.
#[derive(Default)]
pub struct WriteGates {
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WriteGates {
    pub fn gate(&self, root: &str, file_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates.retain(|_, g| Arc::strong_count(g) > 1);
        gates
            .entry(format!("{}\0{}", root, file_path))
            .or_default()
            .clone()
    }
}

/// Where the previous digest came from.
enum Previous {
    Valid(TreeDigest),
    Missing,
    Corrupt(String),
}

/// A changed file, chunked and enriched.
struct Prepared {
    path: String,
    hash: String,
    chunks: Vec<Chunk>,
}

pub struct Indexer {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    enricher: ContextEnricher,
    workers: usize,
    batch_size: usize,
    digests: Arc<DigestRegistry>,
    gates: Arc<WriteGates>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker: Chunker::new(config.index.chunker()),
            enricher: ContextEnricher::new(config.index.summary_max_chars),
            workers: config.index.worker_count(),
            batch_size: config.embedding.batch_size.max(1),
            digests: Arc::new(DigestRegistry::default()),
            gates: Arc::new(WriteGates::default()),
        }
    }

    pub fn digests(&self) -> &Arc<DigestRegistry> {
        &self.digests
    }

    pub fn gates(&self) -> &Arc<WriteGates> {
        &self.gates
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn previous_digest(&self, root: &str) -> Result<Previous> {
        if let Some(digest) = self.digests.get(root) {
            return Ok(Previous::Valid(digest.as_ref().clone()));
        }
        let Some(json) = self.store.load_digest(root).await? else {
            return Ok(Previous::Missing);
        };
        match serde_json::from_str::<TreeDigest>(&json) {
            Ok(digest) if digest.verify() => Ok(Previous::Valid(digest)),
            Ok(_) => Ok(Previous::Corrupt("aggregate hashes do not match".into())),
            Err(e) => Ok(Previous::Corrupt(e.to_string())),
        }
    }

    /// Baseline for a full rescan: every file the store holds, with a hash
    /// that matches nothing, so each is re-chunked or removed.
    async fn stored_baseline(&self, root: &str) -> Result<TreeDigest> {
        let files: BTreeMap<String, String> = self
            .store
            .indexed_files(root)
            .await?
            .into_iter()
            .map(|f| (f, String::new()))
            .collect();
        Ok(TreeDigest::from_files(files))
    }

    /// Run one indexing pass over `root`. `full` ignores the previous
    /// digest and re-chunks every file.
    pub async fn run_pass(&self, root: &RootConfig, full: bool) -> Result<IndexRunReport> {
        let started = Instant::now();
        let name = root.name.clone();
        let mut report = IndexRunReport {
            root: name.clone(),
            ..Default::default()
        };

        let root_cfg = root.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_root(&root_cfg))
            .await
            .context("scan task panicked")??;
        let current = scanned.digest();
        report.files_scanned = current.len();

        let previous = match self.previous_digest(&name).await? {
            Previous::Valid(d) if !full => d,
            Previous::Valid(_) => {
                report.full_rescan = true;
                self.stored_baseline(&name).await?
            }
            Previous::Missing => {
                report.full_rescan = true;
                self.stored_baseline(&name).await?
            }
            Previous::Corrupt(reason) => {
                let err = EngineError::Corruption {
                    root: name.clone(),
                    reason,
                };
                warn!(error = %err, "running full rescan");
                report.full_rescan = true;
                report.degraded = true;
                self.stored_baseline(&name).await?
            }
        };

        let changes = diff(&previous, &current);
        report.added = changes.added.len();
        report.modified = changes.modified.len();
        report.removed = changes.removed.len();
        debug!(root = %name, changed = changes.len(), "diffed tree digest");

        let mut digest_files = current.files.clone();
        let prepared = self.prepare(&scanned, &changes, &mut report).await;

        for file in prepared {
            match self.write_file(&name, &file, &mut report).await {
                Ok(()) => {
                    digest_files.insert(file.path.clone(), file.hash.clone());
                }
                Err(e) => {
                    warn!(root = %name, file = %file.path, error = %e, "failed to write chunks");
                    report.failed_files.push(file.path.clone());
                }
            }
        }

        for path in &changes.removed {
            let gate = self.gates.gate(&name, path);
            let _guard = gate.lock().await;
            match self.store.delete_file_chunks(&name, path).await {
                Ok(n) => report.chunks_deleted += n,
                Err(e) => {
                    warn!(root = %name, file = %path, error = %e, "failed to delete chunks");
                    report.failed_files.push(path.clone());
                }
            }
        }

        // Failed files keep their previous hash (or none) so they retry.
        for path in &report.failed_files {
            match previous.get(path).filter(|h| !h.is_empty()) {
                Some(hash) => {
                    digest_files.insert(path.clone(), hash.to_string());
                }
                None => {
                    digest_files.remove(path);
                }
            }
        }
        report.failed_files.sort();

        let digest = TreeDigest::from_files(digest_files);
        let json = serde_json::to_string(&digest)?;
        self.store
            .save_digest(&name, &json, &digest.root_hash)
            .await?;
        self.digests.publish(&name, digest);

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            root = %name,
            files = report.files_scanned,
            added = report.added,
            modified = report.modified,
            removed = report.removed,
            chunks_written = report.chunks_written,
            failed = report.failed_files.len(),
            degraded = report.degraded,
            elapsed_ms = report.elapsed_ms,
            "index pass complete"
        );
        Ok(report)
    }

    /// Read, chunk and enrich changed files on a bounded blocking pool.
    async fn prepare(
        &self,
        scanned: &ScannedRoot,
        changes: &ChangeSet,
        report: &mut IndexRunReport,
    ) -> Vec<Prepared> {
        let permits = Arc::new(Semaphore::new(self.workers.max(1)));
        let mut tasks: JoinSet<(String, Result<Prepared>)> = JoinSet::new();

        for path in changes.changed_paths() {
            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let abs = scanned.absolute(&path);
            let root = scanned.name.clone();
            let chunker = self.chunker.clone();
            let enricher = self.enricher.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = prepare_file(&root, &path, &abs, &chunker, &enricher);
                (path, result)
            });
        }

        let mut prepared = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(file))) => prepared.push(file),
                Ok((path, Err(e))) => {
                    warn!(root = %scanned.name, file = %path, error = %e, "failed to chunk file");
                    report.failed_files.push(path);
                }
                Err(e) => warn!(root = %scanned.name, error = %e, "chunk worker panicked"),
            }
        }
        prepared.sort_by(|a, b| a.path.cmp(&b.path));
        prepared
    }

    async fn write_file(
        &self,
        root: &str,
        file: &Prepared,
        report: &mut IndexRunReport,
    ) -> Result<()> {
        let gate = self.gates.gate(root, &file.path);
        let _guard = gate.lock().await;

        // Chunks already stored with identical content need no new vector.
        let ids: Vec<String> = file.chunks.iter().map(|c| c.id.clone()).collect();
        let unchanged: HashSet<String> = self
            .store
            .get_chunks(&ids)
            .await?
            .into_iter()
            .filter(|stored| {
                file.chunks.iter().any(|c| {
                    c.id == stored.id
                        && c.content_hash == stored.content_hash
                        && c.enriched_text == stored.enriched_text
                })
            })
            .map(|c| c.id)
            .collect();

        let to_embed: Vec<&Chunk> = file
            .chunks
            .iter()
            .filter(|c| !unchanged.contains(&c.id))
            .collect();
        let (vectors, embed_failed) = self.embed_chunks(root, &file.path, &to_embed).await;
        if embed_failed {
            report.degraded = true;
        }

        let writes: Vec<ChunkWrite> = file
            .chunks
            .iter()
            .map(|c| {
                let vector = vectors.get(&c.id).cloned();
                let pending = self.embedder.is_enabled()
                    && vector.is_none()
                    && !unchanged.contains(&c.id);
                ChunkWrite {
                    chunk: c.clone(),
                    vector,
                    embedding_pending: pending,
                }
            })
            .collect();

        let model = self
            .embedder
            .is_enabled()
            .then(|| self.embedder.model_name());
        let stats = self
            .store
            .replace_file_chunks(root, &file.path, &writes, model)
            .await?;
        report.chunks_written += stats.inserted;
        report.chunks_deleted += stats.deleted;
        report.embeddings_written += stats.vectors;
        report.embeddings_pending += writes.iter().filter(|w| w.embedding_pending).count();
        Ok(())
    }

    /// Embed in batches. Returns the vectors that succeeded and whether
    /// any batch failed.
    async fn embed_chunks(
        &self,
        root: &str,
        file_path: &str,
        chunks: &[&Chunk],
    ) -> (HashMap<String, Vec<f32>>, bool) {
        let mut vectors = HashMap::new();
        if !self.embedder.is_enabled() || chunks.is_empty() {
            return (vectors, false);
        }
        let mut failed = false;
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.enriched_text.clone()).collect();
            match self.embedder.embed(&texts).await {
                Ok(vecs) if vecs.len() == batch.len() => {
                    for (c, v) in batch.iter().zip(vecs) {
                        vectors.insert(c.id.clone(), v);
                    }
                }
                Ok(vecs) => {
                    warn!(root, file = file_path, got = vecs.len(), expected = batch.len(),
                        "embedding count mismatch, writing keyword-only");
                    failed = true;
                }
                Err(e) => {
                    let err = EngineError::Degraded(format!("embedding failed: {:#}", e));
                    warn!(root, file = file_path, error = %err, "writing keyword-only");
                    failed = true;
                }
            }
        }
        (vectors, failed)
    }
}

fn prepare_file(
    root: &str,
    path: &str,
    abs: &std::path::Path,
    chunker: &Chunker,
    enricher: &ContextEnricher,
) -> Result<Prepared> {
    let content = read_text(abs)?
        .ok_or_else(|| anyhow::anyhow!("{} is no longer valid UTF-8", abs.display()))?;
    let chunks = chunker.chunk(root, path, &content);
    let parent = ParentDocument::from_chunks(path, &content, &chunks);
    let chunks = enricher.enrich_all(chunks, &parent);
    Ok(Prepared {
        path: path.to_string(),
        hash: hash_content(content.as_bytes()),
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use context_weave_core::store::memory::InMemoryStore;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct TestEmbedder {
        fail: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for TestEmbedder {
        fn model_name(&self) -> &str {
            "test"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("embedding service down");
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn config(base: &std::path::Path) -> Config {
        crate::config::parse_config(&format!(
            "[db]\npath = \"x\"\n[index]\nworkers = 2\n[[index.roots]]\nname = \"repo\"\npath = \"{}\"\n",
            base.display()
        ))
        .unwrap()
    }

    fn setup() -> (TempDir, Config, Arc<InMemoryStore>, Arc<TestEmbedder>, Indexer) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/lib.rs"), "pub fn alpha() -> u32 {\n    1\n}\n").unwrap();
        fs::write(tmp.path().join("README.md"), "# Readme\n\nHello there.\n").unwrap();
        let cfg = config(tmp.path());
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(TestEmbedder {
            fail: AtomicBool::new(false),
        });
        let indexer = Indexer::new(store.clone(), embedder.clone(), &cfg);
        (tmp, cfg, store, embedder, indexer)
    }

    #[tokio::test]
    async fn test_first_pass_indexes_everything() {
        let (_tmp, cfg, store, _e, indexer) = setup();
        let report = indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        assert!(report.full_rescan);
        assert!(!report.degraded);
        assert_eq!(report.added, 2);
        assert_eq!(report.files_scanned, 2);
        assert!(report.chunks_written >= 2);
        assert_eq!(report.embeddings_written, report.chunks_written);
        assert_eq!(store.stats().await.unwrap().files, 2);
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let (_tmp, cfg, store, _e, indexer) = setup();
        indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        let inserts = store.insert_count();
        let report = indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        assert_eq!(report.added + report.modified + report.removed, 0);
        assert_eq!(report.chunks_written, 0);
        assert_eq!(store.insert_count(), inserts);
    }

    #[tokio::test]
    async fn test_removed_file_chunks_deleted() {
        let (tmp, cfg, store, _e, indexer) = setup();
        indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        fs::remove_file(tmp.path().join("README.md")).unwrap();
        let report = indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(report.chunks_deleted >= 1);
        assert!(store.file_chunk_ids("repo", "README.md").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_failure_writes_pending() {
        let (_tmp, cfg, store, embedder, indexer) = setup();
        embedder.fail.store(true, Ordering::SeqCst);
        let report = indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        assert!(report.degraded);
        assert!(report.failed_files.is_empty());
        assert_eq!(report.embeddings_pending, report.chunks_written);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.vectors, 0);
        assert_eq!(stats.pending_embeddings, stats.chunks);
    }

    #[tokio::test]
    async fn test_corrupt_digest_forces_degraded_full_rescan() {
        let (tmp, cfg, store, _e, indexer) = setup();
        indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        store.save_digest("repo", "{not json", "x").await.unwrap();
        fs::remove_file(tmp.path().join("README.md")).unwrap();

        // A fresh indexer has no in-memory digest to fall back on.
        let fresh = Indexer::new(store.clone(), indexer.embedder().clone(), &cfg);
        let report = fresh.run_pass(&cfg.index.roots[0], false).await.unwrap();
        assert!(report.degraded);
        assert!(report.full_rescan);
        assert_eq!(report.removed, 1);
        assert!(store.file_chunk_ids("repo", "README.md").await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().files, 1);
    }

    #[tokio::test]
    async fn test_failed_write_retried_next_pass() {
        let (_tmp, cfg, store, _e, indexer) = setup();
        indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        store.set_offline(true);
        assert!(indexer.run_pass(&cfg.index.roots[0], true).await.is_err());
        store.set_offline(false);
        let report = indexer.run_pass(&cfg.index.roots[0], false).await.unwrap();
        assert!(report.failed_files.is_empty());
    }

    #[test]
    fn test_write_gates_shared_per_file() {
        let gates = WriteGates::default();
        let a = gates.gate("repo", "a.rs");
        let b = gates.gate("repo", "a.rs");
        let c = gates.gate("repo", "b.rs");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
