//! In-memory [`ChunkStore`] implementation for tests.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Keyword search is a
//! saturating term-frequency score over enriched chunk text; vector search
//! is brute-force cosine similarity. [`InMemoryStore::set_offline`] makes
//! every operation fail, which lets tests exercise the unreachable-store
//! path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::Chunk;
use crate::text::tokenize;

use super::{
    ChunkStore, ChunkWrite, IndexMetadata, KeywordIndex, ScoredId, StoreStats, VectorIndex,
    WriteStats,
};

struct StoredChunk {
    chunk: Chunk,
    pending: bool,
}

#[derive(Default)]
pub struct InMemoryStore {
    chunks: RwLock<HashMap<String, StoredChunk>>,
    texts: RwLock<HashMap<String, String>>,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    digests: RwLock<HashMap<String, String>>,
    offline: AtomicBool,
    inserts: AtomicUsize,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable store.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total chunk rows inserted since creation.
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("in-memory store is offline");
        }
        Ok(())
    }
}

fn keyword_score(query_terms: &[String], text: &str) -> f64 {
    let mut tf: HashMap<String, usize> = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_default() += 1;
    }
    query_terms
        .iter()
        .filter_map(|t| tf.get(t))
        .map(|&n| n as f64 / (n as f64 + 1.2))
        .sum()
}

fn top_k(mut scored: Vec<ScoredId>, k: usize) -> Vec<ScoredId> {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    scored.truncate(k);
    scored
}

#[async_trait]
impl KeywordIndex for InMemoryStore {
    async fn upsert_text(&self, id: &str, text: &str, _metadata: &IndexMetadata) -> Result<()> {
        self.check()?;
        write(&self.texts)?.insert(id.to_string(), text.to_string());
        Ok(())
    }

    async fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        self.check()?;
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();
        let texts = read(&self.texts)?;
        let scored = texts
            .iter()
            .map(|(id, text)| ScoredId::new(id.clone(), keyword_score(&terms, text)))
            .filter(|s| s.score > 0.0)
            .collect();
        Ok(top_k(scored, k))
    }
}

#[async_trait]
impl VectorIndex for InMemoryStore {
    async fn upsert_vector(
        &self,
        id: &str,
        vector: &[f32],
        _metadata: &IndexMetadata,
    ) -> Result<()> {
        self.check()?;
        write(&self.vectors)?.insert(id.to_string(), vector.to_vec());
        if let Some(stored) = write(&self.chunks)?.get_mut(id) {
            stored.pending = false;
        }
        Ok(())
    }

    async fn vector_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        self.check()?;
        let vectors = read(&self.vectors)?;
        let scored = vectors
            .iter()
            .map(|(id, v)| ScoredId::new(id.clone(), cosine_similarity(vector, v) as f64))
            .collect();
        Ok(top_k(scored, k))
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn replace_file_chunks(
        &self,
        root: &str,
        file_path: &str,
        writes: &[ChunkWrite],
        _model: Option<&str>,
    ) -> Result<WriteStats> {
        self.check()?;
        let mut chunks = write(&self.chunks)?;
        let mut texts = write(&self.texts)?;
        let mut vectors = write(&self.vectors)?;
        let mut stats = WriteStats::default();

        let keep: HashSet<&str> = writes.iter().map(|w| w.chunk.id.as_str()).collect();
        let stale: Vec<String> = chunks
            .iter()
            .filter(|(id, s)| {
                s.chunk.source_id == root
                    && s.chunk.file_path == file_path
                    && !keep.contains(id.as_str())
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            chunks.remove(&id);
            texts.remove(&id);
            vectors.remove(&id);
            stats.deleted += 1;
        }

        for w in writes {
            let id = &w.chunk.id;
            if let Some(existing) = chunks.get(id) {
                if existing.chunk.content_hash == w.chunk.content_hash
                    && existing.chunk.enriched_text == w.chunk.enriched_text
                {
                    stats.unchanged += 1;
                    continue;
                }
            }
            texts.insert(id.clone(), w.chunk.enriched_text.clone());
            let pending = match &w.vector {
                Some(v) => {
                    vectors.insert(id.clone(), v.clone());
                    stats.vectors += 1;
                    false
                }
                None => {
                    vectors.remove(id);
                    w.embedding_pending
                }
            };
            chunks.insert(
                id.clone(),
                StoredChunk {
                    chunk: w.chunk.clone(),
                    pending,
                },
            );
            stats.inserted += 1;
            self.inserts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(stats)
    }

    async fn delete_file_chunks(&self, root: &str, file_path: &str) -> Result<usize> {
        self.replace_file_chunks(root, file_path, &[], None)
            .await
            .map(|s| s.deleted)
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        self.check()?;
        Ok(read(&self.chunks)?.get(id).map(|s| s.chunk.clone()))
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        self.check()?;
        let chunks = read(&self.chunks)?;
        Ok(ids
            .iter()
            .filter_map(|id| chunks.get(id).map(|s| s.chunk.clone()))
            .collect())
    }

    async fn file_chunk_ids(&self, root: &str, file_path: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut ids: Vec<String> = read(&self.chunks)?
            .iter()
            .filter(|(_, s)| s.chunk.source_id == root && s.chunk.file_path == file_path)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn indexed_files(&self, root: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut files: Vec<String> = read(&self.chunks)?
            .values()
            .filter(|s| s.chunk.source_id == root)
            .map(|s| s.chunk.file_path.clone())
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    async fn load_digest(&self, root: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(read(&self.digests)?.get(root).cloned())
    }

    async fn save_digest(&self, root: &str, digest_json: &str, _root_hash: &str) -> Result<()> {
        self.check()?;
        write(&self.digests)?.insert(root.to_string(), digest_json.to_string());
        Ok(())
    }

    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<Chunk>> {
        self.check()?;
        let mut pending: Vec<Chunk> = read(&self.chunks)?
            .values()
            .filter(|s| s.pending)
            .map(|s| s.chunk.clone())
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.check()?;
        let chunks = read(&self.chunks)?;
        let files: HashSet<(&str, &str)> = chunks
            .values()
            .map(|s| (s.chunk.source_id.as_str(), s.chunk.file_path.as_str()))
            .collect();
        Ok(StoreStats {
            files: files.len(),
            chunks: chunks.len(),
            vectors: read(&self.vectors)?.len(),
            pending_embeddings: chunks.values().filter(|s| s.pending).count(),
        })
    }
}
