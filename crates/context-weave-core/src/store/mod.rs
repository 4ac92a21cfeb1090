//! Storage abstraction for context-weave.
//!
//! Three narrow interfaces sit between the engine and persistence:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`KeywordIndex`] | `upsert_text` / `keyword_search` over chunk text |
//! | [`VectorIndex`] | `upsert_vector` / `vector_search` over embeddings |
//! | [`ChunkStore`] | The chunk table keyed by chunk ID, per-root digests, pending-embedding backlog |
//!
//! Implementations must be `Send + Sync`. The SQLite implementation lives
//! in the app crate; [`memory::InMemoryStore`] backs tests.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Chunk, ChunkKind};

/// An `(id, score)` pair from a keyword or vector search, higher is better.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredId {
    pub id: String,
    pub score: f64,
}

impl ScoredId {
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// Metadata stored alongside index entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexMetadata {
    pub source_id: String,
    pub file_path: String,
    pub kind: Option<ChunkKind>,
    /// Embedding model that produced a vector.
    pub model: Option<String>,
}

impl IndexMetadata {
    pub fn for_chunk(chunk: &Chunk) -> Self {
        Self {
            source_id: chunk.source_id.clone(),
            file_path: chunk.file_path.clone(),
            kind: Some(chunk.kind),
            model: None,
        }
    }
}

#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn upsert_text(&self, id: &str, text: &str, metadata: &IndexMetadata) -> Result<()>;
    /// Term-relevance search. Scores are backend-specific; only their order
    /// is meaningful.
    async fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store a vector for a chunk and clear its pending-embedding flag.
    async fn upsert_vector(&self, id: &str, vector: &[f32], metadata: &IndexMetadata)
        -> Result<()>;
    /// Cosine-similarity search.
    async fn vector_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredId>>;
}

/// One chunk to write, with its vector if embedding succeeded.
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub chunk: Chunk,
    pub vector: Option<Vec<f32>>,
    /// Written keyword-only; embed later via the pending backlog.
    pub embedding_pending: bool,
}

/// What a [`ChunkStore::replace_file_chunks`] call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub inserted: usize,
    pub deleted: usize,
    /// Chunks whose ID and content hash were already stored.
    pub unchanged: usize,
    pub vectors: usize,
}

/// Counts reported by `cw status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub files: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub pending_embeddings: usize,
}

#[async_trait]
pub trait ChunkStore: KeywordIndex + VectorIndex {
    /// Replace every chunk of one file atomically.
    ///
    /// Chunks already stored with the same ID and content hash are left
    /// untouched; stale chunks of the file are deleted in the same
    /// transaction that inserts the new ones.
    async fn replace_file_chunks(
        &self,
        root: &str,
        file_path: &str,
        writes: &[ChunkWrite],
        model: Option<&str>,
    ) -> Result<WriteStats>;

    /// Delete every chunk of one file. Returns the number deleted.
    async fn delete_file_chunks(&self, root: &str, file_path: &str) -> Result<usize>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>>;

    /// Fetch chunks by ID; missing IDs are skipped.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// Chunk IDs of one file, sorted.
    async fn file_chunk_ids(&self, root: &str, file_path: &str) -> Result<Vec<String>>;

    /// Distinct file paths with stored chunks under a root, sorted.
    async fn indexed_files(&self, root: &str) -> Result<Vec<String>>;

    /// Raw persisted digest for a root, if any.
    async fn load_digest(&self, root: &str) -> Result<Option<String>>;

    /// Persist a root's digest. Replaces the previous one in one write.
    async fn save_digest(&self, root: &str, digest_json: &str, root_hash: &str) -> Result<()>;

    /// Chunks written keyword-only and still waiting for a vector.
    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<Chunk>>;

    async fn stats(&self) -> Result<StoreStats>;
}
