//! # context-weave core
//!
//! Runtime-free engine logic for context-weave: the data model, content
//! hashing and tree-digest change detection, structure-aware chunking,
//! context enrichment, score fusion and work-context boosting, rerank
//! orchestration, and cross-source federation.
//!
//! This crate contains no tokio, sqlx, or network I/O. External services
//! (embedding providers, keyword and vector indexes, the chunk table,
//! rerankers) are reached through the narrow traits in [`embedding`],
//! [`store`], and [`rerank`]; the `context-weave` app crate supplies the
//! concrete implementations.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Chunks, items, work context, candidates, edges, merged results |
//! | [`error`] | Engine error taxonomy |
//! | [`digest`] | Content hashing, `TreeDigest`, merge-diff change detection |
//! | [`chunk`] | AST, prose, and sliding-window chunkers |
//! | [`enrich`] | Parent-document summaries prepended before embedding |
//! | [`embedding`] | Embedding provider trait and vector helpers |
//! | [`store`] | Keyword/vector index and chunk store traits, in-memory store |
//! | [`fusion`] | Score normalization and sparse/dense fusion |
//! | [`boost`] | Work-context boosting with a bounded factor |
//! | [`rerank`] | Reranker trait and graceful-degradation orchestration |
//! | [`federation`] | Similarity, relationship detection, merge, relationship graph |
//! | [`text`] | Tokenization shared by keyword scoring and similarity |

pub mod boost;
pub mod chunk;
pub mod digest;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod federation;
pub mod fusion;
pub mod models;
pub mod rerank;
pub mod store;
pub mod text;

pub use error::EngineError;
