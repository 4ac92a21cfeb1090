//! Stage-1 candidate retrieval over the local index.
//!
//! ```text
//!            ┌─► keyword_search ──────────────┐
//! query ─────┤                                ├─► fuse ─► hydrate ─► filter ─► boost ─► items
//!            └─► embed_query ─► vector_search ┘
//! ```
//!
//! Both channels run concurrently, each under the index timeout. Losing one
//! channel degrades recall and is reported as a source error; losing both
//! means the index is unreachable and the request fails.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use context_weave_core::boost::{apply_boost, BoostParams};
use context_weave_core::embedding::{embed_query, EmbeddingProvider};
use context_weave_core::fusion::{fuse, FusionStrategy};
use context_weave_core::models::{Chunk, ChunkKind, Item, RetrievalCandidate, WorkContext};
use context_weave_core::store::{ChunkStore, ScoredId};
use context_weave_core::EngineError;

use crate::config::RetrievalConfig;

/// Source-error label for the keyword channel.
pub const KEYWORD_SOURCE: &str = "index:keyword";
/// Source-error label for the vector channel.
pub const VECTOR_SOURCE: &str = "index:vector";

/// Caller-supplied result filters. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Source labels (`index:repo`, `git_log:history`) or source types
    /// (`index`, `git_log`).
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub kinds: Vec<ChunkKind>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl SearchFilters {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sources.iter().any(|s| s.trim().is_empty()) {
            return Err(EngineError::InvalidInput(
                "source filter names must not be empty".into(),
            ));
        }
        if self
            .path_prefix
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            return Err(EngineError::InvalidInput(
                "path_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn allows_source(&self, label: &str) -> bool {
        self.sources.is_empty()
            || self.sources.iter().any(|s| {
                s == label
                    || label
                        .split_once(':')
                        .is_some_and(|(ty, _)| ty == s.as_str())
            })
    }

    fn allows(
        &self,
        file_path: Option<&str>,
        kind: Option<ChunkKind>,
        updated_at: DateTime<Utc>,
    ) -> bool {
        if let Some(prefix) = &self.path_prefix {
            let prefix = prefix.trim_start_matches("./");
            if !file_path.is_some_and(|p| p.starts_with(prefix)) {
                return false;
            }
        }
        if !self.kinds.is_empty() && !kind.is_some_and(|k| self.kinds.contains(&k)) {
            return false;
        }
        if self.since.is_some_and(|since| updated_at < since) {
            return false;
        }
        true
    }

    pub fn allows_item(&self, item: &Item) -> bool {
        self.allows_source(&item.source)
            && self.allows(item.file_path.as_deref(), item.kind, item.updated_at)
    }
}

/// Source label of an indexed root.
pub fn index_label(root: &str) -> String {
    format!("index:{}", root)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrieverParams {
    pub candidate_k: usize,
    pub candidate_limit: usize,
    pub fusion: FusionStrategy,
    pub index_timeout: Duration,
    pub boost: BoostParams,
}

impl From<&RetrievalConfig> for RetrieverParams {
    fn from(c: &RetrievalConfig) -> Self {
        Self {
            candidate_k: c.candidate_k,
            candidate_limit: c.candidate_limit,
            fusion: c.fusion,
            index_timeout: Duration::from_millis(c.index_timeout_ms),
            boost: c.boost.clone(),
        }
    }
}

/// What one retrieval produced.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    /// Boosted candidates, best first, after filtering.
    pub candidates: Vec<RetrievalCandidate>,
    /// The same candidates as federation items.
    pub items: Vec<Item>,
    /// Channel label → error, for channels that failed.
    pub source_errors: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct CandidateRetriever {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: RetrieverParams,
}

impl CandidateRetriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        params: RetrieverParams,
    ) -> Self {
        Self {
            store,
            embedder,
            params,
        }
    }

    pub fn params(&self) -> &RetrieverParams {
        &self.params
    }

    async fn sparse(&self, query: &str) -> Result<Vec<ScoredId>> {
        match tokio::time::timeout(
            self.params.index_timeout,
            self.store.keyword_search(query, self.params.candidate_k),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => anyhow::bail!("keyword search timed out after {:?}", self.params.index_timeout),
        }
    }

    async fn dense(&self, query: &str) -> Result<Vec<ScoredId>> {
        let search = async {
            let vector = embed_query(self.embedder.as_ref(), query).await?;
            self.store
                .vector_search(&vector, self.params.candidate_k)
                .await
        };
        match tokio::time::timeout(self.params.index_timeout, search).await {
            Ok(r) => r,
            Err(_) => anyhow::bail!("vector search timed out after {:?}", self.params.index_timeout),
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        ctx: &WorkContext,
        filters: &SearchFilters,
    ) -> Result<Retrieval, EngineError> {
        let dense_enabled = self.embedder.is_enabled();
        let (sparse, dense) = tokio::join!(self.sparse(query), async {
            if dense_enabled {
                Some(self.dense(query).await)
            } else {
                None
            }
        });

        let mut source_errors = BTreeMap::new();
        let sparse = match sparse {
            Ok(list) => Some(list),
            Err(e) => {
                warn!(error = %e, "keyword channel failed");
                source_errors.insert(KEYWORD_SOURCE.to_string(), format!("{:#}", e));
                None
            }
        };
        let dense = match dense {
            Some(Ok(list)) => Some(list),
            Some(Err(e)) => {
                warn!(error = %e, "vector channel failed, continuing keyword-only");
                source_errors.insert(VECTOR_SOURCE.to_string(), format!("{:#}", e));
                None
            }
            None => None,
        };
        if sparse.is_none() && dense.is_none() {
            return Err(EngineError::ServiceUnavailable(format!(
                "index unreachable: {}",
                source_errors
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ")
            )));
        }

        let mut candidates = fuse(
            sparse.as_deref().unwrap_or_default(),
            dense.as_deref().unwrap_or_default(),
            self.params.fusion,
            "index",
            self.params.candidate_limit,
        );

        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let chunks = self
            .store
            .get_chunks(&ids)
            .await
            .map_err(|e| EngineError::ServiceUnavailable(format!("chunk hydration failed: {:#}", e)))?;
        let by_id: BTreeMap<&str, &Chunk> = chunks.iter().map(|c| (c.id.as_str(), c)).collect();

        // Hits whose chunk vanished between search and hydration are dropped.
        candidates.retain_mut(|c| {
            let Some(chunk) = by_id.get(c.id.as_str()) else {
                return false;
            };
            c.source = index_label(&chunk.source_id);
            c.metadata.file_path = Some(chunk.file_path.clone());
            c.metadata.symbol = chunk.symbol.clone();
            c.metadata.heading = chunk.heading.clone();
            c.metadata.text = chunk.text.clone();
            filters.allows_source(&c.source)
                && filters.allows(Some(&chunk.file_path), Some(chunk.kind), chunk.updated_at)
        });
        apply_boost(&mut candidates, ctx, &self.params.boost);

        let items = candidates
            .iter()
            .filter_map(|c| by_id.get(c.id.as_str()).map(|chunk| to_item(c, chunk)))
            .collect();
        debug!(candidates = candidates.len(), "stage-1 retrieval");
        Ok(Retrieval {
            candidates,
            items,
            source_errors,
        })
    }
}

fn to_item(candidate: &RetrievalCandidate, chunk: &Chunk) -> Item {
    let mut item = Item::new(&candidate.source, &chunk.id, chunk.text.clone());
    item.id = chunk.id.clone();
    item.title = chunk.symbol.clone().or_else(|| chunk.heading.clone());
    item.file_path = Some(chunk.file_path.clone());
    item.kind = Some(chunk.kind);
    item.created_at = chunk.updated_at;
    item.updated_at = chunk.updated_at;
    item.score = candidate.boosted_score;
    item.metadata = serde_json::json!({
        "start_line": chunk.range.start_line,
        "end_line": chunk.range.end_line,
        "language": chunk.language,
        "signature": chunk.signature,
        "scope": chunk.scope,
        "sparse_score": candidate.sparse_score,
        "dense_score": candidate.dense_score,
        "fused_score": candidate.fused_score,
        "boost_factor": candidate.boost_factor,
    });
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use context_weave_core::chunk::Chunker;
    use context_weave_core::store::memory::InMemoryStore;
    use context_weave_core::store::ChunkWrite;

    struct AxisEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.fail {
                bail!("embedding endpoint unreachable");
            }
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("token") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    async fn seed(store: &InMemoryStore, root: &str, path: &str, text: &str, v: Vec<f32>) {
        let writes: Vec<ChunkWrite> = Chunker::default()
            .chunk(root, path, text)
            .into_iter()
            .map(|chunk| ChunkWrite {
                chunk,
                vector: Some(v.clone()),
                embedding_pending: false,
            })
            .collect();
        store.replace_file_chunks(root, path, &writes, None).await.unwrap();
    }

    async fn setup(fail_embed: bool) -> (Arc<InMemoryStore>, CandidateRetriever) {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "repo", "src/auth.md", "token refresh flow for sessions\n", vec![1.0, 0.0]).await;
        seed(&store, "repo", "src/db.md", "database pool sizing token\n", vec![0.0, 1.0]).await;
        seed(&store, "docs", "guide.md", "install guide\n", vec![0.0, 1.0]).await;
        let params = RetrieverParams::from(&RetrievalConfig::default());
        let retriever = CandidateRetriever::new(
            store.clone(),
            Arc::new(AxisEmbedder { fail: fail_embed }),
            params,
        );
        (store, retriever)
    }

    #[tokio::test]
    async fn test_hybrid_retrieval_hydrates_and_labels() {
        let (_store, retriever) = setup(false).await;
        let r = retriever
            .retrieve("token refresh", &WorkContext::default(), &SearchFilters::default())
            .await
            .unwrap();
        assert!(r.source_errors.is_empty());
        assert_eq!(r.items[0].file_path.as_deref(), Some("src/auth.md"));
        assert_eq!(r.items[0].source, "index:repo");
        assert!(r.candidates[0].sparse_score.is_some());
        assert!(r.candidates[0].dense_score.is_some());
        assert_eq!(r.candidates.len(), r.items.len());
    }

    #[tokio::test]
    async fn test_dense_failure_degrades_to_keyword() {
        let (_store, retriever) = setup(true).await;
        let r = retriever
            .retrieve("token", &WorkContext::default(), &SearchFilters::default())
            .await
            .unwrap();
        assert!(r.source_errors.contains_key(VECTOR_SOURCE));
        assert!(!r.items.is_empty());
        assert!(r.candidates.iter().all(|c| c.dense_score.is_none()));
    }

    #[tokio::test]
    async fn test_store_unreachable_is_fatal() {
        let (store, retriever) = setup(false).await;
        store.set_offline(true);
        let err = retriever
            .retrieve("token", &WorkContext::default(), &SearchFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_filters_apply_to_hydrated_candidates() {
        let (_store, retriever) = setup(false).await;
        let filters = SearchFilters {
            sources: vec!["index:docs".into()],
            ..Default::default()
        };
        let r = retriever
            .retrieve("install token", &WorkContext::default(), &filters)
            .await
            .unwrap();
        assert!(r.items.iter().all(|i| i.source == "index:docs"));

        let filters = SearchFilters {
            path_prefix: Some("src/db".into()),
            ..Default::default()
        };
        let r = retriever
            .retrieve("token", &WorkContext::default(), &filters)
            .await
            .unwrap();
        assert_eq!(r.items.len(), 1);
        assert_eq!(r.items[0].file_path.as_deref(), Some("src/db.md"));
    }

    #[tokio::test]
    async fn test_active_file_boost_reorders_close_scores() {
        let (_store, retriever) = setup(true).await;
        let ctx = WorkContext {
            active_file: Some("src/db.md".into()),
            ..Default::default()
        };
        let r = retriever
            .retrieve("token", &ctx, &SearchFilters::default())
            .await
            .unwrap();
        let db = r
            .candidates
            .iter()
            .find(|c| c.metadata.file_path.as_deref() == Some("src/db.md"))
            .unwrap();
        assert!(db.boost_factor > 1.0);
        assert!(db.boosted_score <= db.fused_score * 1.5 + 1e-9);
    }

    #[test]
    fn test_filter_validation() {
        let bad = SearchFilters {
            sources: vec!["  ".into()],
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(EngineError::InvalidInput(_))));
        assert!(SearchFilters::default().validate().is_ok());
    }

    #[test]
    fn test_source_filter_accepts_type_or_label() {
        let f = SearchFilters {
            sources: vec!["git_log".into(), "index:repo".into()],
            ..Default::default()
        };
        assert!(f.allows_source("git_log:history"));
        assert!(f.allows_source("index:repo"));
        assert!(!f.allows_source("index:docs"));
    }
}
