//! Wiring: one [`Engine`] owns the store, the indexing service, and the
//! query service built from a [`Config`].

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use context_weave_core::embedding::EmbeddingProvider;
use context_weave_core::rerank::Reranker;
use context_weave_core::store::ChunkStore;

use crate::config::Config;
use crate::connectors::{ConnectorRegistry, ConnectorSource};
use crate::db;
use crate::embedding::create_provider;
use crate::indexer::Indexer;
use crate::jobs::IndexService;
use crate::migrate;
use crate::reranker::create_reranker;
use crate::retriever::{CandidateRetriever, RetrieverParams};
use crate::service::QueryService;
use crate::sqlite_store::SqliteStore;

/// External services an engine is assembled from.
pub struct EngineParts {
    pub store: Arc<dyn ChunkStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub reranker: Arc<dyn Reranker>,
    pub connectors: Vec<Arc<dyn ConnectorSource>>,
    /// Where index runs are recorded, if anywhere.
    pub history: Option<SqliteStore>,
}

pub struct Engine {
    pub index: IndexService,
    pub query: QueryService,
    store: Arc<dyn ChunkStore>,
    pool: Option<SqlitePool>,
}

impl Engine {
    /// Open the SQLite store (migrating it if needed) and build every
    /// configured provider and connector.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let store = SqliteStore::new(pool.clone());
        let registry = ConnectorRegistry::from_config(config)?;
        let parts = EngineParts {
            store: Arc::new(store.clone()),
            embedder: create_provider(&config.embedding)?,
            reranker: create_reranker(&config.rerank)?,
            connectors: registry.sources().to_vec(),
            history: Some(store),
        };
        let mut engine = Self::from_parts(config, parts);
        engine.pool = Some(pool);
        Ok(engine)
    }

    pub fn from_parts(config: &Config, parts: EngineParts) -> Self {
        let indexer = Indexer::new(parts.store.clone(), parts.embedder.clone(), config);
        let roots = config.index.roots.clone();
        let index = match parts.history {
            Some(history) => IndexService::with_history(indexer, roots, history),
            None => IndexService::new(indexer, roots),
        };
        let retriever = CandidateRetriever::new(
            parts.store.clone(),
            parts.embedder,
            RetrieverParams::from(&config.retrieval),
        );
        let query = QueryService::new(retriever, parts.connectors, parts.reranker, config);
        Self {
            index,
            query,
            store: parts.store,
            pool: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}
