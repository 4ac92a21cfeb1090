//! Query entry point.
//!
//! [`QueryService::search`] walks one request through
//!
//! ```text
//! received ─► context_resolved ─► retrieving ─► detecting_relationships
//!          ─► merging ─► reranking ─► complete
//! ```
//!
//! with `failed` reachable from any non-terminal phase. In `retrieving`, the
//! local index and every connector run concurrently on a [`JoinSet`], each
//! bounded by its own timeout; fan-in keeps whatever succeeded. A failed
//! source is recorded in `source_errors` and opens its backoff window in
//! [`SourceHealth`]. The whole request is bounded by a deadline; when it
//! passes, the in-flight tasks are aborted and nothing partial is returned.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use context_weave_core::boost::{boost_item, BoostParams};
use context_weave_core::federation::{detect_relationships, merge_and_deduplicate, FederationParams};
use context_weave_core::models::{Item, MergedResult, WorkContext};
use context_weave_core::rerank::{rerank_results, Reranker};
use context_weave_core::EngineError;

use crate::config::Config;
use crate::connectors::ConnectorSource;
use crate::context::WorkContextTracker;
use crate::health::SourceHealth;
use crate::retriever::{CandidateRetriever, Retrieval, SearchFilters};

pub const MAX_QUERY_CHARS: usize = 2048;
pub const MAX_TOP_K: usize = 200;

/// Label under which index results are listed in `sources_queried`.
pub const INDEX_SOURCE: &str = "index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Received,
    ContextResolved,
    Retrieving,
    DetectingRelationships,
    Merging,
    Reranking,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Received => Some(Self::ContextResolved),
            Self::ContextResolved => Some(Self::Retrieving),
            Self::Retrieving => Some(Self::DetectingRelationships),
            Self::DetectingRelationships => Some(Self::Merging),
            Self::Merging => Some(Self::Reranking),
            Self::Reranking => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid phase transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

/// Ordered record of the phases a request went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseLog {
    phases: Vec<Phase>,
}

impl Default for PhaseLog {
    fn default() -> Self {
        Self {
            phases: vec![Phase::Received],
        }
    }
}

impl PhaseLog {
    pub fn current(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Received)
    }

    pub fn advance(&mut self, to: Phase) -> Result<(), InvalidTransition> {
        let from = self.current();
        let allowed = match to {
            Phase::Failed => !from.is_terminal(),
            _ => from.next() == Some(to),
        };
        if !allowed {
            return Err(InvalidTransition { from, to });
        }
        self.phases.push(to);
        Ok(())
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    /// Declared focus for this request. With a session ID it also becomes
    /// the session's stored context.
    pub work_context: Option<WorkContext>,
    pub session_id: Option<String>,
    pub filters: SearchFilters,
    pub top_k: Option<usize>,
    pub deadline: Option<Duration>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<MergedResult>,
    pub degraded: bool,
    pub reranked: bool,
    pub sources_queried: Vec<String>,
    /// Source label → error message.
    pub source_errors: BTreeMap<String, String>,
    /// Why reranking was skipped, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_error: Option<String>,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    pub top_k: usize,
    pub rerank_candidates: usize,
    pub source_timeout: Duration,
    pub deadline: Duration,
    pub session_idle: chrono::Duration,
    pub boost: BoostParams,
}

impl From<&Config> for QueryParams {
    fn from(config: &Config) -> Self {
        let r = &config.retrieval;
        Self {
            top_k: r.top_k,
            rerank_candidates: r.rerank_candidates,
            source_timeout: Duration::from_millis(r.source_timeout_ms),
            deadline: Duration::from_millis(r.deadline_ms),
            session_idle: chrono::Duration::seconds(r.session_idle_secs as i64),
            boost: r.boost.clone(),
        }
    }
}

enum Fanout {
    Index(Result<Retrieval, EngineError>),
    Connector {
        label: String,
        result: Result<Vec<Item>, String>,
    },
}

#[derive(Clone)]
pub struct QueryService {
    retriever: CandidateRetriever,
    connectors: Vec<Arc<dyn ConnectorSource>>,
    reranker: Arc<dyn Reranker>,
    contexts: Arc<WorkContextTracker>,
    health: Arc<SourceHealth>,
    federation: FederationParams,
    params: QueryParams,
}

impl QueryService {
    pub fn new(
        retriever: CandidateRetriever,
        connectors: Vec<Arc<dyn ConnectorSource>>,
        reranker: Arc<dyn Reranker>,
        config: &Config,
    ) -> Self {
        Self {
            retriever,
            connectors,
            reranker,
            contexts: Arc::new(WorkContextTracker::new()),
            health: Arc::new(SourceHealth::new(&config.health)),
            federation: config.federation.clone(),
            params: QueryParams::from(config),
        }
    }

    pub fn contexts(&self) -> &Arc<WorkContextTracker> {
        &self.contexts
    }

    pub fn health(&self) -> &Arc<SourceHealth> {
        &self.health
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    fn validate(&self, req: &SearchRequest) -> Result<usize, EngineError> {
        if req.query.trim().is_empty() {
            return Err(EngineError::InvalidInput("query must not be empty".into()));
        }
        if req.query.chars().count() > MAX_QUERY_CHARS {
            return Err(EngineError::InvalidInput(format!(
                "query exceeds {} characters",
                MAX_QUERY_CHARS
            )));
        }
        let top_k = req.top_k.unwrap_or(self.params.top_k);
        if top_k == 0 || top_k > MAX_TOP_K {
            return Err(EngineError::InvalidInput(format!(
                "top_k must be between 1 and {}",
                MAX_TOP_K
            )));
        }
        if req.session_id.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(EngineError::InvalidInput("session_id must not be empty".into()));
        }
        req.filters.validate()?;
        Ok(top_k)
    }

    /// The request's effective work context: the declared one (recorded for
    /// its session), else the session's stored one, else empty.
    fn resolve_context(&self, req: &SearchRequest) -> WorkContext {
        self.contexts.evict_idle(self.params.session_idle);
        let session = req
            .session_id
            .clone()
            .or_else(|| req.work_context.as_ref().and_then(|c| c.session_id.clone()));
        match (&req.work_context, session) {
            (Some(ctx), Some(session)) => {
                let mut ctx = ctx.clone();
                ctx.session_id = Some(session);
                let fallback = ctx.clone();
                self.contexts.update(ctx).unwrap_or(fallback)
            }
            (Some(ctx), None) => ctx.clone(),
            (None, Some(session)) => self.contexts.get(&session).unwrap_or_default(),
            (None, None) => WorkContext::default(),
        }
    }

    /// Run one search under the request's deadline.
    pub async fn search(&self, req: SearchRequest) -> Result<SearchResponse, EngineError> {
        let deadline = req.deadline.unwrap_or(self.params.deadline);
        match tokio::time::timeout(deadline, self.run(req)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "search deadline exceeded");
                Err(EngineError::DeadlineExceeded)
            }
        }
    }

    async fn run(&self, req: SearchRequest) -> Result<SearchResponse, EngineError> {
        let started = Instant::now();
        let mut phases = PhaseLog::default();
        let top_k = self.validate(&req)?;

        let ctx = self.resolve_context(&req);
        advance(&mut phases, Phase::ContextResolved)?;

        advance(&mut phases, Phase::Retrieving)?;
        let query: Arc<str> = Arc::from(req.query.trim());
        let filters = Arc::new(req.filters.clone());
        let ctx = Arc::new(ctx);
        let mut set: JoinSet<Fanout> = JoinSet::new();
        let mut sources_queried = Vec::new();
        let mut source_errors = BTreeMap::new();
        let mut in_flight: BTreeSet<String> = BTreeSet::new();

        if filters.sources.is_empty() || filters.sources.iter().any(|s| is_index_filter(s)) {
            let retriever = self.retriever.clone();
            let (q, f, c) = (query.clone(), filters.clone(), ctx.clone());
            set.spawn(async move { Fanout::Index(retriever.retrieve(&q, &c, &f).await) });
            sources_queried.push(INDEX_SOURCE.to_string());
            in_flight.insert(INDEX_SOURCE.to_string());
        }

        for connector in &self.connectors {
            let label = connector.source_label();
            if !filters.allows_source(&label) {
                continue;
            }
            if let Some(reason) = self.health.skip_reason(&label) {
                debug!(source = %label, "skipping source in backoff");
                source_errors.insert(label, reason);
                continue;
            }
            let connector = connector.clone();
            let timeout = self.params.source_timeout;
            let (q, f) = (query.clone(), filters.clone());
            sources_queried.push(label.clone());
            in_flight.insert(label.clone());
            set.spawn(async move {
                let result = match tokio::time::timeout(timeout, connector.query(&q, &f)).await {
                    Ok(Ok(items)) => Ok(items),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                };
                Fanout::Connector { label, result }
            });
        }

        let mut items: Vec<Item> = Vec::new();
        while let Some(joined) = set.join_next().await {
            let Ok(outcome) = joined else {
                // A panicked task's label stays in `in_flight`.
                continue;
            };
            match outcome {
                Fanout::Index(Ok(retrieval)) => {
                    in_flight.remove(INDEX_SOURCE);
                    source_errors.extend(retrieval.source_errors);
                    items.extend(retrieval.items);
                }
                Fanout::Index(Err(e)) => {
                    in_flight.remove(INDEX_SOURCE);
                    warn!(error = %e, "index retrieval failed");
                    set.abort_all();
                    advance(&mut phases, Phase::Failed)?;
                    return Err(e);
                }
                Fanout::Connector { label, result } => {
                    in_flight.remove(&label);
                    match result {
                        Ok(found) => {
                            self.health.record_success(&label);
                            for mut item in found {
                                if !filters.allows_item(&item) {
                                    continue;
                                }
                                item.score = item.score.clamp(0.0, 1.0);
                                boost_item(&mut item, &ctx, &self.params.boost);
                                items.push(item);
                            }
                        }
                        Err(e) => {
                            warn!(error = %EngineError::source_failed(&label, &e), "skipping source");
                            self.health.record_failure(&label, &e);
                            source_errors.insert(label, e);
                        }
                    }
                }
            }
        }
        for label in in_flight {
            if label == INDEX_SOURCE {
                advance(&mut phases, Phase::Failed)?;
                return Err(EngineError::ServiceUnavailable("index retrieval task panicked".into()));
            }
            self.health.record_failure(&label, "task panicked");
            source_errors.insert(label, "task panicked".into());
        }

        advance(&mut phases, Phase::DetectingRelationships)?;
        let edges = detect_relationships(&items, &self.federation);

        advance(&mut phases, Phase::Merging)?;
        let mut merged = merge_and_deduplicate(&items, &edges, &self.federation);
        merged.truncate(self.params.rerank_candidates.max(top_k));

        advance(&mut phases, Phase::Reranking)?;
        let outcome = rerank_results(self.reranker.as_ref(), &query, merged, top_k).await;

        advance(&mut phases, Phase::Complete)?;
        let degraded =
            !source_errors.is_empty() || (self.reranker.is_enabled() && !outcome.reranked);
        info!(
            results = outcome.results.len(),
            items = items.len(),
            edges = edges.len(),
            sources = sources_queried.len(),
            failed_sources = source_errors.len(),
            reranked = outcome.reranked,
            degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );
        Ok(SearchResponse {
            results: outcome.results,
            degraded,
            reranked: outcome.reranked,
            sources_queried,
            source_errors,
            rerank_error: outcome.error,
            phases: phases.phases().to_vec(),
        })
    }
}

fn is_index_filter(s: &str) -> bool {
    s == INDEX_SOURCE || s.starts_with("index:")
}

fn advance(phases: &mut PhaseLog, to: Phase) -> Result<(), EngineError> {
    debug!(phase = ?to, "query phase");
    phases
        .advance(to)
        .map_err(|e| EngineError::ServiceUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_log_happy_path() {
        let mut log = PhaseLog::default();
        for p in [
            Phase::ContextResolved,
            Phase::Retrieving,
            Phase::DetectingRelationships,
            Phase::Merging,
            Phase::Reranking,
            Phase::Complete,
        ] {
            log.advance(p).unwrap();
        }
        assert_eq!(log.phases().len(), 7);
        assert!(log.current().is_terminal());
        assert!(log.advance(Phase::Failed).is_err());
    }

    #[test]
    fn test_phase_log_rejects_skips_and_allows_failure() {
        let mut log = PhaseLog::default();
        let err = log.advance(Phase::Merging).unwrap_err();
        assert_eq!(err.from, Phase::Received);
        log.advance(Phase::ContextResolved).unwrap();
        log.advance(Phase::Failed).unwrap();
        assert!(log.advance(Phase::Retrieving).is_err());
        assert_eq!(
            log.phases(),
            &[Phase::Received, Phase::ContextResolved, Phase::Failed]
        );
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Phase::DetectingRelationships).unwrap(),
            "detecting_relationships"
        );
    }
}
