//! Stage-2 precision reranking with graceful degradation.
//!
//! [`rerank_results`] sends the query and the merged stage-1 results to a
//! [`Reranker`] and reorders them by the returned calibrated scores. If the
//! reranker errors, or does not score every result, the stage-1 order is
//! kept and the outcome is flagged `reranked = false`. A reranker failure
//! never fails the request.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::MergedResult;

/// Max characters of a result's text sent for scoring.
pub const MAX_RERANK_DOC_CHARS: usize = 2000;

/// A document to be scored.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankDoc {
    pub id: String,
    pub text: String,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;
    /// `false` for the disabled reranker: stage-1 order is then expected
    /// and not reported as a degradation.
    fn is_enabled(&self) -> bool {
        true
    }
    /// Score every document against the query. Higher is more relevant.
    async fn score(&self, query: &str, docs: &[RerankDoc]) -> Result<Vec<(String, f64)>>;
}

#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub results: Vec<MergedResult>,
    pub reranked: bool,
    /// Why reranking was skipped, when it failed.
    pub error: Option<String>,
}

fn doc_text(result: &MergedResult) -> String {
    let item = &result.canonical;
    let text = match &item.title {
        Some(title) => format!("{}\n{}", title, item.body),
        None => item.body.clone(),
    };
    match text.char_indices().nth(MAX_RERANK_DOC_CHARS) {
        Some((i, _)) => text[..i].to_string(),
        None => text,
    }
}

/// Rerank `results` (already in stage-1 order) and truncate to `top_k`.
pub async fn rerank_results(
    reranker: &dyn Reranker,
    query: &str,
    mut results: Vec<MergedResult>,
    top_k: usize,
) -> RerankOutcome {
    if !reranker.is_enabled() {
        results.truncate(top_k);
        return RerankOutcome {
            results,
            reranked: false,
            error: None,
        };
    }
    if results.is_empty() {
        return RerankOutcome {
            results,
            reranked: true,
            error: None,
        };
    }

    let docs: Vec<RerankDoc> = results
        .iter()
        .map(|r| RerankDoc {
            id: r.canonical.id.clone(),
            text: doc_text(r),
        })
        .collect();

    let scores = match reranker.score(query, &docs).await {
        Ok(scores) => scores,
        Err(e) => {
            warn!(reranker = reranker.name(), error = %e, "reranker failed, keeping stage-1 order");
            return fallback(results, top_k, e.to_string());
        }
    };

    let scores: HashMap<String, f64> = scores.into_iter().collect();
    let missing = docs.iter().filter(|d| !scores.contains_key(&d.id)).count();
    if missing > 0 {
        let msg = format!("reranker scored {} of {} results", docs.len() - missing, docs.len());
        warn!(reranker = reranker.name(), %msg, "incomplete rerank, keeping stage-1 order");
        return fallback(results, top_k, msg);
    }

    for r in results.iter_mut() {
        r.rerank_score = scores.get(&r.canonical.id).copied();
    }
    // Stable sort: equal rerank scores keep their stage-1 order.
    results.sort_by(|a, b| {
        let sa = a.rerank_score.unwrap_or(f64::NEG_INFINITY);
        let sb = b.rerank_score.unwrap_or(f64::NEG_INFINITY);
        sb.total_cmp(&sa)
    });
    results.truncate(top_k);
    debug!(reranker = reranker.name(), kept = results.len(), "reranked");
    RerankOutcome {
        results,
        reranked: true,
        error: None,
    }
}

fn fallback(mut results: Vec<MergedResult>, top_k: usize, error: String) -> RerankOutcome {
    results.truncate(top_k);
    RerankOutcome {
        results,
        reranked: false,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Item, SourceAttribution};
    use anyhow::bail;

    fn result(id: &str, body: &str, score: f64) -> MergedResult {
        let mut item = Item::new("index:repo", id, body);
        item.id = id.to_string();
        item.score = score;
        MergedResult {
            sources: vec![SourceAttribution {
                source: item.source.clone(),
                item_id: item.id.clone(),
                source_id: item.source_id.clone(),
                source_url: None,
                score,
            }],
            canonical: item,
            relationships: Vec::new(),
            related: Vec::new(),
            score,
            rerank_score: None,
        }
    }

    enum Mode {
        ByLength,
        Fail,
        DropLast,
    }

    struct Scripted(Mode);

    #[async_trait]
    impl Reranker for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn score(&self, _query: &str, docs: &[RerankDoc]) -> Result<Vec<(String, f64)>> {
            match self.0 {
                Mode::ByLength => Ok(docs
                    .iter()
                    .map(|d| (d.id.clone(), d.text.len() as f64))
                    .collect()),
                Mode::Fail => bail!("connection refused"),
                Mode::DropLast => Ok(docs[..docs.len() - 1]
                    .iter()
                    .map(|d| (d.id.clone(), 1.0))
                    .collect()),
            }
        }
    }

    fn stage1() -> Vec<MergedResult> {
        vec![
            result("a", "short", 0.9),
            result("b", "a much longer body", 0.8),
            result("c", "medium text", 0.7),
        ]
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_truncates() {
        let out = rerank_results(&Scripted(Mode::ByLength), "q", stage1(), 2).await;
        assert!(out.reranked);
        let ids: Vec<_> = out.results.iter().map(|r| r.canonical.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(out.results[0].rerank_score.is_some());
    }

    #[tokio::test]
    async fn test_rerank_failure_keeps_stage1_order() {
        let out = rerank_results(&Scripted(Mode::Fail), "q", stage1(), 10).await;
        assert!(!out.reranked);
        assert!(out.error.unwrap().contains("connection refused"));
        let ids: Vec<_> = out.results.iter().map(|r| r.canonical.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(out.results.iter().all(|r| r.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_incomplete_scores_fall_back() {
        let out = rerank_results(&Scripted(Mode::DropLast), "q", stage1(), 10).await;
        assert!(!out.reranked);
        assert_eq!(out.results[0].canonical.id, "a");
    }
}
