//! Score normalization and sparse/dense fusion.
//!
//! Keyword (BM25-style) and vector (cosine) scores live on different
//! scales, so each list is normalized to `[0, 1]` on its own first:
//!
//! - [`FusionStrategy::MinMax`]: `(s - min) / (max - min)`; a list whose
//!   scores are all equal normalizes to `1.0`.
//! - [`FusionStrategy::Rank`]: `(k + 1) / (k + rank)` with `k = 60`, so the
//!   top item scores `1.0` regardless of raw values.
//!
//! The normalized scores are then combined as a probabilistic OR:
//!
//! ```text
//! fused = 1 - (1 - sparse) * (1 - dense)
//! ```
//!
//! A candidate missing from one list contributes `0` for that side. Since
//! both factors are in `[0, 1]`, `fused >= max(sparse, dense)`: appearing
//! in both lists never lowers a score.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{CandidateMetadata, RetrievalCandidate};
use crate::store::ScoredId;

/// Rank-normalization smoothing constant.
pub const RANK_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    #[default]
    MinMax,
    Rank,
}

/// Normalize one ranked list. Output is sorted by descending score, ties
/// by ID; duplicate IDs keep their best score.
pub fn normalize(list: &[ScoredId], strategy: FusionStrategy) -> Vec<(String, f64)> {
    let mut best: HashMap<&str, f64> = HashMap::new();
    for s in list.iter().filter(|s| s.score.is_finite()) {
        let e = best.entry(s.id.as_str()).or_insert(f64::NEG_INFINITY);
        if s.score > *e {
            *e = s.score;
        }
    }
    let mut sorted: Vec<(&str, f64)> = best.into_iter().collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    if sorted.is_empty() {
        return Vec::new();
    }

    match strategy {
        FusionStrategy::MinMax => {
            let max = sorted[0].1;
            let min = sorted[sorted.len() - 1].1;
            sorted
                .into_iter()
                .map(|(id, s)| {
                    let norm = if (max - min).abs() < f64::EPSILON {
                        1.0
                    } else {
                        (s - min) / (max - min)
                    };
                    (id.to_string(), norm.clamp(0.0, 1.0))
                })
                .collect()
        }
        FusionStrategy::Rank => sorted
            .into_iter()
            .enumerate()
            .map(|(i, (id, _))| (id.to_string(), (RANK_K + 1.0) / (RANK_K + (i + 1) as f64)))
            .collect(),
    }
}

/// Probabilistic OR of two normalized scores.
pub fn combine(sparse: Option<f64>, dense: Option<f64>) -> f64 {
    let s = sparse.unwrap_or(0.0).clamp(0.0, 1.0);
    let d = dense.unwrap_or(0.0).clamp(0.0, 1.0);
    1.0 - (1.0 - s) * (1.0 - d)
}

/// Fuse a sparse and a dense list into at most `limit` candidates, best first.
pub fn fuse(
    sparse: &[ScoredId],
    dense: &[ScoredId],
    strategy: FusionStrategy,
    source: &str,
    limit: usize,
) -> Vec<RetrievalCandidate> {
    let mut merged: HashMap<String, (Option<f64>, Option<f64>)> = HashMap::new();
    for (id, s) in normalize(sparse, strategy) {
        merged.entry(id).or_default().0 = Some(s);
    }
    for (id, d) in normalize(dense, strategy) {
        merged.entry(id).or_default().1 = Some(d);
    }

    let mut candidates: Vec<RetrievalCandidate> = merged
        .into_iter()
        .map(|(id, (s, d))| {
            let fused = combine(s, d);
            RetrievalCandidate {
                id,
                source: source.to_string(),
                sparse_score: s,
                dense_score: d,
                fused_score: fused,
                boosted_score: fused,
                boost_factor: 1.0,
                metadata: CandidateMetadata::default(),
            }
        })
        .collect();
    candidates.sort_by(compare_candidates);
    candidates.truncate(limit);
    candidates
}

/// Final-score order: boosted score descending, then the higher dense
/// score (semantic match over keyword overlap), then ID.
pub fn compare_candidates(a: &RetrievalCandidate, b: &RetrievalCandidate) -> Ordering {
    b.boosted_score
        .total_cmp(&a.boosted_score)
        .then_with(|| {
            let da = a.dense_score.unwrap_or(-1.0);
            let db = b.dense_score.unwrap_or(-1.0);
            db.total_cmp(&da)
        })
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[(&str, f64)]) -> Vec<ScoredId> {
        entries.iter().map(|(id, s)| ScoredId::new(*id, *s)).collect()
    }

    #[test]
    fn test_minmax_range_and_equal() {
        let n = normalize(&list(&[("a", 10.0), ("b", 5.0), ("c", 0.0)]), FusionStrategy::MinMax);
        assert_eq!(n[0], ("a".to_string(), 1.0));
        assert_eq!(n[1], ("b".to_string(), 0.5));
        assert_eq!(n[2], ("c".to_string(), 0.0));

        let eq = normalize(&list(&[("a", 3.0), ("b", 3.0)]), FusionStrategy::MinMax);
        assert!(eq.iter().all(|(_, s)| *s == 1.0));
        assert!(normalize(&[], FusionStrategy::MinMax).is_empty());
    }

    #[test]
    fn test_rank_normalization() {
        let n = normalize(&list(&[("b", 0.2), ("a", 0.9)]), FusionStrategy::Rank);
        assert_eq!(n[0].0, "a");
        assert_eq!(n[0].1, 1.0);
        assert!((n[1].1 - 61.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn test_fusion_monotonicity() {
        let sparse = list(&[("a", 12.0), ("b", 7.5), ("c", 3.0), ("d", 1.0)]);
        let dense = list(&[("c", 0.91), ("a", 0.40), ("e", 0.88), ("b", 0.10)]);
        for strategy in [FusionStrategy::MinMax, FusionStrategy::Rank] {
            let s_norm: HashMap<_, _> = normalize(&sparse, strategy).into_iter().collect();
            let d_norm: HashMap<_, _> = normalize(&dense, strategy).into_iter().collect();
            for c in fuse(&sparse, &dense, strategy, "index", 100) {
                if let Some(s) = s_norm.get(&c.id) {
                    assert!(c.fused_score >= *s - 1e-12);
                }
                if let Some(d) = d_norm.get(&c.id) {
                    assert!(c.fused_score >= *d - 1e-12);
                }
                assert!((0.0..=1.0).contains(&c.fused_score));
            }
        }
    }

    #[test]
    fn test_tie_prefers_dense() {
        // "k" is top keyword only, "v" is top vector only: both fuse to 1.0.
        let sparse = list(&[("k", 5.0), ("x", 1.0)]);
        let dense = list(&[("v", 0.9), ("x", 0.1)]);
        let fused = fuse(&sparse, &dense, FusionStrategy::MinMax, "index", 10);
        assert_eq!(fused[0].id, "v");
        assert_eq!(fused[1].id, "k");
    }

    #[test]
    fn test_fuse_limit_and_source() {
        let sparse = list(&[("a", 3.0), ("b", 2.0), ("c", 1.0)]);
        let fused = fuse(&sparse, &[], FusionStrategy::MinMax, "index", 2);
        assert_eq!(fused.len(), 2);
        assert!(fused.iter().all(|c| c.source == "index" && c.dense_score.is_none()));
    }

    #[test]
    fn test_duplicate_ids_keep_best() {
        let n = normalize(&list(&[("a", 1.0), ("a", 4.0), ("b", 2.0)]), FusionStrategy::MinMax);
        assert_eq!(n.len(), 2);
        assert_eq!(n[0], ("a".to_string(), 1.0));
    }
}
