//! Pairwise item similarity.
//!
//! `score` is the weighted mean of the available components:
//!
//! - **title**: token-set Jaccard, only when both items have a title;
//! - **content**: token-set Jaccard of the bodies;
//! - **metadata**: mean of tag Jaccard and author Jaccard (each only when
//!   both sides have values) and timestamp proximity
//!   `1 - |Δupdated_at| / window`.
//!
//! Components that are unavailable drop out and the remaining weights are
//! renormalized, so two untitled chunks are compared on content and
//! metadata alone instead of being penalized for the missing titles.

use std::collections::BTreeSet;

use crate::models::Item;
use crate::text::token_set;

use super::FederationParams;

/// Precomputed token sets for one item.
#[derive(Debug, Clone)]
pub struct ItemFeatures {
    pub title: Option<BTreeSet<String>>,
    pub content: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub authors: BTreeSet<String>,
}

impl ItemFeatures {
    pub fn of(item: &Item) -> Self {
        Self {
            title: item
                .title
                .as_deref()
                .map(token_set)
                .filter(|t| !t.is_empty()),
            content: token_set(&item.body),
            tags: item.tags.iter().map(|t| t.trim().to_lowercase()).collect(),
            authors: item
                .authors
                .iter()
                .map(|a| a.trim().to_lowercase())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairSimilarity {
    pub title: Option<f64>,
    pub content: f64,
    pub metadata: f64,
    pub score: f64,
}

/// Jaccard index; two empty sets are treated as dissimilar.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

fn time_proximity(a: &Item, b: &Item, params: &FederationParams) -> f64 {
    let window = params.time_window().num_seconds() as f64;
    if window <= 0.0 {
        return 0.0;
    }
    let delta = (a.updated_at - b.updated_at).num_seconds().abs() as f64;
    (1.0 - delta / window).clamp(0.0, 1.0)
}

pub fn similarity(
    a: &Item,
    fa: &ItemFeatures,
    b: &Item,
    fb: &ItemFeatures,
    params: &FederationParams,
) -> PairSimilarity {
    let title = match (&fa.title, &fb.title) {
        (Some(ta), Some(tb)) => Some(jaccard(ta, tb)),
        _ => None,
    };
    let content = jaccard(&fa.content, &fb.content);

    let mut meta_parts = vec![time_proximity(a, b, params)];
    if !fa.tags.is_empty() && !fb.tags.is_empty() {
        meta_parts.push(jaccard(&fa.tags, &fb.tags));
    }
    if !fa.authors.is_empty() && !fb.authors.is_empty() {
        meta_parts.push(jaccard(&fa.authors, &fb.authors));
    }
    let metadata = meta_parts.iter().sum::<f64>() / meta_parts.len() as f64;

    let mut weighted = params.content_weight * content + params.metadata_weight * metadata;
    let mut total = params.content_weight + params.metadata_weight;
    if let Some(t) = title {
        weighted += params.title_weight * t;
        total += params.title_weight;
    }
    let score = if total > 0.0 {
        (weighted / total).clamp(0.0, 1.0)
    } else {
        0.0
    };

    PairSimilarity {
        title,
        content,
        metadata,
        score,
    }
}
