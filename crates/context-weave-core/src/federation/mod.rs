//! Cross-source federation.
//!
//! Items returned by independent sources (the local index, git history,
//! issue trackers, chat) often describe the same thing. Federation runs in
//! two steps:
//!
//! 1. [`detect::detect_relationships`] scores every pair of items inside a
//!    time window and classifies it as duplicate, related, reference, or
//!    unrelated.
//! 2. [`merge::merge_and_deduplicate`] folds duplicate clusters into one
//!    [`MergedResult`](crate::models::MergedResult) each and attaches the
//!    remaining links as "see also" edges.
//!
//! All weights and thresholds come from [`FederationParams`]; none are
//! fixed in the algorithms.

pub mod detect;
pub mod graph;
pub mod merge;
pub mod similarity;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use detect::detect_relationships;
pub use graph::RelationshipGraph;
pub use merge::merge_and_deduplicate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationParams {
    #[serde(default = "default_title_weight")]
    pub title_weight: f64,
    #[serde(default = "default_content_weight")]
    pub content_weight: f64,
    #[serde(default = "default_metadata_weight")]
    pub metadata_weight: f64,
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f64,
    #[serde(default = "default_related_threshold")]
    pub related_threshold: f64,
    /// Pairs whose `updated_at` differ by more than this are never related.
    #[serde(default = "default_time_window_days")]
    pub time_window_days: i64,
    #[serde(default = "default_max_relationships")]
    pub max_relationships: usize,
    /// How far the relationship graph is walked when listing related results.
    #[serde(default = "default_see_also_depth")]
    pub see_also_depth: usize,
    /// Results scoring below this after merging are dropped.
    #[serde(default)]
    pub min_score: f64,
    /// Trust weight per source label (`git_log:history`) or source type
    /// (`git_log`). Higher wins canonical selection.
    #[serde(default)]
    pub source_weights: BTreeMap<String, f64>,
    #[serde(default = "default_source_weight")]
    pub default_source_weight: f64,
}

fn default_title_weight() -> f64 {
    0.4
}

fn default_content_weight() -> f64 {
    0.4
}

fn default_metadata_weight() -> f64 {
    0.2
}

fn default_duplicate_threshold() -> f64 {
    0.7
}

fn default_related_threshold() -> f64 {
    0.4
}

fn default_time_window_days() -> i64 {
    90
}

fn default_max_relationships() -> usize {
    5
}

fn default_see_also_depth() -> usize {
    2
}

fn default_source_weight() -> f64 {
    1.0
}

impl Default for FederationParams {
    fn default() -> Self {
        Self {
            title_weight: default_title_weight(),
            content_weight: default_content_weight(),
            metadata_weight: default_metadata_weight(),
            duplicate_threshold: default_duplicate_threshold(),
            related_threshold: default_related_threshold(),
            time_window_days: default_time_window_days(),
            max_relationships: default_max_relationships(),
            see_also_depth: default_see_also_depth(),
            min_score: 0.0,
            source_weights: BTreeMap::new(),
            default_source_weight: default_source_weight(),
        }
    }
}

impl FederationParams {
    /// Trust weight for a source label: exact label first, then the type
    /// prefix before `:`, then the default.
    pub fn source_weight(&self, source: &str) -> f64 {
        if let Some(w) = self.source_weights.get(source) {
            return *w;
        }
        source
            .split_once(':')
            .and_then(|(ty, _)| self.source_weights.get(ty))
            .copied()
            .unwrap_or(self.default_source_weight)
    }

    pub fn time_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.time_window_days.max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_weight_lookup() {
        let mut params = FederationParams::default();
        params.source_weights.insert("index".into(), 1.5);
        params.source_weights.insert("http_json:jira".into(), 1.2);
        assert_eq!(params.source_weight("index:repo"), 1.5);
        assert_eq!(params.source_weight("http_json:jira"), 1.2);
        assert_eq!(params.source_weight("git_log:history"), 1.0);
    }
}
