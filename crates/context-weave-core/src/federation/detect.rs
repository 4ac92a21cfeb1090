//! Relationship detection between federated items.
//!
//! For every pair of items whose `updated_at` values lie within the time
//! window:
//!
//! 1. an explicit cross-reference (one item's text contains the other's
//!    `source_id` or URL) classifies the pair as `reference`, whatever its
//!    similarity;
//! 2. otherwise `score >= duplicate_threshold` is `duplicate`;
//! 3. otherwise `score >= related_threshold` is `related`;
//! 4. anything else is `unrelated` and produces no edge.
//!
//! Each item keeps at most `max_relationships` edges. Edges are accepted in
//! priority order (duplicates first, then by score) and dropped once either
//! endpoint is full.

use std::collections::HashMap;

use tracing::debug;

use crate::models::{Item, RelationshipEdge, RelationshipType};

use super::similarity::{similarity, ItemFeatures};
use super::FederationParams;

/// Shortest `source_id` that counts as an explicit reference. Shorter IDs
/// ("1", "42") match too much unrelated text.
pub const MIN_REFERENCE_ID_LEN: usize = 4;

/// Classify one pair from its similarity score and reference flag.
pub fn classify(score: f64, references: bool, params: &FederationParams) -> RelationshipType {
    if references {
        RelationshipType::Reference
    } else if score >= params.duplicate_threshold {
        RelationshipType::Duplicate
    } else if score >= params.related_threshold {
        RelationshipType::Related
    } else {
        RelationshipType::Unrelated
    }
}

/// Whether `from` explicitly mentions `to`.
pub fn references(from: &Item, to: &Item) -> bool {
    let text = match &from.title {
        Some(title) => format!("{}\n{}", title, from.body),
        None => from.body.clone(),
    };
    if let Some(url) = to.source_url.as_deref() {
        if !url.is_empty() && text.contains(url) {
            return true;
        }
    }
    let id = to.source_id.trim();
    if id.chars().count() < MIN_REFERENCE_ID_LEN || from.source_id == to.source_id {
        return false;
    }
    contains_token(&text, id)
}

/// `needle` occurs in `haystack` not embedded in a longer identifier.
fn contains_token(haystack: &str, needle: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(needle).any(|(i, m)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + m.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

fn priority(kind: RelationshipType) -> u8 {
    match kind {
        RelationshipType::Duplicate => 0,
        RelationshipType::Reference => 1,
        RelationshipType::Related => 2,
        RelationshipType::Unrelated => 3,
    }
}

pub fn detect_relationships(items: &[Item], params: &FederationParams) -> Vec<RelationshipEdge> {
    let features: Vec<ItemFeatures> = items.iter().map(ItemFeatures::of).collect();
    let window = params.time_window();
    let mut candidates: Vec<RelationshipEdge> = Vec::new();
    let mut skipped_window = 0usize;

    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let (a, b) = (&items[i], &items[j]);
            if a.id == b.id {
                continue;
            }
            if (a.updated_at - b.updated_at).num_seconds().abs() > window.num_seconds() {
                skipped_window += 1;
                continue;
            }
            let sim = similarity(a, &features[i], b, &features[j], params);
            let kind = classify(sim.score, references(a, b) || references(b, a), params);
            if kind != RelationshipType::Unrelated {
                candidates.push(RelationshipEdge::new(&a.id, &b.id, kind, sim.score));
            }
        }
    }

    candidates.sort_by(|x, y| {
        priority(x.kind)
            .cmp(&priority(y.kind))
            .then_with(|| y.score.total_cmp(&x.score))
            .then_with(|| x.item_a.cmp(&y.item_a))
            .then_with(|| x.item_b.cmp(&y.item_b))
    });

    let mut per_item: HashMap<&str, usize> = HashMap::new();
    let mut kept = Vec::new();
    for edge in &candidates {
        let ca = per_item.get(edge.item_a.as_str()).copied().unwrap_or(0);
        let cb = per_item.get(edge.item_b.as_str()).copied().unwrap_or(0);
        if ca >= params.max_relationships || cb >= params.max_relationships {
            continue;
        }
        *per_item.entry(edge.item_a.as_str()).or_default() += 1;
        *per_item.entry(edge.item_b.as_str()).or_default() += 1;
        kept.push(edge.clone());
    }

    debug!(
        items = items.len(),
        edges = kept.len(),
        dropped_by_cap = candidates.len() - kept.len(),
        skipped_window,
        "detected relationships"
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(source: &str, source_id: &str, title: &str, body: &str) -> Item {
        let mut it = Item::new(source, source_id, body);
        it.title = Some(title.to_string());
        it
    }

    #[test]
    fn test_duplicate_detected() {
        let a = item("jira", "ENG-100", "Login fails on Safari", "Users cannot log in with Safari 17 browser");
        let b = item("slack", "msg-9", "Login fails on Safari", "users cannot log in with safari 17 browser");
        let edges = detect_relationships(&[a, b], &FederationParams::default());
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, RelationshipType::Duplicate);
    }

    #[test]
    fn test_reference_overrides_score() {
        let ticket = item("jira", "ENG-100", "Login fails", "Safari users blocked");
        let commit = item("git", "abc1234", "Fix cookie flags", "Closes ENG-100 by setting SameSite");
        let edges = detect_relationships(&[ticket, commit], &FederationParams::default());
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, RelationshipType::Reference);
    }

    #[test]
    fn test_reference_requires_whole_id() {
        let a = item("jira", "ENG-10", "A", "x");
        let b = item("git", "c1", "B", "mentions ENG-100 only");
        assert!(!references(&b, &a));
    }

    #[test]
    fn test_outside_time_window_never_related() {
        let a = item("jira", "ENG-1", "Same title", "same body text");
        let mut b = item("slack", "m-1", "Same title", "same body text");
        b.updated_at = a.updated_at - Duration::days(200);
        let edges = detect_relationships(&[a, b], &FederationParams::default());
        assert!(edges.is_empty());
    }

    #[test]
    fn test_per_item_cap() {
        let hub = item("jira", "HUB-1", "cache eviction policy", "cache eviction policy details");
        let mut items = vec![hub];
        for i in 0..8 {
            items.push(item(
                "slack",
                &format!("m{}", i),
                "cache eviction policy",
                &format!("cache eviction policy details {}", i),
            ));
        }
        let params = FederationParams {
            max_relationships: 3,
            ..Default::default()
        };
        let edges = detect_relationships(&items, &params);
        let hub_edges = edges.iter().filter(|e| e.touches("jira:HUB-1")).count();
        assert!(hub_edges <= 3);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for e in &edges {
            *counts.entry(&e.item_a).or_default() += 1;
            *counts.entry(&e.item_b).or_default() += 1;
        }
        assert!(counts.values().all(|&c| c <= 3));
    }

    #[test]
    fn test_classify_thresholds() {
        let p = FederationParams::default();
        assert_eq!(classify(0.95, false, &p), RelationshipType::Duplicate);
        assert_eq!(classify(0.5, false, &p), RelationshipType::Related);
        assert_eq!(classify(0.1, false, &p), RelationshipType::Unrelated);
        assert_eq!(classify(0.1, true, &p), RelationshipType::Reference);
    }
}
