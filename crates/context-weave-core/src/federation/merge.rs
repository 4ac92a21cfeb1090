//! Duplicate folding and conflict resolution.
//!
//! Items joined by `duplicate` edges become one [`MergedResult`]. Clusters
//! grow by complete linkage: two clusters join only when every cross pair
//! scores at least [`MIN_MERGE_SIMILARITY`], so a chain A~B~C never folds A
//! into C when A and C are unalike. A duplicate edge refused that way is
//! kept as a `related` link instead. The canonical item is the one from the most
//! trusted source (per [`FederationParams::source_weight`]), then the most
//! recently updated, then the smallest ID. Field conflicts resolve as:
//!
//! | Field | Rule |
//! |-------|------|
//! | `created_at`, `updated_at` | newest |
//! | `authors`, `tags` | union, canonical's entries first |
//! | `body` | longest |
//! | `title`, `source_url` | canonical's, else first available |
//! | `score` | maximum |
//!
//! Every contributor stays listed in `sources` with its original score.
//! `related` and `reference` edges are re-pointed at canonical IDs and
//! attached to both endpoints; results up to
//! [`FederationParams::see_also_depth`] hops away are listed in `related`.
//! The `min_score` filter runs after merging, so a low-scoring duplicate
//! still lends its score to the canonical item.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::models::{
    Item, MergedResult, RelatedItem, RelationshipEdge, RelationshipType, SourceAttribution,
};

use super::graph::RelationshipGraph;
use super::similarity::{similarity, ItemFeatures};
use super::FederationParams;

/// Pairs scoring below this are never folded into one result.
pub const MIN_MERGE_SIMILARITY: f64 = 0.3;

struct UnionFind {
    parent: Vec<usize>,
    members: Vec<Vec<usize>>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            members: (0..n).map(|i| vec![i]).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the lower index as root so group order follows input order.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
            let moved = std::mem::take(&mut self.members[hi]);
            self.members[lo].extend(moved);
        }
    }

    /// Members of the cluster rooted at `root`.
    fn cluster(&self, root: usize) -> &[usize] {
        &self.members[root]
    }
}

/// `Ordering::Greater` when `a` should be canonical over `b`.
fn canonical_order(a: &Item, b: &Item, params: &FederationParams) -> Ordering {
    params
        .source_weight(&a.source)
        .total_cmp(&params.source_weight(&b.source))
        .then_with(|| a.updated_at.cmp(&b.updated_at))
        .then_with(|| b.id.cmp(&a.id))
}

fn union_in_order(lists: &[&[String]]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for v in list.iter() {
            if seen.insert(v.to_lowercase()) {
                out.push(v.clone());
            }
        }
    }
    out
}

fn merge_group(members: &[&Item], params: &FederationParams) -> (Item, Vec<SourceAttribution>) {
    let canonical = members
        .iter()
        .copied()
        .max_by(|a, b| canonical_order(a, b, params))
        .unwrap_or(members[0]);

    let mut others: Vec<&Item> = members
        .iter()
        .copied()
        .filter(|m| m.id != canonical.id)
        .collect();
    others.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

    let mut merged = canonical.clone();
    for other in &others {
        merged.updated_at = merged.updated_at.max(other.updated_at);
        merged.created_at = merged.created_at.max(other.created_at);
        merged.score = merged.score.max(other.score);
        if other.body.chars().count() > merged.body.chars().count() {
            merged.body = other.body.clone();
        }
        if merged.title.is_none() {
            merged.title = other.title.clone();
        }
        if merged.source_url.is_none() {
            merged.source_url = other.source_url.clone();
        }
        if merged.file_path.is_none() {
            merged.file_path = other.file_path.clone();
        }
    }
    let author_lists: Vec<&[String]> = std::iter::once(canonical)
        .chain(others.iter().copied())
        .map(|m| m.authors.as_slice())
        .collect();
    merged.authors = union_in_order(&author_lists);
    let tag_lists: Vec<&[String]> = std::iter::once(canonical)
        .chain(others.iter().copied())
        .map(|m| m.tags.as_slice())
        .collect();
    merged.tags = union_in_order(&tag_lists);

    let sources = std::iter::once(canonical)
        .chain(others.iter().copied())
        .map(|m| SourceAttribution {
            source: m.source.clone(),
            item_id: m.id.clone(),
            source_id: m.source_id.clone(),
            source_url: m.source_url.clone(),
            score: m.score,
        })
        .collect();

    (merged, sources)
}

pub fn merge_and_deduplicate(
    items: &[Item],
    edges: &[RelationshipEdge],
    params: &FederationParams,
) -> Vec<MergedResult> {
    let index: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, it)| (it.id.as_str(), i))
        .collect();

    let features: Vec<ItemFeatures> = items.iter().map(ItemFeatures::of).collect();
    let pair_score = |i: usize, j: usize| {
        similarity(&items[i], &features[i], &items[j], &features[j], params).score
    };

    let mut duplicates: Vec<&RelationshipEdge> = edges
        .iter()
        .filter(|e| e.kind == RelationshipType::Duplicate)
        .collect();
    duplicates.sort_by(|x, y| {
        y.score
            .total_cmp(&x.score)
            .then_with(|| x.item_a.cmp(&y.item_a))
            .then_with(|| x.item_b.cmp(&y.item_b))
    });

    let mut uf = UnionFind::new(items.len());
    let mut refused: Vec<RelationshipEdge> = Vec::new();
    for edge in duplicates {
        let (Some(&a), Some(&b)) = (index.get(edge.item_a.as_str()), index.get(edge.item_b.as_str()))
        else {
            continue;
        };
        let (ra, rb) = (uf.find(a), uf.find(b));
        if ra == rb {
            continue;
        }
        let linked = uf
            .cluster(ra)
            .iter()
            .all(|&i| uf.cluster(rb).iter().all(|&j| pair_score(i, j) >= MIN_MERGE_SIMILARITY));
        if linked {
            uf.union(a, b);
        } else {
            debug!(a = %edge.item_a, b = %edge.item_b, "duplicate kept apart");
            refused.push(RelationshipEdge::new(
                &edge.item_a,
                &edge.item_b,
                RelationshipType::Related,
                edge.score,
            ));
        }
    }

    let mut groups: BTreeMap<usize, Vec<&Item>> = BTreeMap::new();
    for i in 0..items.len() {
        let root = uf.find(i);
        groups.entry(root).or_default().push(&items[i]);
    }

    let mut canonical_of: HashMap<&str, String> = HashMap::new();
    let mut results: Vec<MergedResult> = Vec::with_capacity(groups.len());
    for members in groups.values() {
        let (canonical, sources) = merge_group(members, params);
        for m in members {
            canonical_of.insert(m.id.as_str(), canonical.id.clone());
        }
        results.push(MergedResult {
            score: canonical.score,
            canonical,
            sources,
            relationships: Vec::new(),
            related: Vec::new(),
            rerank_score: None,
        });
    }

    results.retain(|r| r.score >= params.min_score);
    let retained: HashSet<String> = results.iter().map(|r| r.canonical.id.clone()).collect();

    let graph = RelationshipGraph::from_edges(
        edges
            .iter()
            .filter(|e| e.kind != RelationshipType::Duplicate)
            .chain(refused.iter())
            .filter_map(|e| {
                let a = canonical_of.get(e.item_a.as_str())?;
                let b = canonical_of.get(e.item_b.as_str())?;
                (a != b && retained.contains(a) && retained.contains(b))
                    .then(|| RelationshipEdge::new(a, b, e.kind, e.score))
            }),
    );
    for r in results.iter_mut() {
        r.relationships = graph
            .neighbors(&r.canonical.id)
            .into_iter()
            .cloned()
            .collect();
        r.related = graph
            .related_items(&r.canonical.id, params.see_also_depth)
            .into_iter()
            .map(|(id, hops)| RelatedItem { id, hops })
            .collect();
    }

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.canonical.id.cmp(&b.canonical.id))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::detect_relationships;
    use chrono::Duration;

    fn item(source: &str, source_id: &str, title: &str, body: &str, score: f64) -> Item {
        let mut it = Item::new(source, source_id, body);
        it.title = Some(title.to_string());
        it.score = score;
        it
    }

    #[test]
    fn test_duplicates_fold_into_one_result() {
        let mut a = item("jira", "ENG-1", "Login fails on Safari", "Users cannot log in with Safari", 0.4);
        a.authors = vec!["ana".into()];
        a.tags = vec!["auth".into()];
        let mut b = item("slack", "m-1", "Login fails on Safari", "users cannot log in with safari 17 at all", 0.9);
        b.authors = vec!["bo".into(), "Ana".into()];
        b.tags = vec!["safari".into()];
        b.updated_at = a.updated_at + Duration::hours(1);
        let c = item("git", "deadbeef", "Bump deps", "Update lockfile", 0.5);

        let mut params = FederationParams::default();
        params.source_weights.insert("jira".into(), 2.0);
        let items = vec![a.clone(), b.clone(), c];
        let edges = detect_relationships(&items, &params);
        let results = merge_and_deduplicate(&items, &edges, &params);

        assert_eq!(results.len(), 2);
        let merged = results
            .iter()
            .find(|r| r.sources.len() == 2)
            .expect("merged result");
        assert_eq!(merged.canonical.id, a.id, "trusted source wins");
        assert_eq!(merged.sources[0].item_id, a.id);
        assert_eq!(merged.score, 0.9);
        assert_eq!(merged.canonical.body, b.body);
        assert_eq!(merged.canonical.updated_at, b.updated_at);
        assert_eq!(merged.canonical.authors, vec!["ana".to_string(), "bo".to_string()]);
        assert_eq!(merged.canonical.tags, vec!["auth".to_string(), "safari".to_string()]);
        assert_eq!(merged.sources[1].score, 0.9);
    }

    #[test]
    fn test_dissimilar_items_never_merged() {
        let a = item("jira", "ENG-1", "Login fails", "cookie samesite issue", 0.5);
        let b = item("slack", "m-1", "Quarterly planning", "roadmap discussion for q3", 0.5);
        let items = vec![a, b];
        let params = FederationParams::default();
        let edges = detect_relationships(&items, &params);
        let results = merge_and_deduplicate(&items, &edges, &params);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.sources.len() == 1));
    }

    #[test]
    fn test_min_score_applies_after_merge() {
        let low = item("slack", "m-1", "Cache stampede", "cache stampede on deploy", 0.1);
        let high = item("jira", "ENG-2", "Cache stampede", "cache stampede on deploy", 0.8);
        let params = FederationParams {
            min_score: 0.5,
            ..Default::default()
        };
        let items = vec![low.clone(), high];
        let edges = detect_relationships(&items, &params);
        let results = merge_and_deduplicate(&items, &edges, &params);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sources.len(), 2);
        assert!(results[0].sources.iter().any(|s| s.item_id == low.id));
    }

    #[test]
    fn test_reference_edges_attached_not_merged() {
        let ticket = item("jira", "ENG-100", "Login fails", "Safari users blocked", 0.7);
        let commit = item("git", "abc1234", "Fix cookie flags", "Closes ENG-100", 0.6);
        let items = vec![ticket.clone(), commit.clone()];
        let params = FederationParams::default();
        let edges = detect_relationships(&items, &params);
        let results = merge_and_deduplicate(&items, &edges, &params);
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.relationships.len(), 1);
            assert_eq!(r.relationships[0].kind, RelationshipType::Reference);
        }
    }

    #[test]
    fn test_merge_never_fabricates() {
        let items = vec![
            item("a", "x-1", "t", "alpha", 0.3),
            item("b", "y-1", "t", "alpha", 0.2),
        ];
        let params = FederationParams::default();
        let edges = detect_relationships(&items, &params);
        let results = merge_and_deduplicate(&items, &edges, &params);
        let input_ids: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
        for r in &results {
            assert!(input_ids.contains(r.canonical.id.as_str()));
            assert!(r.sources.iter().all(|s| input_ids.contains(s.item_id.as_str())));
        }
    }

    #[test]
    fn test_duplicate_chain_does_not_merge_dissimilar_ends() {
        let base = chrono::Utc::now();
        let mut a = Item::new("slack", "msg-aaaa", "alpha bravo charlie delta echo foxtrot golf hotel india juliet");
        a.updated_at = base;
        a.score = 0.5;
        let mut b = item(
            "jira",
            "ENG-bbbb",
            "cache bug",
            "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima",
            0.6,
        );
        b.updated_at = base + Duration::days(45);
        let mut c = item("git", "commit-cccc", "cache bug", "alpha bravo charlie delta kilo lima", 0.7);
        c.updated_at = base + Duration::days(88);

        let params = FederationParams::default();
        let score = |x: &Item, y: &Item| {
            similarity(x, &ItemFeatures::of(x), y, &ItemFeatures::of(y), &params).score
        };
        assert!(score(&a, &b) >= params.duplicate_threshold);
        assert!(score(&b, &c) >= params.duplicate_threshold);
        assert!(score(&a, &c) < MIN_MERGE_SIMILARITY);

        let items = vec![a.clone(), b.clone(), c.clone()];
        let edges = detect_relationships(&items, &params);
        assert_eq!(
            edges.iter().filter(|e| e.kind == RelationshipType::Duplicate).count(),
            2
        );
        let results = merge_and_deduplicate(&items, &edges, &params);

        assert_eq!(results.len(), 2);
        let holder = |id: &str| {
            results
                .iter()
                .position(|r| r.sources.iter().any(|s| s.item_id == id))
                .expect("every item lands in a result")
        };
        assert_ne!(holder(&a.id), holder(&c.id));

        // A~B is the stronger edge, so B joins A and C stays alone.
        let merged = &results[holder(&b.id)];
        let mut members: Vec<&str> = merged.sources.iter().map(|s| s.item_id.as_str()).collect();
        members.sort_unstable();
        let mut expected = vec![a.id.as_str(), b.id.as_str()];
        expected.sort_unstable();
        assert_eq!(members, expected);

        let alone = &results[holder(&c.id)];
        assert_eq!(alone.sources.len(), 1);
        assert!(alone
            .relationships
            .iter()
            .any(|e| e.kind == RelationshipType::Related && e.touches(&merged.canonical.id)));
    }

    #[test]
    fn test_related_lists_results_two_hops_away() {
        let items = vec![
            item("jira", "ENG-100", "Login fails", "Safari users blocked", 0.7),
            item("git", "abc1234", "Fix cookie flags", "Closes ENG-100", 0.6),
            item("slack", "m-9", "Deploy note", "shipping abc1234 today", 0.5),
        ];
        let params = FederationParams::default();
        let edges = detect_relationships(&items, &params);
        let results = merge_and_deduplicate(&items, &edges, &params);
        assert_eq!(results.len(), 3);

        let ticket = results
            .iter()
            .find(|r| r.canonical.id == "jira:ENG-100")
            .expect("ticket result");
        assert_eq!(ticket.relationships.len(), 1);
        assert_eq!(
            ticket.related,
            vec![
                RelatedItem { id: "git:abc1234".into(), hops: 1 },
                RelatedItem { id: "slack:m-9".into(), hops: 2 },
            ]
        );

        let shallow = FederationParams {
            see_also_depth: 1,
            ..Default::default()
        };
        let results = merge_and_deduplicate(&items, &edges, &shallow);
        let ticket = results
            .iter()
            .find(|r| r.canonical.id == "jira:ENG-100")
            .expect("ticket result");
        assert_eq!(ticket.related.len(), 1);
    }
}
