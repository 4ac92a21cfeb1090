//! Cross-source relationship graph.
//!
//! An adjacency list keyed by item ID. Each undirected edge is stored once
//! (canonical `item_a < item_b` ordering), and both endpoints index it.
//! The graph may contain cycles; traversal tracks visited IDs.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::RelationshipEdge;

#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    edges: Vec<RelationshipEdge>,
    adjacency: HashMap<String, Vec<usize>>,
    pair_index: HashMap<(String, String), usize>,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_edges<I: IntoIterator<Item = RelationshipEdge>>(edges: I) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph.insert(edge);
        }
        graph
    }

    /// Insert an edge. Self-loops are ignored; for a pair already present
    /// the higher-scoring edge wins.
    pub fn insert(&mut self, edge: RelationshipEdge) {
        let edge = RelationshipEdge::new(&edge.item_a, &edge.item_b, edge.kind, edge.score);
        if edge.item_a == edge.item_b {
            return;
        }
        let key = (edge.item_a.clone(), edge.item_b.clone());
        if let Some(&idx) = self.pair_index.get(&key) {
            if edge.score > self.edges[idx].score {
                self.edges[idx] = edge;
            }
            return;
        }
        let idx = self.edges.len();
        self.adjacency.entry(edge.item_a.clone()).or_default().push(idx);
        self.adjacency.entry(edge.item_b.clone()).or_default().push(idx);
        self.pair_index.insert(key, idx);
        self.edges.push(edge);
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> &[RelationshipEdge] {
        &self.edges
    }

    /// Edges touching `id`, highest score first.
    pub fn neighbors(&self, id: &str) -> Vec<&RelationshipEdge> {
        let mut out: Vec<&RelationshipEdge> = self
            .adjacency
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.item_a.cmp(&b.item_a))
                .then_with(|| a.item_b.cmp(&b.item_b))
        });
        out
    }

    /// Items reachable from `id` within `max_depth` hops, with their
    /// distance, in breadth-first order. `id` itself is excluded.
    pub fn related_items(&self, id: &str, max_depth: usize) -> Vec<(String, usize)> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        let mut out = Vec::new();
        visited.insert(id);
        queue.push_back((id, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for edge in self.neighbors(current) {
                let Some(next) = edge.other(current) else {
                    continue;
                };
                if visited.insert(next) {
                    out.push((next.to_string(), depth + 1));
                    queue.push_back((next, depth + 1));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelationshipType;

    fn edge(a: &str, b: &str, score: f64) -> RelationshipEdge {
        RelationshipEdge::new(a, b, RelationshipType::Related, score)
    }

    #[test]
    fn test_edges_stored_once() {
        let g = RelationshipGraph::from_edges(vec![
            edge("a", "b", 0.5),
            edge("b", "a", 0.6),
            edge("a", "a", 0.9),
        ]);
        assert_eq!(g.len(), 1);
        assert_eq!(g.edges()[0].score, 0.6);
        assert_eq!(g.neighbors("a").len(), 1);
        assert_eq!(g.neighbors("b").len(), 1);
    }

    #[test]
    fn test_traversal_terminates_on_cycles() {
        let g = RelationshipGraph::from_edges(vec![
            edge("a", "b", 0.5),
            edge("b", "c", 0.5),
            edge("c", "a", 0.5),
            edge("c", "d", 0.5),
        ]);
        let related = g.related_items("a", 10);
        let ids: HashSet<_> = related.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["b", "c", "d"].into_iter().collect());
        let d = related.iter().find(|(id, _)| id == "d").unwrap();
        assert_eq!(d.1, 2);
    }

    #[test]
    fn test_depth_limit() {
        let g = RelationshipGraph::from_edges(vec![edge("a", "b", 0.5), edge("b", "c", 0.5)]);
        assert_eq!(g.related_items("a", 1), vec![("b".to_string(), 1)]);
        assert!(g.related_items("zzz", 3).is_empty());
    }
}
