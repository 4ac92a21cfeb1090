//! Core data models used throughout context-weave.
//!
//! These types represent the chunks written by the indexing pipeline, the
//! items returned by connectors, and the candidates, relationship edges, and
//! merged results that flow through retrieval and federation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a chunk came from source code or from prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Code,
    Doc,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Doc => "doc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(Self::Code),
            "doc" => Some(Self::Doc),
            _ => None,
        }
    }
}

/// Location of a chunk inside its file.
///
/// Byte offsets are half-open (`start_byte..end_byte`); lines are 1-based
/// and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
}

/// A logical, independently embeddable fragment of a file.
///
/// `id` is derived from `(source_id, file_path, range)` so re-chunking
/// unchanged content reproduces the same IDs. `enriched_text` is exactly
/// what was sent to the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// Name of the indexed root this chunk belongs to.
    pub source_id: String,
    /// Path relative to the root, `/`-separated.
    pub file_path: String,
    pub range: ChunkRange,
    pub kind: ChunkKind,
    pub language: Option<String>,
    /// Name of the syntactic unit (function, class, ...) for code chunks.
    pub symbol: Option<String>,
    /// Unit header up to its body, whitespace-collapsed.
    pub signature: Option<String>,
    /// Enclosing scope, e.g. `impl Foo` or `class Bar`.
    pub scope: Option<String>,
    /// Heading path for prose chunks, e.g. `Guide > Install`.
    pub heading: Option<String>,
    /// Part index when an oversized unit was split; 0 otherwise.
    pub part: u32,
    pub text: String,
    pub enriched_text: String,
    pub parent_summary: String,
    /// SHA-256 of `text`.
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// A unit of content eligible for federation: either an indexed chunk or a
/// record returned by a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Globally unique within one query (chunk ID or `{source}:{source_id}`).
    pub id: String,
    /// Source label, e.g. `index:repo` or `git_log:history`.
    pub source: String,
    /// Identifier inside the source (commit SHA, ticket key, chunk ID).
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub body: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub file_path: Option<String>,
    pub kind: Option<ChunkKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Relevance score, `[0.0, 1.0]` before work-context boosting.
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Item {
    /// Build an item with the conventional `{source}:{source_id}` ID.
    pub fn new(source: &str, source_id: &str, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}:{}", source, source_id),
            source: source.to_string(),
            source_id: source_id.to_string(),
            source_url: None,
            title: None,
            body: body.into(),
            authors: Vec::new(),
            tags: Vec::new(),
            file_path: None,
            kind: None,
            created_at: now,
            updated_at: now,
            score: 0.0,
            metadata: serde_json::Value::Null,
        }
    }
}

/// The caller's declared focus, used to bias ranking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkContext {
    pub session_id: Option<String>,
    pub active_file: Option<String>,
    pub git_branch: Option<String>,
    #[serde(default)]
    pub open_ticket_ids: Vec<String>,
    /// Files changed on the active branch (supplied or resolved from git).
    #[serde(default)]
    pub changed_files: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkContext {
    pub fn is_empty(&self) -> bool {
        self.active_file.is_none()
            && self.git_branch.is_none()
            && self.open_ticket_ids.is_empty()
            && self.changed_files.is_empty()
    }
}

/// A per-query candidate produced by stage-1 retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalCandidate {
    pub id: String,
    pub source: String,
    /// Normalized keyword score, if the candidate was in the sparse list.
    pub sparse_score: Option<f64>,
    /// Normalized vector score, if the candidate was in the dense list.
    pub dense_score: Option<f64>,
    pub fused_score: f64,
    pub boosted_score: f64,
    /// Factor actually applied (already clamped).
    pub boost_factor: f64,
    pub metadata: CandidateMetadata,
}

/// Hydrated chunk fields attached to a candidate after fusion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandidateMetadata {
    pub file_path: Option<String>,
    pub symbol: Option<String>,
    pub heading: Option<String>,
    pub text: String,
}

/// Relationship classification between two items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    Duplicate,
    Related,
    Reference,
    Unrelated,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Related => "related",
            Self::Reference => "reference",
            Self::Unrelated => "unrelated",
        }
    }
}

/// An undirected edge between two items, stored with `item_a < item_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub item_a: String,
    pub item_b: String,
    #[serde(rename = "type")]
    pub kind: RelationshipType,
    pub score: f64,
}

impl RelationshipEdge {
    /// Create an edge with the endpoints in canonical order.
    pub fn new(a: &str, b: &str, kind: RelationshipType, score: f64) -> Self {
        let (item_a, item_b) = if a <= b { (a, b) } else { (b, a) };
        Self {
            item_a: item_a.to_string(),
            item_b: item_b.to_string(),
            kind,
            score,
        }
    }

    /// The endpoint opposite `id`, if `id` is one of the endpoints.
    pub fn other(&self, id: &str) -> Option<&str> {
        if self.item_a == id {
            Some(&self.item_b)
        } else if self.item_b == id {
            Some(&self.item_a)
        } else {
            None
        }
    }

    pub fn touches(&self, id: &str) -> bool {
        self.item_a == id || self.item_b == id
    }
}

/// One contributing source of a [`MergedResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub source: String,
    pub item_id: String,
    pub source_id: String,
    pub source_url: Option<String>,
    /// The contributor's score before merging.
    pub score: f64,
}

/// A result reachable through the relationship graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedItem {
    pub id: String,
    /// Edges between the two results; 1 means directly linked.
    pub hops: usize,
}

/// The unit returned to callers.
///
/// `sources` always contains the canonical item's own source first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedResult {
    pub canonical: Item,
    pub sources: Vec<SourceAttribution>,
    pub relationships: Vec<RelationshipEdge>,
    /// Other results within `see_also_depth` hops, nearest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedItem>,
    pub score: f64,
    /// Calibrated score from the reranker, when reranking succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_canonical_order() {
        let e1 = RelationshipEdge::new("b", "a", RelationshipType::Related, 0.5);
        let e2 = RelationshipEdge::new("a", "b", RelationshipType::Related, 0.5);
        assert_eq!(e1, e2);
        assert_eq!(e1.item_a, "a");
        assert_eq!(e1.other("a"), Some("b"));
        assert_eq!(e1.other("c"), None);
    }

    #[test]
    fn test_chunk_kind_parse() {
        assert_eq!(ChunkKind::parse("code"), Some(ChunkKind::Code));
        assert_eq!(ChunkKind::parse("doc"), Some(ChunkKind::Doc));
        assert_eq!(ChunkKind::parse("pdf"), None);
    }

    #[test]
    fn test_edge_serializes_type_field() {
        let e = RelationshipEdge::new("x", "y", RelationshipType::Duplicate, 0.95);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "duplicate");
    }
}
