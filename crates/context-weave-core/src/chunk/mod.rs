//! Structure-aware chunking.
//!
//! [`Chunker::chunk`] picks a strategy from the file extension:
//!
//! - **Code** (Rust, Python, JavaScript, TypeScript/TSX, Go): tree-sitter
//!   syntactic units. See [`code`].
//! - **Prose** (Markdown, text, reStructuredText, AsciiDoc): heading and
//!   paragraph blocks carrying their heading path. See [`prose`].
//! - **Everything else**, and any source file that fails to parse:
//!   line-based sliding windows. See [`window`].
//!
//! Every chunk's text is exactly `content[start_byte..end_byte]`, and its
//! ID is a UUIDv5 over `(source_id, file_path, start_byte, end_byte)`, so
//! re-chunking unchanged content reproduces the same chunks.
//!
//! Sizes are configured in tokens and converted with a 4 chars ≈ 1 token
//! heuristic.

pub mod code;
pub mod prose;
pub mod window;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::digest::hash_content;
use crate::models::{Chunk, ChunkKind, ChunkRange};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Chunk size limits, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 700,
            overlap_tokens: 80,
        }
    }
}

impl ChunkerConfig {
    pub fn max_chars(&self) -> usize {
        (self.max_tokens * CHARS_PER_TOKEN).max(1)
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_tokens * CHARS_PER_TOKEN
    }
}

/// Languages with an AST grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Tsx,
    Go,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Tsx => "tsx",
            Self::Go => "go",
        }
    }

    pub(crate) fn grammar(&self) -> tree_sitter::Language {
        match self {
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Self::Go => tree_sitter_go::LANGUAGE.into(),
        }
    }
}

/// How a file will be chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Code(Language),
    Prose,
    Other,
}

impl FileFormat {
    pub fn chunk_kind(&self) -> ChunkKind {
        match self {
            Self::Prose => ChunkKind::Doc,
            Self::Code(_) | Self::Other => ChunkKind::Code,
        }
    }

    /// Language label stored on chunks.
    pub fn language(&self, file_path: &str) -> Option<String> {
        match self {
            Self::Code(lang) => Some(lang.as_str().to_string()),
            Self::Prose => Some("text".to_string()),
            Self::Other => extension(file_path).map(|e| e.to_ascii_lowercase()),
        }
    }
}

fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        None
    } else {
        Some(ext)
    }
}

/// Detect the chunking strategy from a path's extension.
pub fn detect_format(path: &str) -> FileFormat {
    let ext = match extension(path) {
        Some(e) => e.to_ascii_lowercase(),
        None => return FileFormat::Other,
    };
    match ext.as_str() {
        "rs" => FileFormat::Code(Language::Rust),
        "py" | "pyi" => FileFormat::Code(Language::Python),
        "js" | "jsx" | "mjs" | "cjs" => FileFormat::Code(Language::JavaScript),
        "ts" | "mts" | "cts" => FileFormat::Code(Language::TypeScript),
        "tsx" => FileFormat::Code(Language::Tsx),
        "go" => FileFormat::Code(Language::Go),
        "md" | "markdown" | "mdx" | "txt" | "rst" | "adoc" => FileFormat::Prose,
        _ => FileFormat::Other,
    }
}

/// A byte span plus the structural metadata the strategy attached to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub symbol: Option<String>,
    pub signature: Option<String>,
    pub scope: Option<String>,
    pub heading: Option<String>,
    pub part: u32,
}

impl Span {
    pub(crate) fn plain(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }
}

/// Deterministic chunk identity.
pub fn chunk_id(source_id: &str, file_path: &str, start_byte: usize, end_byte: usize) -> String {
    let key = format!("{}\0{}\0{}\0{}", source_id, file_path, start_byte, end_byte);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// Splits files into [`Chunk`]s.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk one file. Whitespace-only files produce no chunks.
    pub fn chunk(&self, source_id: &str, file_path: &str, content: &str) -> Vec<Chunk> {
        let format = detect_format(file_path);
        let spans = self.spans(format, file_path, content);
        let lines = LineIndex::new(content);
        let language = format.language(file_path);
        let now = Utc::now();

        spans
            .into_iter()
            .filter(|s| s.end > s.start && !content[s.start..s.end].trim().is_empty())
            .map(|s| {
                let text = content[s.start..s.end].to_string();
                Chunk {
                    id: chunk_id(source_id, file_path, s.start, s.end),
                    source_id: source_id.to_string(),
                    file_path: file_path.to_string(),
                    range: ChunkRange {
                        start_byte: s.start,
                        end_byte: s.end,
                        start_line: lines.line_of(s.start),
                        end_line: lines.line_of(s.end - 1),
                    },
                    kind: format.chunk_kind(),
                    language: language.clone(),
                    symbol: s.symbol,
                    signature: s.signature,
                    scope: s.scope,
                    heading: s.heading,
                    part: s.part,
                    content_hash: hash_content(text.as_bytes()),
                    enriched_text: text.clone(),
                    text,
                    parent_summary: String::new(),
                    updated_at: now,
                }
            })
            .collect()
    }

    fn spans(&self, format: FileFormat, file_path: &str, content: &str) -> Vec<Span> {
        if content.trim().is_empty() {
            return Vec::new();
        }
        match format {
            FileFormat::Code(lang) => match code::split(lang, content, &self.config) {
                Ok(spans) => spans,
                Err(reason) => {
                    debug!(file = file_path, %reason, "AST chunking failed, using sliding window");
                    window::split(content, &self.config)
                }
            },
            FileFormat::Prose => prose::split(content, &self.config),
            FileFormat::Other => window::split(content, &self.config),
        }
    }
}

/// Byte offset → 1-based line number.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(content: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(content.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    fn line_of(&self, byte: usize) -> usize {
        self.starts.partition_point(|&s| s <= byte)
    }
}

/// Pack consecutive segments into windows of at most `max` bytes.
///
/// Each new window restarts on trailing segments of the previous one
/// while they fit in `overlap` bytes, but always advances by at least one
/// segment. A single segment larger than `max` becomes its own window;
/// callers hard-split those.
pub(crate) fn pack(segments: &[(usize, usize)], max: usize, overlap: usize) -> Vec<(usize, usize)> {
    let n = segments.len();
    if n == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut first = 0;
    for idx in 1..n {
        if segments[idx].1 - segments[first].0 <= max {
            continue;
        }
        let end = segments[idx - 1].1;
        out.push((segments[first].0, end));
        let mut next = idx;
        while next > first + 1 && end - segments[next - 1].0 <= overlap {
            next -= 1;
        }
        if segments[idx].1 - segments[next].0 > max {
            next = idx;
        }
        first = next;
    }
    out.push((segments[first].0, segments[n - 1].1));
    out
}

/// Split `content[start..end]` into pieces of at most `max` bytes, cutting
/// at the last newline or space before the limit and always on a char
/// boundary.
pub(crate) fn hard_split(content: &str, start: usize, end: usize, max: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut pos = start;
    while pos < end {
        if end - pos <= max {
            out.push((pos, end));
            break;
        }
        let limit = floor_char_boundary(content, pos + max);
        let window = &content[pos..limit];
        let mut cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|i| pos + i + 1)
            .unwrap_or(limit);
        if cut <= pos {
            cut = content[pos..]
                .char_indices()
                .nth(1)
                .map(|(i, _)| pos + i)
                .unwrap_or(end);
        }
        out.push((pos, cut));
        pos = cut;
    }
    out
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("src/lib.rs"), FileFormat::Code(Language::Rust));
        assert_eq!(detect_format("a/b.tsx"), FileFormat::Code(Language::Tsx));
        assert_eq!(detect_format("README.md"), FileFormat::Prose);
        assert_eq!(detect_format("notes.TXT"), FileFormat::Prose);
        assert_eq!(detect_format("Makefile"), FileFormat::Other);
        assert_eq!(detect_format(".gitignore"), FileFormat::Other);
        assert_eq!(detect_format("config.yaml"), FileFormat::Other);
    }

    #[test]
    fn test_chunk_id_deterministic() {
        let a = chunk_id("repo", "src/a.rs", 0, 10);
        let b = chunk_id("repo", "src/a.rs", 0, 10);
        let c = chunk_id("repo", "src/a.rs", 0, 11);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_chunk_text_matches_range() {
        let content = "# Title\n\nFirst paragraph.\n\n## Sub\n\nSecond.\n";
        let chunks = Chunker::default().chunk("docs", "guide.md", content);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert_eq!(c.text, &content[c.range.start_byte..c.range.end_byte]);
            assert!(c.range.start_line >= 1);
            assert!(c.range.end_line >= c.range.start_line);
        }
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let content = "fn a() { 1 }\n\nfn b() { 2 }\n";
        let chunker = Chunker::default();
        let first: Vec<_> = chunker
            .chunk("r", "x.rs", content)
            .into_iter()
            .map(|c| (c.id, c.text))
            .collect();
        let second: Vec<_> = chunker
            .chunk("r", "x.rs", content)
            .into_iter()
            .map(|c| (c.id, c.text))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_content_no_chunks() {
        assert!(Chunker::default().chunk("r", "a.md", "").is_empty());
        assert!(Chunker::default().chunk("r", "a.rs", "  \n\n ").is_empty());
    }

    #[test]
    fn test_line_index() {
        let idx = LineIndex::new("ab\ncd\n\nef");
        assert_eq!(idx.line_of(0), 1);
        assert_eq!(idx.line_of(2), 1);
        assert_eq!(idx.line_of(3), 2);
        assert_eq!(idx.line_of(6), 3);
        assert_eq!(idx.line_of(7), 4);
    }

    #[test]
    fn test_pack_respects_max_and_overlap() {
        let segs: Vec<(usize, usize)> = (0..10).map(|i| (i * 10, i * 10 + 10)).collect();
        let windows = pack(&segs, 30, 10);
        assert_eq!(windows[0], (0, 30));
        assert_eq!(windows[1], (20, 50));
        for w in &windows {
            assert!(w.1 - w.0 <= 30);
        }
        assert_eq!(windows.last().unwrap().1, 100);
    }

    #[test]
    fn test_pack_oversized_segment_alone() {
        let segs = vec![(0, 5), (5, 100), (100, 105)];
        let windows = pack(&segs, 20, 0);
        assert_eq!(windows, vec![(0, 5), (5, 100), (100, 105)]);
    }

    #[test]
    fn test_hard_split_char_boundaries() {
        let s = "héllo wörld ünïcode";
        let pieces = hard_split(s, 0, s.len(), 5);
        let rebuilt: String = pieces.iter().map(|(a, b)| &s[*a..*b]).collect();
        assert_eq!(rebuilt, s);
        for (a, b) in pieces {
            assert!(b - a <= 5);
        }
    }
}
