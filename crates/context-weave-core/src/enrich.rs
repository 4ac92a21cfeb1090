//! Context enrichment before embedding.
//!
//! A chunk embedded on its own loses the context around it ("this method"
//! without the class it belongs to). [`ContextEnricher`] builds a short,
//! deterministic summary of the parent file and prepends it, together with
//! the chunk's own scope/signature/heading, to the chunk text. The result is
//! stored verbatim as `Chunk::enriched_text` so re-embedding reproduces
//! the same input.
//!
//! Summary layout (truncated at a word boundary to `summary_max_chars`):
//!
//! ```text
//! File: src/auth/jwt.rs (rust). Validates and issues JWTs. Defines: Claims, sign, verify.
//! ```
//!
//! No network or model calls are involved.

use crate::models::{Chunk, ChunkKind};

/// Default summary budget, ≈ 100 tokens.
pub const DEFAULT_SUMMARY_MAX_CHARS: usize = 400;

const MAX_LEAD_CHARS: usize = 200;
const MAX_OUTLINE_ENTRIES: usize = 24;

/// The file a chunk came from, reduced to what the summary needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentDocument {
    pub path: String,
    pub language: Option<String>,
    pub kind: ChunkKind,
    pub content: String,
    /// Symbol names (code) or section titles (prose), in file order.
    pub outline: Vec<String>,
}

impl ParentDocument {
    /// Build a parent document from a file and the chunks cut from it.
    pub fn from_chunks(path: &str, content: &str, chunks: &[Chunk]) -> Self {
        let kind = chunks.first().map(|c| c.kind).unwrap_or(ChunkKind::Code);
        let language = chunks.first().and_then(|c| c.language.clone());
        let mut outline: Vec<String> = Vec::new();
        for chunk in chunks {
            let entry = match kind {
                ChunkKind::Code => chunk.symbol.clone(),
                ChunkKind::Doc => chunk
                    .heading
                    .as_deref()
                    .and_then(|h| h.rsplit(" > ").next())
                    .map(str::to_string),
            };
            if let Some(entry) = entry {
                if !outline.contains(&entry) {
                    outline.push(entry);
                }
            }
        }
        Self {
            path: path.to_string(),
            language,
            kind,
            content: content.to_string(),
            outline,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextEnricher {
    summary_max_chars: usize,
}

impl Default for ContextEnricher {
    fn default() -> Self {
        Self::new(DEFAULT_SUMMARY_MAX_CHARS)
    }
}

impl ContextEnricher {
    pub fn new(summary_max_chars: usize) -> Self {
        Self {
            summary_max_chars: summary_max_chars.max(32),
        }
    }

    /// Deterministic one-paragraph description of `parent`.
    pub fn summarize(&self, parent: &ParentDocument) -> String {
        let mut parts = Vec::new();
        match &parent.language {
            Some(lang) => parts.push(format!("File: {} ({}).", parent.path, lang)),
            None => parts.push(format!("File: {}.", parent.path)),
        }

        let lead = match parent.kind {
            ChunkKind::Code => leading_comment(&parent.content),
            ChunkKind::Doc => leading_paragraph(&parent.content),
        };
        if let Some(lead) = lead {
            parts.push(first_sentence(&lead));
        }

        if !parent.outline.is_empty() {
            let label = match parent.kind {
                ChunkKind::Code => "Defines",
                ChunkKind::Doc => "Sections",
            };
            let entries: Vec<&str> = parent
                .outline
                .iter()
                .take(MAX_OUTLINE_ENTRIES)
                .map(String::as_str)
                .collect();
            parts.push(format!("{}: {}.", label, entries.join(", ")));
        }

        truncate_words(&parts.join(" "), self.summary_max_chars)
    }

    /// Attach the parent summary and build the text sent to the embedder.
    pub fn enrich(&self, mut chunk: Chunk, parent: &ParentDocument) -> Chunk {
        let summary = self.summarize(parent);
        chunk.enriched_text = compose(&summary, &chunk);
        chunk.parent_summary = summary;
        chunk
    }

    /// Enrich every chunk of one file, summarizing the parent once.
    pub fn enrich_all(&self, chunks: Vec<Chunk>, parent: &ParentDocument) -> Vec<Chunk> {
        let summary = self.summarize(parent);
        chunks
            .into_iter()
            .map(|mut c| {
                c.enriched_text = compose(&summary, &c);
                c.parent_summary = summary.clone();
                c
            })
            .collect()
    }
}

fn compose(summary: &str, chunk: &Chunk) -> String {
    let mut header = vec![summary.to_string()];
    if let Some(scope) = &chunk.scope {
        header.push(format!("Scope: {}", scope));
    }
    if let Some(sig) = &chunk.signature {
        header.push(format!("Signature: {}", sig));
    }
    if let Some(heading) = &chunk.heading {
        header.push(format!("Section: {}", heading));
    }
    if chunk.part > 0 {
        header.push(format!("Part: {}", chunk.part + 1));
    }
    format!("{}\n\n{}", header.join("\n"), chunk.text)
}

/// Text of the comment block at the top of a source file, markers removed.
fn leading_comment(content: &str) -> Option<String> {
    let mut lines = Vec::new();
    let mut in_docstring: Option<&str> = None;

    for raw in content.lines() {
        let line = raw.trim();
        if let Some(delim) = in_docstring {
            if let Some(pos) = line.find(delim) {
                lines.push(line[..pos].to_string());
                break;
            }
            lines.push(line.to_string());
            continue;
        }
        if lines.is_empty() && (line.is_empty() || line.starts_with("#!")) {
            continue;
        }
        if let Some(delim) = ["\"\"\"", "'''"].into_iter().find(|d| line.starts_with(*d)) {
            if !lines.is_empty() {
                break;
            }
            let rest = &line[3..];
            if let Some(pos) = rest.find(delim) {
                lines.push(rest[..pos].to_string());
                break;
            }
            lines.push(rest.to_string());
            in_docstring = Some(delim);
            continue;
        }
        if line.starts_with("#[") {
            break;
        }
        let stripped = ["//!", "///", "//", "/**", "/*", "*/", "*", "#"]
            .into_iter()
            .find_map(|m| line.strip_prefix(m));
        match stripped {
            Some(text) => lines.push(text.trim_end_matches("*/").trim().to_string()),
            None => break,
        }
    }

    let text = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// First paragraph of prose that is not a heading or fence.
fn leading_paragraph(content: &str) -> Option<String> {
    let mut lines = Vec::new();
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            break;
        }
        if line.starts_with('#') || line.starts_with("```") || line.starts_with("~~~") {
            if lines.is_empty() {
                continue;
            }
            break;
        }
        lines.push(line);
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join(" "))
    }
}

fn first_sentence(text: &str) -> String {
    let end = text
        .find(". ")
        .map(|i| i + 1)
        .unwrap_or(text.len());
    let sentence = truncate_words(&text[..end], MAX_LEAD_CHARS);
    if sentence.ends_with(['.', '!', '?']) {
        sentence
    } else {
        format!("{}.", sentence)
    }
}

/// Truncate at the last word boundary that fits in `max` bytes.
fn truncate_words(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = &text[..cut];
    match head.rfind(' ') {
        Some(i) if i > 0 => head[..i].trim_end_matches([',', ' ']).to_string(),
        _ => head.to_string(),
    }
}
