//! Paragraph/section chunker for prose.
//!
//! The file is read as a sequence of blocks: ATX headings (`# Title`) and
//! paragraphs (runs of non-blank lines; fenced code blocks stay whole).
//! Each heading opens a new section, and chunks never span two sections.
//! Within a section, consecutive blocks are packed up to `max_chars`.
//! Every chunk carries the heading path of its section, e.g.
//! `Guide > Install`.

use super::{hard_split, pack, ChunkerConfig, Span};

#[derive(Debug)]
struct Block {
    start: usize,
    end: usize,
    heading: Option<(usize, String)>,
}

pub fn split(content: &str, config: &ChunkerConfig) -> Vec<Span> {
    let max = config.max_chars();
    let mut spans = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut section: Vec<(usize, usize)> = Vec::new();
    let mut path: Option<String> = None;

    for block in blocks(content) {
        if let Some((level, title)) = block.heading {
            flush_section(content, &section, path.as_deref(), max, &mut spans);
            section.clear();
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, title));
            path = Some(
                stack
                    .iter()
                    .map(|(_, t)| t.as_str())
                    .collect::<Vec<_>>()
                    .join(" > "),
            );
        }
        section.push((block.start, block.end));
    }
    flush_section(content, &section, path.as_deref(), max, &mut spans);
    spans
}

fn flush_section(
    content: &str,
    blocks: &[(usize, usize)],
    heading: Option<&str>,
    max: usize,
    out: &mut Vec<Span>,
) {
    let mut segments = Vec::new();
    for &(start, end) in blocks {
        if end - start > max {
            segments.extend(hard_split(content, start, end, max));
        } else {
            segments.push((start, end));
        }
    }
    for (start, end) in pack(&segments, max, 0) {
        let (start, end) = trim_range(content, start, end);
        if end > start {
            out.push(Span {
                start,
                end,
                heading: heading.map(str::to_string),
                ..Default::default()
            });
        }
    }
}

fn trim_range(content: &str, mut start: usize, mut end: usize) -> (usize, usize) {
    let bytes = content.as_bytes();
    while start < end && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    (start, end)
}

fn blocks(content: &str) -> Vec<Block> {
    let mut out = Vec::new();
    let mut para: Option<(usize, usize)> = None;
    let mut in_fence = false;
    let mut pos = 0;

    while pos < content.len() {
        let next = content[pos..]
            .find('\n')
            .map(|i| pos + i + 1)
            .unwrap_or(content.len());
        let line_end = content[pos..next].trim_end_matches(['\n', '\r']).len() + pos;
        let line = &content[pos..line_end];
        let trimmed = line.trim();

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            extend(&mut para, pos, line_end);
        } else if in_fence {
            extend(&mut para, pos, line_end);
        } else if trimmed.is_empty() {
            flush(&mut para, &mut out);
        } else if let Some(heading) = atx_heading(line) {
            flush(&mut para, &mut out);
            out.push(Block {
                start: pos,
                end: line_end,
                heading: Some(heading),
            });
        } else {
            extend(&mut para, pos, line_end);
        }
        pos = next;
    }
    flush(&mut para, &mut out);
    out
}

fn extend(para: &mut Option<(usize, usize)>, start: usize, end: usize) {
    match para {
        Some((_, e)) => *e = end,
        None => *para = Some((start, end)),
    }
}

fn flush(para: &mut Option<(usize, usize)>, out: &mut Vec<Block>) {
    if let Some((start, end)) = para.take() {
        out.push(Block {
            start,
            end,
            heading: None,
        });
    }
}

/// Parse `#`..`######` headings; returns `(level, title)`.
fn atx_heading(line: &str) -> Option<(usize, String)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let level = rest.len() - rest.trim_start_matches('#').len();
    if level == 0 || level > 6 {
        return None;
    }
    let after = &rest[level..];
    if !after.is_empty() && !after.starts_with([' ', '\t']) {
        return None;
    }
    let title = after.trim().trim_end_matches('#').trim_end().to_string();
    if title.is_empty() {
        return None;
    }
    Some((level, title))
}
