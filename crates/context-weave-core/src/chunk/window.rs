//! Fixed-size sliding-window chunker.
//!
//! The fallback for unknown formats and for source files that do not
//! parse. Windows are built from whole lines up to `max_chars` and
//! overlap by up to `overlap_chars` of trailing lines. Lines longer than
//! the limit are hard-split first.

use super::{hard_split, pack, ChunkerConfig, Span};

/// Window the whole of `content`.
pub fn split(content: &str, config: &ChunkerConfig) -> Vec<Span> {
    split_range(content, 0, content.len(), config)
        .into_iter()
        .map(|(start, end)| Span::plain(start, end))
        .collect()
}

/// Window `content[start..end]`, returning byte ranges.
pub fn split_range(
    content: &str,
    start: usize,
    end: usize,
    config: &ChunkerConfig,
) -> Vec<(usize, usize)> {
    let max = config.max_chars();
    let mut segments = Vec::new();
    for (line_start, line_end) in line_ranges(content, start, end) {
        if line_end - line_start > max {
            segments.extend(hard_split(content, line_start, line_end, max));
        } else {
            segments.push((line_start, line_end));
        }
    }
    pack(&segments, max, config.overlap_chars())
        .into_iter()
        .map(|(s, e)| trim_trailing_newlines(content, s, e))
        .filter(|(s, e)| e > s)
        .collect()
}

/// Line ranges within `[start, end)`, each including its trailing `\n`.
fn line_ranges(content: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut pos = start;
    while pos < end {
        let line_end = content[pos..end]
            .find('\n')
            .map(|i| pos + i + 1)
            .unwrap_or(end);
        out.push((pos, line_end));
        pos = line_end;
    }
    out
}

fn trim_trailing_newlines(content: &str, start: usize, mut end: usize) -> (usize, usize) {
    while end > start && matches!(content.as_bytes()[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    (start, end)
}
