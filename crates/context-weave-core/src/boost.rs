//! Work-context boosting.
//!
//! After fusion, candidates related to what the caller is working on get a
//! multiplicative boost:
//!
//! | Signal | Default factor |
//! |--------|----------------|
//! | path is the active file | 1.2 |
//! | path is in the branch's changed-file set | 1.1 |
//! | text or path mentions an open ticket ID | 1.15 |
//!
//! Matching factors multiply, and the product is clamped to `max_factor`
//! (at most 1.5), so `boosted <= fused * max_factor` always holds and a
//! boosted weak match cannot leapfrog a much stronger unboosted one.

use serde::{Deserialize, Serialize};

use crate::fusion::compare_candidates;
use crate::models::{Item, RetrievalCandidate, WorkContext};

/// Hard ceiling on `max_factor`.
pub const MAX_BOOST_CEILING: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    #[serde(default = "default_active_file")]
    pub active_file: f64,
    #[serde(default = "default_branch_file")]
    pub branch_file: f64,
    #[serde(default = "default_ticket")]
    pub ticket: f64,
    #[serde(default = "default_max_factor")]
    pub max_factor: f64,
}

fn default_active_file() -> f64 {
    1.2
}

fn default_branch_file() -> f64 {
    1.1
}

fn default_ticket() -> f64 {
    1.15
}

fn default_max_factor() -> f64 {
    MAX_BOOST_CEILING
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            active_file: default_active_file(),
            branch_file: default_branch_file(),
            ticket: default_ticket(),
            max_factor: default_max_factor(),
        }
    }
}

impl BoostParams {
    fn cap(&self) -> f64 {
        self.max_factor.clamp(1.0, MAX_BOOST_CEILING)
    }
}

/// Combined, clamped boost factor for content at `file_path` with `text`.
pub fn boost_factor(
    ctx: &WorkContext,
    file_path: Option<&str>,
    text: &str,
    params: &BoostParams,
) -> f64 {
    let mut factor = 1.0;

    if let Some(path) = file_path {
        if ctx
            .active_file
            .as_deref()
            .is_some_and(|active| paths_match(active, path))
        {
            factor *= params.active_file;
        }
        if ctx.changed_files.iter().any(|c| paths_match(c, path)) {
            factor *= params.branch_file;
        }
    }

    if ctx.open_ticket_ids.iter().any(|t| {
        mentions(text, t) || file_path.is_some_and(|p| mentions(p, t))
    }) {
        factor *= params.ticket;
    }

    factor.clamp(1.0, params.cap())
}

/// Boost candidates in place and re-sort them by boosted score.
pub fn apply_boost(candidates: &mut [RetrievalCandidate], ctx: &WorkContext, params: &BoostParams) {
    if ctx.is_empty() {
        return;
    }
    for c in candidates.iter_mut() {
        let factor = boost_factor(ctx, c.metadata.file_path.as_deref(), &c.metadata.text, params);
        c.boost_factor = factor;
        c.boosted_score = c.fused_score * factor;
    }
    candidates.sort_by(compare_candidates);
}

/// Boost a connector item's score in place. Returns the factor applied.
pub fn boost_item(item: &mut Item, ctx: &WorkContext, params: &BoostParams) -> f64 {
    if ctx.is_empty() {
        return 1.0;
    }
    let text = match &item.title {
        Some(title) => format!("{}\n{}", title, item.body),
        None => item.body.clone(),
    };
    let factor = boost_factor(ctx, item.file_path.as_deref(), &text, params);
    item.score *= factor;
    factor
}

fn normalize_path(p: &str) -> &str {
    p.trim_start_matches("./").trim_end_matches('/')
}

/// Equal, or one path is the other with a leading directory prefix
/// (`/home/me/repo/src/a.rs` vs `src/a.rs`).
fn paths_match(a: &str, b: &str) -> bool {
    let a = normalize_path(a);
    let b = normalize_path(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (long, short) = if a.len() > b.len() { (a, b) } else { (b, a) };
    long.ends_with(short) && long.as_bytes()[long.len() - short.len() - 1] == b'/'
}

/// Case-insensitive whole-token occurrence of `needle` in `haystack`.
fn mentions(haystack: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    let hay = haystack.to_lowercase();
    let needle = needle.to_lowercase();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    hay.match_indices(&needle).any(|(i, m)| {
        let before = hay[..i].chars().next_back();
        let after = hay[i + m.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}
