//! File discovery for an indexed root.
//!
//! Walks the root with `walkdir`, applies include/exclude globs, and hashes
//! each file's content. Non-UTF-8 files are skipped: they have no chunkable
//! text. Paths in the result are `/`-separated and relative to the root, so
//! digests stay portable across platforms.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use context_weave_core::digest::{hash_content, TreeDigest};

use crate::config::RootConfig;

/// Always excluded, on top of a root's own `exclude_globs`.
pub const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Clone)]
pub struct ScannedRoot {
    pub name: String,
    pub base: PathBuf,
    /// Relative path → content hash.
    pub files: BTreeMap<String, String>,
    /// Files skipped as non-UTF-8, oversized, or unreadable.
    pub skipped: usize,
}

impl ScannedRoot {
    pub fn digest(&self) -> TreeDigest {
        TreeDigest::from_files(self.files.clone())
    }

    pub fn absolute(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// `/`-joined relative path, or `None` for paths escaping the root.
pub fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for c in rel.components() {
        match c {
            Component::Normal(p) => parts.push(p.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub struct RootFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl RootFilter {
    pub fn new(root: &RootConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(root.exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(&root.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn matches(&self, rel: &str) -> bool {
        self.include.is_match(rel) && !self.exclude.is_match(rel)
    }
}

/// Read a file as UTF-8 text. `Ok(None)` when it is not valid UTF-8.
pub fn read_text(path: &Path) -> Result<Option<String>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8(bytes).ok())
}

pub fn scan_root(root: &RootConfig) -> Result<ScannedRoot> {
    let base = root.path.clone();
    if !base.is_dir() {
        anyhow::bail!("index root '{}' is not a directory: {}", root.name, base.display());
    }
    let filter = RootFilter::new(root)?;
    let mut files = BTreeMap::new();
    let mut skipped = 0usize;

    for entry in WalkDir::new(&base).follow_links(root.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_path(&base, entry.path()) else {
            continue;
        };
        if !filter.matches(&rel) {
            continue;
        }
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if len > root.max_file_bytes {
            debug!(root = %root.name, file = %rel, bytes = len, "skipping oversized file");
            skipped += 1;
            continue;
        }
        match read_text(entry.path()) {
            Ok(Some(text)) => {
                files.insert(rel, hash_content(text.as_bytes()));
            }
            Ok(None) => {
                debug!(root = %root.name, file = %rel, "skipping non-UTF-8 file");
                skipped += 1;
            }
            Err(e) => {
                debug!(root = %root.name, file = %rel, error = %e, "skipping unreadable file");
                skipped += 1;
            }
        }
    }

    Ok(ScannedRoot {
        name: root.name.clone(),
        base,
        files,
        skipped,
    })
}
