//! Content hashing and Merkle-style change detection.
//!
//! A [`TreeDigest`] maps every file path under an indexed root to the
//! SHA-256 of its content, plus an aggregate hash per directory and one
//! for the whole root. Diffing two digests walks both sorted maps in
//! lockstep; whenever a directory hashes identically on both sides the
//! walk re-seeks past it, so unchanged subtrees cost one comparison.
//!
//! Hashes depend on file content only. Timestamps and permissions never
//! enter the digest, so touching a file does not make it "modified".

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`.
pub fn hash_content(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Snapshot of per-file content hashes for one indexed root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDigest {
    /// `/`-separated relative path → content hash.
    pub files: BTreeMap<String, String>,
    /// Directory path → aggregate hash over all files beneath it.
    pub dirs: BTreeMap<String, String>,
    /// Aggregate hash over the full sorted mapping.
    pub root_hash: String,
}

impl Default for TreeDigest {
    fn default() -> Self {
        Self::from_files(BTreeMap::new())
    }
}

impl TreeDigest {
    /// Build a digest from a path → content-hash map.
    pub fn from_files(files: BTreeMap<String, String>) -> Self {
        let (dirs, root_hash) = aggregate(&files);
        Self {
            files,
            dirs,
            root_hash,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Recompute the aggregates and compare them with the stored ones.
    ///
    /// A mismatch means the persisted digest was truncated or tampered with
    /// and must not be used for an incremental diff.
    pub fn verify(&self) -> bool {
        let (dirs, root_hash) = aggregate(&self.files);
        dirs == self.dirs && root_hash == self.root_hash
    }
}

/// Feed entries into every ancestor directory's hasher and the root hasher.
/// Entries arrive sorted, so each directory sees its files in order.
fn aggregate(files: &BTreeMap<String, String>) -> (BTreeMap<String, String>, String) {
    let mut root = Sha256::new();
    let mut dir_hashers: HashMap<String, Sha256> = HashMap::new();

    for (path, hash) in files {
        let entry = format!("{}\0{}\n", path, hash);
        root.update(entry.as_bytes());
        for dir in ancestors(path) {
            dir_hashers
                .entry(dir.to_string())
                .or_default()
                .update(entry.as_bytes());
        }
    }

    let dirs = dir_hashers
        .into_iter()
        .map(|(dir, h)| (dir, format!("{:x}", h.finalize())))
        .collect();
    (dirs, format!("{:x}", root.finalize()))
}

/// Ancestor directories of `path`, outermost first: `a/b/c.rs` → `a`, `a/b`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

/// First key strictly after every path under `dir/`.
///
/// `'0'` is the byte right after `'/'`, so `dir0` sorts after all of
/// `dir/...` and before nothing else that shares the `dir` prefix.
fn seek_past(dir: &str) -> String {
    format!("{}0", dir)
}

/// Minimal set of paths that differ between two digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// Paths that need re-chunking (added ∪ modified), sorted.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

/// Diff two digests.
pub fn diff(previous: &TreeDigest, current: &TreeDigest) -> ChangeSet {
    diff_counted(previous, current).0
}

/// Diff and also report how many map entries the walk visited.
pub(crate) fn diff_counted(previous: &TreeDigest, current: &TreeDigest) -> (ChangeSet, usize) {
    let mut changes = ChangeSet::default();
    if previous.root_hash == current.root_hash {
        return (changes, 0);
    }

    let mut visited = 0usize;
    let mut lower: Bound<String> = Bound::Unbounded;

    loop {
        let prev = previous
            .files
            .range((lower.clone(), Bound::Unbounded))
            .next();
        let cur = current.files.range((lower.clone(), Bound::Unbounded)).next();
        visited += 1;

        match (prev, cur) {
            (None, None) => break,
            (Some((path, _)), None) => {
                changes.removed.push(path.clone());
                lower = Bound::Excluded(path.clone());
            }
            (None, Some((path, _))) => {
                changes.added.push(path.clone());
                lower = Bound::Excluded(path.clone());
            }
            (Some((p_path, p_hash)), Some((c_path, c_hash))) => {
                if p_path < c_path {
                    changes.removed.push(p_path.clone());
                    lower = Bound::Excluded(p_path.clone());
                } else if c_path < p_path {
                    changes.added.push(c_path.clone());
                    lower = Bound::Excluded(c_path.clone());
                } else if let Some(dir) = unchanged_ancestor(previous, current, p_path) {
                    lower = Bound::Included(seek_past(dir));
                } else {
                    if p_hash != c_hash {
                        changes.modified.push(p_path.clone());
                    }
                    lower = Bound::Excluded(p_path.clone());
                }
            }
        }
    }

    (changes, visited)
}

/// Outermost ancestor directory of `path` whose aggregate is identical in
/// both digests.
fn unchanged_ancestor<'a>(
    previous: &TreeDigest,
    current: &TreeDigest,
    path: &'a str,
) -> Option<&'a str> {
    ancestors(path).find(|dir| match (previous.dirs.get(*dir), current.dirs.get(*dir)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    })
}
