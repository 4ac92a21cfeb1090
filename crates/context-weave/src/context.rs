//! Session-scoped work context.
//!
//! [`WorkContextTracker`] keeps the last declared [`WorkContext`] per
//! session. The outer map lock is held only long enough to find or insert
//! a session's entry; updates then lock that entry alone, so sessions never
//! contend with each other. Context lives for the session only and is not
//! persisted.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tokio::process::Command;
use tracing::{debug, warn};

use context_weave_core::models::WorkContext;

#[derive(Default)]
pub struct WorkContextTracker {
    sessions: RwLock<HashMap<String, Arc<Mutex<WorkContext>>>>,
}

impl WorkContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, session: &str) -> Arc<Mutex<WorkContext>> {
        if let Some(e) = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session)
        {
            return e.clone();
        }
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session.to_string())
            .or_default()
            .clone()
    }

    /// Store `ctx` for its session. A context older than the stored one is
    /// ignored; the return value is the context now in effect.
    pub fn update(&self, ctx: WorkContext) -> Result<WorkContext> {
        let Some(session) = ctx.session_id.clone().filter(|s| !s.trim().is_empty()) else {
            bail!("work context update requires a session id");
        };
        let entry = self.entry(&session);
        let mut current = entry.lock().unwrap_or_else(|e| e.into_inner());
        if current.session_id.is_none() || ctx.updated_at >= current.updated_at {
            *current = ctx;
        } else {
            debug!(session = %session, "ignoring stale work context update");
        }
        Ok(current.clone())
    }

    pub fn get(&self, session: &str) -> Option<WorkContext> {
        let entry = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session)
            .cloned()?;
        let ctx = entry.lock().unwrap_or_else(|e| e.into_inner()).clone();
        ctx.session_id.is_some().then_some(ctx)
    }

    pub fn clear(&self, session: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session)
            .is_some()
    }

    /// Drop sessions not updated within `max_age`. Returns how many.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        self.evict_idle_at(Utc::now(), max_age)
    }

    fn evict_idle_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, entry| {
            let ctx = entry.lock().unwrap_or_else(|e| e.into_inner());
            now - ctx.updated_at <= max_age
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Files changed on `branch` since it diverged from `base`.
pub async fn git_changed_files(repo: &Path, base: &str, branch: &str) -> Result<Vec<String>> {
    let output = Command::new("git")
        .args(["-C", &repo.to_string_lossy(), "diff", "--name-only"])
        .arg(format!("{}...{}", base, branch))
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to run git diff")?;
    if !output.status.success() {
        bail!(
            "git diff failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Like [`git_changed_files`], but a failure only costs the branch boost.
pub async fn resolve_changed_files(repo: &Path, base: &str, branch: &str) -> Vec<String> {
    match git_changed_files(repo, base, branch).await {
        Ok(files) => files,
        Err(e) => {
            warn!(repo = %repo.display(), base, branch, error = %e, "could not resolve branch changes");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(session: &str, file: &str, at: DateTime<Utc>) -> WorkContext {
        WorkContext {
            session_id: Some(session.into()),
            active_file: Some(file.into()),
            updated_at: at,
            ..Default::default()
        }
    }

    #[test]
    fn test_last_writer_wins() {
        let tracker = WorkContextTracker::new();
        let t0 = Utc::now();
        tracker.update(ctx("s1", "a.rs", t0)).unwrap();
        tracker.update(ctx("s1", "b.rs", t0 + Duration::seconds(1))).unwrap();
        // An older write arriving late does not clobber the newer one.
        let now = tracker.update(ctx("s1", "old.rs", t0 - Duration::seconds(5))).unwrap();
        assert_eq!(now.active_file.as_deref(), Some("b.rs"));
        assert_eq!(tracker.get("s1").unwrap().active_file.as_deref(), Some("b.rs"));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let tracker = WorkContextTracker::new();
        let t0 = Utc::now();
        tracker.update(ctx("s1", "a.rs", t0)).unwrap();
        tracker.update(ctx("s2", "b.rs", t0)).unwrap();
        assert_eq!(tracker.get("s1").unwrap().active_file.as_deref(), Some("a.rs"));
        assert_eq!(tracker.get("s2").unwrap().active_file.as_deref(), Some("b.rs"));
        assert!(tracker.clear("s1"));
        assert!(tracker.get("s1").is_none());
        assert!(tracker.get("s2").is_some());
    }

    #[test]
    fn test_update_requires_session() {
        let tracker = WorkContextTracker::new();
        assert!(tracker.update(WorkContext::default()).is_err());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_evict_idle() {
        let tracker = WorkContextTracker::new();
        let now = Utc::now();
        tracker.update(ctx("old", "a.rs", now - Duration::hours(2))).unwrap();
        tracker.update(ctx("fresh", "b.rs", now)).unwrap();
        assert_eq!(tracker.evict_idle_at(now, Duration::hours(1)), 1);
        assert!(tracker.get("old").is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_changed_files_outside_repo_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let files = resolve_changed_files(tmp.path(), "main", "feature").await;
        assert!(files.is_empty());
    }
}
