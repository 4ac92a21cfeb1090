//! Background indexing service.
//!
//! [`IndexService::trigger_reindex`] spawns a job and returns its
//! [`JobId`] immediately; callers poll [`IndexService::job`] or await
//! [`IndexService::wait`]. Passes over the same root are serialized, so a
//! watcher event arriving mid-pass queues behind it instead of racing it.
//! Passes over different roots run concurrently.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use context_weave_core::store::ChunkStore;

use crate::config::RootConfig;
use crate::indexer::{IndexRunReport, Indexer};
use crate::sqlite_store::SqliteStore;

pub type JobId = u64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded(Vec<IndexRunReport>),
    Failed(String),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReindexScope {
    All,
    Root(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    /// Files with at least one stored chunk.
    pub documents_indexed: usize,
    pub in_progress: bool,
    pub last_run_degraded: bool,
}

struct Inner {
    indexer: Indexer,
    roots: Vec<RootConfig>,
    history: Option<SqliteStore>,
    jobs: Mutex<HashMap<JobId, JobState>>,
    next_id: AtomicU64,
    root_locks: HashMap<String, tokio::sync::Mutex<()>>,
    running: AtomicUsize,
    last_run: Mutex<Option<(DateTime<Utc>, bool)>>,
    finished: Notify,
}

/// Holds `Inner::running` raised until dropped, however the job ends.
struct RunningGuard(Arc<Inner>);

impl RunningGuard {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.running.fetch_add(1, Ordering::SeqCst);
        Self(inner.clone())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct IndexService {
    inner: Arc<Inner>,
}

impl IndexService {
    pub fn new(indexer: Indexer, roots: Vec<RootConfig>) -> Self {
        let root_locks = roots
            .iter()
            .map(|r| (r.name.clone(), tokio::sync::Mutex::new(())))
            .collect();
        Self {
            inner: Arc::new(Inner {
                indexer,
                roots,
                history: None,
                jobs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                root_locks,
                running: AtomicUsize::new(0),
                last_run: Mutex::new(None),
                finished: Notify::new(),
            }),
        }
    }

    /// Record passes in the SQLite `index_runs` table.
    pub fn with_history(indexer: Indexer, roots: Vec<RootConfig>, history: SqliteStore) -> Self {
        let mut service = Self::new(indexer, roots);
        if let Some(inner) = Arc::get_mut(&mut service.inner) {
            inner.history = Some(history);
        }
        service
    }

    pub fn roots(&self) -> &[RootConfig] {
        &self.inner.roots
    }

    pub fn indexer(&self) -> &Indexer {
        &self.inner.indexer
    }

    fn set_state(&self, id: JobId, state: JobState) {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, state);
    }

    pub fn job(&self, id: JobId) -> Option<JobState> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Wait until a job finishes. `None` for unknown IDs.
    pub async fn wait(&self, id: JobId) -> Option<JobState> {
        loop {
            let notified = self.inner.finished.notified();
            match self.job(id) {
                None => return None,
                Some(state) if state.is_finished() => return Some(state),
                Some(_) => notified.await,
            }
        }
    }

    /// Queue a pass over `scope` and return without waiting for it.
    pub fn trigger_reindex(&self, scope: ReindexScope, full: bool) -> Result<JobId> {
        let roots: Vec<RootConfig> = match &scope {
            ReindexScope::All => self.inner.roots.clone(),
            ReindexScope::Root(name) => match self.inner.roots.iter().find(|r| &r.name == name) {
                Some(r) => vec![r.clone()],
                None => bail!("unknown index root '{}'", name),
            },
        };
        if roots.is_empty() {
            bail!("no index roots configured");
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.set_state(id, JobState::Queued);
        let service = self.clone();
        tokio::spawn(async move {
            let running = RunningGuard::enter(&service.inner);
            service.set_state(id, JobState::Running);
            let pass = {
                let service = service.clone();
                tokio::spawn(async move { service.run_roots(&roots, full).await })
            };
            let state = match pass.await {
                Ok(Ok(reports)) => JobState::Succeeded(reports),
                Ok(Err(e)) => {
                    error!(job = id, error = %e, "index job failed");
                    JobState::Failed(format!("{:#}", e))
                }
                Err(e) => {
                    error!(job = id, error = %e, "index job aborted");
                    JobState::Failed(format!("index job aborted: {}", e))
                }
            };
            service.set_state(id, state);
            drop(running);
            service.inner.finished.notify_waiters();
        });
        info!(job = id, ?scope, full, "queued reindex");
        Ok(id)
    }

    async fn run_roots(&self, roots: &[RootConfig], full: bool) -> Result<Vec<IndexRunReport>> {
        let mut reports = Vec::with_capacity(roots.len());
        for root in roots {
            let lock = self.inner.root_locks.get(&root.name);
            let _guard = match lock {
                Some(l) => Some(l.lock().await),
                None => None,
            };
            let started = Utc::now();
            let report = self.inner.indexer.run_pass(root, full).await?;
            if let Some(history) = &self.inner.history {
                // The pass already committed; a lost history row only
                // affects `status` after a restart.
                if let Err(e) = history.record_run(&report, started).await {
                    warn!(root = %root.name, error = %e, "failed to record index run");
                }
            }
            *self.inner.last_run.lock().unwrap_or_else(|e| e.into_inner()) =
                Some((Utc::now(), report.degraded));
            reports.push(report);
        }
        Ok(reports)
    }

    pub async fn index_status(&self) -> Result<IndexStatus> {
        let stats = self.inner.indexer.store().stats().await?;
        let mut last = *self.inner.last_run.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_none() {
            if let Some(history) = &self.inner.history {
                last = history
                    .last_run()
                    .await?
                    .map(|r| (r.finished_at, r.degraded));
            }
        }
        Ok(IndexStatus {
            last_run_at: last.map(|(at, _)| at),
            documents_indexed: stats.files,
            in_progress: self.inner.running.load(Ordering::SeqCst) > 0,
            last_run_degraded: last.is_some_and(|(_, degraded)| degraded),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledProvider;
    use async_trait::async_trait;
    use context_weave_core::embedding::EmbeddingProvider;
    use context_weave_core::store::memory::InMemoryStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::fs;
    use tempfile::TempDir;

    struct PanickingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for PanickingEmbedder {
        fn model_name(&self) -> &str {
            "panicking"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            panic!("embedder blew up");
        }
    }

    fn parts(tmp: &TempDir, embedder: Arc<dyn EmbeddingProvider>) -> (Indexer, Vec<RootConfig>) {
        fs::write(tmp.path().join("notes.md"), "# Notes\n\nSome notes.\n").unwrap();
        let cfg = crate::config::parse_config(&format!(
            "[db]\npath = \"x\"\n[[index.roots]]\nname = \"notes\"\npath = \"{}\"\n",
            tmp.path().display()
        ))
        .unwrap();
        let indexer = Indexer::new(Arc::new(InMemoryStore::new()), embedder, &cfg);
        (indexer, cfg.index.roots.clone())
    }

    fn service(tmp: &TempDir) -> IndexService {
        let (indexer, roots) = parts(tmp, Arc::new(DisabledProvider));
        IndexService::new(indexer, roots)
    }

    #[tokio::test]
    async fn test_trigger_returns_before_completion_and_succeeds() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let id = svc.trigger_reindex(ReindexScope::All, false).unwrap();
        assert!(svc.job(id).is_some());
        match svc.wait(id).await {
            Some(JobState::Succeeded(reports)) => {
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].added, 1);
            }
            other => panic!("unexpected job state: {:?}", other),
        }
        let status = svc.index_status().await.unwrap();
        assert_eq!(status.documents_indexed, 1);
        assert!(status.last_run_at.is_some());
        assert!(!status.in_progress);
    }

    #[tokio::test]
    async fn test_unknown_root_rejected() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        assert!(svc
            .trigger_reindex(ReindexScope::Root("nope".into()), false)
            .is_err());
        assert!(svc.wait(999).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_jobs_serialize_per_root() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let a = svc.trigger_reindex(ReindexScope::All, false).unwrap();
        let b = svc.trigger_reindex(ReindexScope::Root("notes".into()), false).unwrap();
        let ra = svc.wait(a).await.unwrap();
        let rb = svc.wait(b).await.unwrap();
        let added: usize = [ra, rb]
            .into_iter()
            .map(|s| match s {
                JobState::Succeeded(r) => r[0].added,
                other => panic!("unexpected job state: {:?}", other),
            })
            .sum();
        // Whichever pass ran second saw the first one's digest.
        assert_eq!(added, 1);
    }

    #[tokio::test]
    async fn test_panicking_pass_fails_job_and_clears_in_progress() {
        let tmp = TempDir::new().unwrap();
        let (indexer, roots) = parts(&tmp, Arc::new(PanickingEmbedder));
        let svc = IndexService::new(indexer, roots);

        let id = svc.trigger_reindex(ReindexScope::All, false).unwrap();
        match svc.wait(id).await {
            Some(JobState::Failed(msg)) => assert!(msg.contains("aborted"), "{}", msg),
            other => panic!("unexpected job state: {:?}", other),
        }
        let status = svc.index_status().await.unwrap();
        assert!(!status.in_progress);
    }

    #[tokio::test]
    async fn test_history_write_failure_keeps_job_outcome() {
        let tmp = TempDir::new().unwrap();
        let (indexer, roots) = parts(&tmp, Arc::new(DisabledProvider));
        // No migrations, so `index_runs` does not exist and every insert fails.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let svc = IndexService::with_history(indexer, roots, SqliteStore::new(pool));

        let id = svc.trigger_reindex(ReindexScope::All, false).unwrap();
        match svc.wait(id).await {
            Some(JobState::Succeeded(reports)) => assert_eq!(reports[0].added, 1),
            other => panic!("unexpected job state: {:?}", other),
        }
        let status = svc.index_status().await.unwrap();
        assert_eq!(status.documents_indexed, 1);
        assert!(status.last_run_at.is_some());
    }
}
