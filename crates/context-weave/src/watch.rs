//! Background re-index scheduler (`cw watch`).
//!
//! A `notify` watcher reports file events under every configured root.
//! Events are debounced per root (`watch.debounce_ms`) and then turned into
//! incremental [`IndexService::trigger_reindex`] jobs. An optional periodic
//! sync (`watch.interval_secs`) catches anything the watcher missed. The
//! scheduler only enqueues jobs; it never touches the query path.

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::jobs::{IndexService, ReindexScope};
use crate::scan::{relative_path, RootFilter};

/// A watched root: its name, canonical base path and filter.
pub struct WatchedRoot {
    pub name: String,
    pub base: PathBuf,
    filter: RootFilter,
}

impl WatchedRoot {
    fn accepts(&self, path: &Path) -> bool {
        relative_path(&self.base, path).is_some_and(|rel| self.filter.matches(&rel))
    }
}

pub fn watched_roots(service: &IndexService) -> Result<Vec<WatchedRoot>> {
    service
        .roots()
        .iter()
        .map(|r| {
            let base = r
                .path
                .canonicalize()
                .with_context(|| format!("Failed to resolve root {}", r.path.display()))?;
            Ok(WatchedRoot {
                name: r.name.clone(),
                base,
                filter: RootFilter::new(r)?,
            })
        })
        .collect()
}

/// Roots with at least one accepted path among `paths`.
pub fn affected_roots(roots: &[WatchedRoot], paths: &[PathBuf]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for path in paths {
        for root in roots {
            if root.accepts(path) {
                out.insert(root.name.clone());
            }
        }
    }
    out
}

/// Watch every root until `shutdown` resolves.
pub async fn run_watch<F>(service: IndexService, config: &WatchConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let roots = watched_roots(&service)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    for root in &roots {
        watcher
            .watch(&root.base, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.base.display()))?;
        info!(root = %root.name, path = %root.base.display(), "watching");
    }

    let debounce = Duration::from_millis(config.debounce_ms);
    let mut interval = config.interval_secs.filter(|s| *s > 0).map(|s| {
        let mut i = tokio::time::interval(Duration::from_secs(s));
        i.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        i
    });
    // The first tick fires immediately; let startup events settle instead.
    if let Some(i) = interval.as_mut() {
        i.reset();
    }

    let mut pending: BTreeSet<String> = BTreeSet::new();
    let mut deadline: Option<Instant> = None;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(res) = rx.recv() => match res {
                Ok(event) => {
                    let hit = affected_roots(&roots, &event.paths);
                    if !hit.is_empty() {
                        debug!(roots = ?hit, kind = ?event.kind, "file event");
                        pending.extend(hit);
                        deadline = Some(Instant::now() + debounce);
                    }
                }
                Err(e) => warn!(error = %e, "watch error"),
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                for root in std::mem::take(&mut pending) {
                    if let Err(e) = service.trigger_reindex(ReindexScope::Root(root.clone()), false) {
                        warn!(root = %root, error = %e, "failed to queue reindex");
                    }
                }
            }
            _ = async {
                match interval.as_mut() {
                    Some(i) => { i.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Err(e) = service.trigger_reindex(ReindexScope::All, false) {
                    warn!(error = %e, "failed to queue periodic sync");
                }
            }
        }
    }

    drop(watcher);
    info!("watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RootConfig;

    fn root(name: &str, base: &str) -> WatchedRoot {
        let cfg = RootConfig {
            name: name.into(),
            path: PathBuf::from(base),
            include_globs: vec!["**/*".into()],
            exclude_globs: vec![],
            follow_symlinks: false,
            max_file_bytes: 1024,
        };
        WatchedRoot {
            name: name.into(),
            base: PathBuf::from(base),
            filter: RootFilter::new(&cfg).unwrap(),
        }
    }

    #[test]
    fn test_affected_roots_filters_and_maps() {
        let roots = vec![root("app", "/w/app"), root("docs", "/w/docs")];
        let paths = vec![
            PathBuf::from("/w/app/src/main.rs"),
            PathBuf::from("/w/app/.git/index"),
            PathBuf::from("/w/other/file.txt"),
        ];
        let hit = affected_roots(&roots, &paths);
        assert_eq!(hit.into_iter().collect::<Vec<_>>(), vec!["app".to_string()]);
    }

    #[test]
    fn test_git_only_events_ignored() {
        let roots = vec![root("app", "/w/app")];
        let paths = vec![PathBuf::from("/w/app/.git/HEAD")];
        assert!(affected_roots(&roots, &paths).is_empty());
    }
}
