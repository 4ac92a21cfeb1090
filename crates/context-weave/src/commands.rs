//! `cw` command implementations. Each opens an [`Engine`], does one thing,
//! prints a human-readable (or JSON) report, and closes the pool.

use anyhow::{bail, Result};
use chrono::Utc;

use context_weave_core::models::{ChunkKind, WorkContext};
use context_weave_core::store::ChunkStore;

use crate::config::Config;
use crate::connectors::ConnectorRegistry;
use crate::context::resolve_changed_files;
use crate::engine::Engine;
use crate::indexer::IndexRunReport;
use crate::jobs::{JobState, ReindexScope};
use crate::retriever::SearchFilters;
use crate::service::SearchRequest;
use crate::watch;

pub async fn run_index(config: &Config, root: Option<String>, full: bool) -> Result<()> {
    let engine = Engine::open(config).await?;
    let scope = match root {
        Some(name) => ReindexScope::Root(name),
        None => ReindexScope::All,
    };
    let id = engine.index.trigger_reindex(scope, full)?;
    let state = engine.index.wait(id).await;
    engine.close().await;

    match state {
        Some(JobState::Succeeded(reports)) => {
            for report in &reports {
                print_report(report);
            }
            Ok(())
        }
        Some(JobState::Failed(msg)) => bail!("index job failed: {}", msg),
        other => bail!("index job ended in unexpected state: {:?}", other),
    }
}

fn print_report(r: &IndexRunReport) {
    println!("index {}", r.root);
    println!("  files scanned: {}", r.files_scanned);
    println!(
        "  added: {}  modified: {}  removed: {}",
        r.added, r.modified, r.removed
    );
    println!(
        "  chunks written: {}  chunks deleted: {}",
        r.chunks_written, r.chunks_deleted
    );
    println!(
        "  embeddings written: {}  pending: {}",
        r.embeddings_written, r.embeddings_pending
    );
    if r.full_rescan {
        println!("  full rescan");
    }
    if !r.failed_files.is_empty() {
        println!("  failed files: {}", r.failed_files.join(", "));
    }
    if r.degraded {
        println!("  DEGRADED (see log)");
    }
    println!("  elapsed: {}ms", r.elapsed_ms);
}

pub async fn run_status(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let status = engine.index.index_status().await?;
    let stats = engine.store().stats().await?;
    engine.close().await;

    println!("context-weave status");
    println!("====================");
    println!();
    println!("  Database:        {}", config.db.path.display());
    println!("  Roots:           {}", config.index.roots.len());
    println!("  Files indexed:   {}", status.documents_indexed);
    println!("  Chunks:          {}", stats.chunks);
    println!("  Vectors:         {}", stats.vectors);
    println!("  Pending embeds:  {}", stats.pending_embeddings);
    println!(
        "  Last run:        {}",
        status
            .last_run_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".into())
    );
    if status.last_run_degraded {
        println!("  Last run was DEGRADED");
    }
    Ok(())
}

/// Arguments of `cw search`.
#[derive(Debug, Clone, Default)]
pub struct SearchArgs {
    pub query: String,
    pub active_file: Option<String>,
    pub branch: Option<String>,
    /// Base the branch's changed files are computed against.
    pub base: String,
    pub tickets: Vec<String>,
    pub session: Option<String>,
    pub sources: Vec<String>,
    pub path_prefix: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<usize>,
    pub json: bool,
}

pub async fn run_search(config: &Config, args: SearchArgs) -> Result<()> {
    let kinds = match args.kind.as_deref() {
        None => Vec::new(),
        Some(k) => match ChunkKind::parse(k) {
            Some(kind) => vec![kind],
            None => bail!("unknown kind '{}' (expected code or doc)", k),
        },
    };

    let declared = args.active_file.is_some() || args.branch.is_some() || !args.tickets.is_empty();
    let work_context = if declared {
        let mut changed_files = Vec::new();
        if let (Some(branch), Some(root)) = (&args.branch, config.index.roots.first()) {
            changed_files = resolve_changed_files(&root.path, &args.base, branch).await;
        }
        Some(WorkContext {
            session_id: args.session.clone(),
            active_file: args.active_file.clone(),
            git_branch: args.branch.clone(),
            open_ticket_ids: args.tickets.clone(),
            changed_files,
            updated_at: Utc::now(),
        })
    } else {
        None
    };

    let request = SearchRequest {
        query: args.query.clone(),
        work_context,
        session_id: args.session.clone(),
        filters: SearchFilters {
            sources: args.sources.clone(),
            path_prefix: args.path_prefix.clone(),
            kinds,
            since: None,
        },
        top_k: args.limit,
        deadline: None,
    };

    let engine = Engine::open(config).await?;
    let response = engine.query.search(request).await;
    engine.close().await;
    let response = response?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if response.degraded {
        eprintln!("Warning: degraded results");
        for (source, err) in &response.source_errors {
            eprintln!("  {}: {}", source, err);
        }
        if let Some(err) = &response.rerank_error {
            eprintln!("  reranker: {}", err);
        }
    }
    if response.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in response.results.iter().enumerate() {
        let item = &result.canonical;
        let title = item
            .title
            .as_deref()
            .or(item.file_path.as_deref())
            .unwrap_or("(untitled)");
        let score = result.rerank_score.unwrap_or(result.score);
        println!("{}. [{:.2}] {} / {}", i + 1, score, item.source, title);
        if let Some(path) = &item.file_path {
            println!("    file: {}", path);
        }
        println!("    updated: {}", item.updated_at.format("%Y-%m-%d"));
        if let Some(url) = &item.source_url {
            println!("    url: {}", url);
        }
        if result.sources.len() > 1 {
            let others: Vec<&str> = result.sources[1..].iter().map(|s| s.source.as_str()).collect();
            println!("    also in: {}", others.join(", "));
        }
        for edge in &result.relationships {
            if let Some(other) = edge.other(&item.id) {
                println!("    see also ({}): {}", edge.kind.as_str(), other);
            }
        }
        for related in result.related.iter().filter(|r| r.hops > 1) {
            println!("    see also ({} hops): {}", related.hops, related.id);
        }
        let excerpt: String = item.body.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", item.id);
        println!();
    }
    Ok(())
}

pub fn list_sources(config: &Config) -> Result<()> {
    println!("{:<28} {:<12} STATUS", "SOURCE", "TYPE");
    for root in &config.index.roots {
        let status = if root.path.is_dir() {
            "OK"
        } else {
            "MISSING (path does not exist)"
        };
        println!("{:<28} {:<12} {}", format!("index:{}", root.name), "index", status);
    }
    let registry = ConnectorRegistry::from_config(config)?;
    for source in registry.sources() {
        println!(
            "{:<28} {:<12} {}",
            source.source_label(),
            source.source_type(),
            "CONFIGURED"
        );
    }
    if config.index.roots.is_empty() && registry.is_empty() {
        println!("(no sources configured)");
    }
    Ok(())
}

pub async fn run_watch(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    if config.index.roots.is_empty() {
        bail!("no index roots configured");
    }
    // Catch up on anything changed while nobody was watching.
    engine.index.trigger_reindex(ReindexScope::All, false)?;
    watch::run_watch(engine.index.clone(), &config.watch, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    engine.close().await;
    Ok(())
}
