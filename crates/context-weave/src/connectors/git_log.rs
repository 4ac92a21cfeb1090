//! `git_log` connector: commit messages of a local repository.
//!
//! Runs `git log` with one `--grep` per query term (ORed, case-insensitive)
//! and scores each commit by the fraction of query terms its message
//! contains.
//!
//! ```toml
//! [connectors.history]
//! type = "git_log"
//! repo = "."
//! max_results = 20
//! commit_url = "https://github.com/acme/app/commit/{sha}"
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use context_weave_core::models::Item;
use context_weave_core::text::{token_set, tokenize};

use super::{table_opt_str, table_str, table_usize, ConnectorSource};
use crate::retriever::SearchFilters;

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';
const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%aI%x1f%s%x1f%b%x1e";

pub struct GitLogSource {
    name: String,
    repo: PathBuf,
    max_results: usize,
    commit_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct Commit {
    sha: String,
    author: String,
    date: DateTime<Utc>,
    subject: String,
    body: String,
}

impl GitLogSource {
    pub fn new(name: &str, repo: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            repo,
            max_results: 20,
            commit_url: None,
        }
    }

    pub fn from_table(name: &str, table: &toml::Table) -> Result<Self> {
        let mut source = Self::new(name, PathBuf::from(table_str(table, "repo")?));
        source.max_results = table_usize(table, "max_results", 20)?;
        source.commit_url = table_opt_str(table, "commit_url");
        Ok(source)
    }

    fn to_item(&self, commit: Commit, terms: &BTreeSet<String>) -> Item {
        let label = self.source_label();
        let text = if commit.body.is_empty() {
            commit.subject.clone()
        } else {
            format!("{}\n\n{}", commit.subject, commit.body)
        };
        let matched = token_set(&text).intersection(terms).count();
        let mut item = Item::new(&label, &commit.sha, text);
        item.title = Some(commit.subject);
        item.authors = vec![commit.author];
        item.created_at = commit.date;
        item.updated_at = commit.date;
        item.source_url = self
            .commit_url
            .as_ref()
            .map(|tpl| tpl.replace("{sha}", &commit.sha));
        item.score = if terms.is_empty() {
            0.0
        } else {
            matched as f64 / terms.len() as f64
        };
        item.metadata = serde_json::json!({ "sha": commit.sha });
        item
    }
}

fn parse_log(output: &str) -> Vec<Commit> {
    output
        .split(RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim_start_matches('\n');
            if record.trim().is_empty() {
                return None;
            }
            let mut fields = record.splitn(5, FIELD_SEP);
            let sha = fields.next()?.trim().to_string();
            let author = fields.next()?.to_string();
            let date = DateTime::parse_from_rfc3339(fields.next()?.trim())
                .ok()?
                .with_timezone(&Utc);
            let subject = fields.next()?.to_string();
            let body = fields.next().unwrap_or("").trim().to_string();
            Some(Commit {
                sha,
                author,
                date,
                subject,
                body,
            })
        })
        .collect()
}

#[async_trait]
impl ConnectorSource for GitLogSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> &str {
        "git_log"
    }

    async fn query(&self, query: &str, filters: &SearchFilters) -> Result<Vec<Item>> {
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.repo)
            .args(["log", "--regexp-ignore-case", "--fixed-strings", LOG_FORMAT])
            .arg(format!("--max-count={}", self.max_results * 4));
        if let Some(since) = filters.since {
            cmd.arg(format!("--since={}", since.to_rfc3339()));
        }
        for term in &terms {
            cmd.arg(format!("--grep={}", term));
        }
        let output = cmd
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to run git log")?;
        if !output.status.success() {
            bail!(
                "git log failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut items: Vec<Item> = parse_log(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(|c| self.to_item(c, &terms))
            .filter(|i| i.score > 0.0)
            .collect();
        items.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        items.truncate(self.max_results);
        debug!(source = %self.source_label(), hits = items.len(), "git log query");
        Ok(items)
    }
}
