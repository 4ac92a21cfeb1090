//! Configuration parsing and validation.
//!
//! Context Weave is configured with a TOML file (default `./config/cw.toml`).
//! See `config/cw.example.toml` for every section with its defaults.
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `[db]` | SQLite database path |
//! | `[index]`, `[[index.roots]]` | Chunk sizing, enrichment, worker pool, roots to index |
//! | `[embedding]` | Embedding provider (`disabled`, `openai`, `ollama`) |
//! | `[retrieval]`, `[retrieval.boost]` | Candidate sizes, fusion strategy, timeouts, work-context boost |
//! | `[rerank]` | Stage-2 reranker (`disabled`, `http`) |
//! | `[federation]`, `[federation.source_weights]` | Similarity weights, thresholds, source trust |
//! | `[health]` | Per-source failure backoff |
//! | `[watch]` | File-watcher debounce and periodic sync |
//! | `[connectors.<name>]` | External sources; `type` selects the implementation |
//!
//! [`load_config`] rejects invalid values up front so a bad config fails at
//! startup instead of mid-query.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use context_weave_core::boost::{BoostParams, MAX_BOOST_CEILING};
use context_weave_core::chunk::ChunkerConfig;
use context_weave_core::enrich::DEFAULT_SUMMARY_MAX_CHARS;
use context_weave_core::federation::FederationParams;
use context_weave_core::fusion::FusionStrategy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub federation: FederationParams,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    /// `[connectors.<name>]` tables, kept raw until the registry builds them.
    #[serde(default)]
    pub connectors: BTreeMap<String, toml::Table>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    /// Chunking workers; defaults to the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub roots: Vec<RootConfig>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            summary_max_chars: default_summary_max_chars(),
            workers: None,
            roots: Vec::new(),
        }
    }
}

impl IndexConfig {
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|&n| n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(4)
    }

    pub fn root(&self, name: &str) -> Option<&RootConfig> {
        self.roots.iter().find(|r| r.name == name)
    }
}

fn default_max_tokens() -> usize {
    700
}
fn default_overlap_tokens() -> usize {
    80
}
fn default_summary_max_chars() -> usize {
    DEFAULT_SUMMARY_MAX_CHARS
}

/// One directory tree to index.
#[derive(Debug, Deserialize, Clone)]
pub struct RootConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Files larger than this are skipped.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_file_bytes() -> u64 {
    2 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Results returned when the request does not say.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Hits requested from each of the keyword and vector indexes.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Fused candidates kept before hydration and boosting.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    /// Merged results handed to the reranker.
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
    #[serde(default)]
    pub fusion: FusionStrategy,
    #[serde(default = "default_index_timeout_ms")]
    pub index_timeout_ms: u64,
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
    /// Whole-request deadline when the caller sets none.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Sessions idle longer than this are evicted from the context tracker.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    #[serde(default)]
    pub boost: BoostParams,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            candidate_limit: default_candidate_limit(),
            rerank_candidates: default_rerank_candidates(),
            fusion: FusionStrategy::default(),
            index_timeout_ms: default_index_timeout_ms(),
            source_timeout_ms: default_source_timeout_ms(),
            deadline_ms: default_deadline_ms(),
            session_idle_secs: default_session_idle_secs(),
            boost: BoostParams::default(),
        }
    }
}

fn default_top_k() -> usize {
    20
}
fn default_candidate_k() -> usize {
    80
}
fn default_candidate_limit() -> usize {
    150
}
fn default_rerank_candidates() -> usize {
    50
}
fn default_index_timeout_ms() -> u64 {
    2_000
}
fn default_source_timeout_ms() -> u64 {
    3_000
}
fn default_deadline_ms() -> u64 {
    10_000
}
fn default_session_idle_secs() -> u64 {
    3_600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Full URL of the `/rerank` endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding a bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_rerank_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            api_key_env: None,
            timeout_ms: default_rerank_timeout_ms(),
        }
    }
}

impl RerankConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_rerank_timeout_ms() -> u64 {
    1_500
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_base_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Periodic full sync on top of file events; off when unset.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            interval_secs: None,
        }
    }
}

fn default_debounce_ms() -> u64 {
    500
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Index
    if config.index.max_tokens == 0 {
        bail!("index.max_tokens must be > 0");
    }
    if config.index.overlap_tokens >= config.index.max_tokens {
        bail!("index.overlap_tokens must be < index.max_tokens");
    }
    let mut names = HashSet::new();
    for root in &config.index.roots {
        if root.name.trim().is_empty() {
            bail!("index.roots entries must have a non-empty name");
        }
        if root.name.contains(':') {
            bail!("index root name '{}' must not contain ':'", root.name);
        }
        if !names.insert(root.name.as_str()) {
            bail!("duplicate index root name '{}'", root.name);
        }
    }

    // Retrieval
    let r = &config.retrieval;
    if r.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if r.candidate_k < 1 || r.candidate_limit < 1 {
        bail!("retrieval.candidate_k and retrieval.candidate_limit must be >= 1");
    }
    if !(1.0..=MAX_BOOST_CEILING).contains(&r.boost.max_factor) {
        bail!(
            "retrieval.boost.max_factor must be in [1.0, {}]",
            MAX_BOOST_CEILING
        );
    }
    for (name, factor) in [
        ("active_file", r.boost.active_file),
        ("branch_file", r.boost.branch_file),
        ("ticket", r.boost.ticket),
    ] {
        if !(factor >= 1.0) {
            bail!("retrieval.boost.{} must be >= 1.0", name);
        }
    }

    // Federation
    let f = &config.federation;
    let weights = [f.title_weight, f.content_weight, f.metadata_weight];
    if weights.iter().any(|w| !(*w >= 0.0)) {
        bail!("federation weights must be non-negative");
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        bail!("federation weights must have a positive sum");
    }
    if !(0.0 <= f.related_threshold
        && f.related_threshold <= f.duplicate_threshold
        && f.duplicate_threshold <= 1.0)
    {
        bail!("federation thresholds must satisfy 0 <= related_threshold <= duplicate_threshold <= 1");
    }
    if f.source_weights.values().any(|w| !(*w >= 0.0)) {
        bail!("federation.source_weights must be non-negative");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    // Rerank
    match config.rerank.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.rerank.url.as_deref().map_or(true, str::is_empty) {
                bail!("rerank.url must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    // Health
    if config.health.base_backoff_ms > config.health.max_backoff_ms {
        bail!("health.base_backoff_ms must be <= health.max_backoff_ms");
    }

    // Connectors
    for (name, table) in &config.connectors {
        if name.trim().is_empty() {
            bail!("connector names must be non-empty");
        }
        if table.get("type").and_then(|v| v.as_str()).is_none() {
            bail!("connectors.{} must set `type`", name);
        }
    }

    Ok(())
}
