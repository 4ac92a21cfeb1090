//! Reranker implementations.
//!
//! - **[`DisabledReranker`]**: stage-1 order is final.
//! - **[`HttpReranker`]**: a cross-encoder behind a `/rerank` endpoint
//!   (Cohere/Jina/TEI-compatible). Request body:
//!
//! ```json
//! { "model": "...", "query": "...", "documents": ["..."], "top_n": 3 }
//! ```
//!
//! and the response carries `results[].{index, relevance_score}`. The call
//! is bounded by `rerank.timeout_ms`; a timeout is just another failure,
//! which the orchestrator in `context_weave_core::rerank` absorbs.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use context_weave_core::rerank::{RerankDoc, Reranker};

use crate::config::RerankConfig;

pub struct DisabledReranker;

#[async_trait]
impl Reranker for DisabledReranker {
    fn name(&self) -> &str {
        "disabled"
    }
    fn is_enabled(&self) -> bool {
        false
    }
    async fn score(&self, _query: &str, _docs: &[RerankDoc]) -> Result<Vec<(String, f64)>> {
        bail!("reranker is disabled")
    }
}

pub struct HttpReranker {
    url: String,
    model: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("rerank.url required for http reranker"))?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };
        Ok(Self {
            url,
            model: config.model.clone(),
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms))
                .build()?,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        "http"
    }

    async fn score(&self, query: &str, docs: &[RerankDoc]) -> Result<Vec<(String, f64)>> {
        let documents: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();
        let mut body = serde_json::json!({
            "query": query,
            "documents": documents,
            "top_n": docs.len(),
        });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("rerank API error {}: {}", status, text);
        }
        let json: serde_json::Value = response.json().await?;
        parse_rerank_response(&json, docs)
    }
}

/// Map `results[].{index, relevance_score}` back to document IDs.
fn parse_rerank_response(json: &serde_json::Value, docs: &[RerankDoc]) -> Result<Vec<(String, f64)>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| anyhow!("Invalid rerank response: missing results array"))?;

    let mut scores = Vec::with_capacity(results.len());
    for r in results {
        let index = r
            .get("index")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| anyhow!("Invalid rerank response: missing index"))? as usize;
        let score = r
            .get("relevance_score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| anyhow!("Invalid rerank response: missing relevance_score"))?;
        let doc = docs
            .get(index)
            .ok_or_else(|| anyhow!("Invalid rerank response: index {} out of range", index))?;
        scores.push((doc.id.clone(), score));
    }
    Ok(scores)
}

pub fn create_reranker(config: &RerankConfig) -> Result<Arc<dyn Reranker>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledReranker)),
        "http" => Ok(Arc::new(HttpReranker::new(config)?)),
        other => bail!("Unknown rerank provider: {}", other),
    }
}
