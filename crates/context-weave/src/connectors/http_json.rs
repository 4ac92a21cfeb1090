//! `http_json` connector: a JSON search endpoint of an issue tracker, chat
//! system, or wiki.
//!
//! Sends `GET {url}?{query_param}={query}&{limit_param}={max_results}` and
//! maps each element of the result array to an [`Item`] through
//! configurable dot paths.
//!
//! ```toml
//! [connectors.issues]
//! type = "http_json"
//! url = "https://tracker.example/api/search"
//! results_path = "issues"
//! api_key_env = "TRACKER_TOKEN"
//!
//! [connectors.issues.fields]
//! id = "key"
//! title = "fields.summary"
//! body = "fields.description"
//! url = "links.web"
//! updated_at = "fields.updated"
//! authors = "fields.assignee"
//! tags = "fields.labels"
//! ```
//!
//! Without a `score` mapping, items are scored by response rank.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use context_weave_core::fusion::RANK_K;
use context_weave_core::models::Item;

use super::{table_opt_str, table_str, table_usize, ConnectorSource};
use crate::retriever::SearchFilters;

/// Dot paths from a result element to item fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMap {
    pub id: String,
    pub title: Option<String>,
    pub body: String,
    pub url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub authors: Option<String>,
    pub tags: Option<String>,
    pub file_path: Option<String>,
    pub score: Option<String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            id: "id".into(),
            title: Some("title".into()),
            body: "body".into(),
            url: Some("url".into()),
            created_at: Some("created_at".into()),
            updated_at: Some("updated_at".into()),
            authors: Some("authors".into()),
            tags: Some("tags".into()),
            file_path: None,
            score: None,
        }
    }
}

impl FieldMap {
    fn from_table(table: Option<&toml::Table>) -> Result<Self> {
        let mut map = Self::default();
        let Some(t) = table else {
            return Ok(map);
        };
        if let Some(v) = table_opt_str(t, "id") {
            map.id = v;
        }
        if let Some(v) = table_opt_str(t, "body") {
            map.body = v;
        }
        let opt = |key: &str, current: &mut Option<String>| {
            if let Some(v) = table_opt_str(t, key) {
                *current = Some(v).filter(|s| !s.is_empty());
            }
        };
        opt("title", &mut map.title);
        opt("url", &mut map.url);
        opt("created_at", &mut map.created_at);
        opt("updated_at", &mut map.updated_at);
        opt("authors", &mut map.authors);
        opt("tags", &mut map.tags);
        opt("file_path", &mut map.file_path);
        opt("score", &mut map.score);
        Ok(map)
    }
}

pub struct HttpJsonSource {
    name: String,
    url: String,
    query_param: String,
    limit_param: String,
    results_path: Option<String>,
    api_key_env: Option<String>,
    max_results: usize,
    fields: FieldMap,
    client: reqwest::Client,
}

impl HttpJsonSource {
    pub fn from_table(name: &str, table: &toml::Table) -> Result<Self> {
        let url = table_str(table, "url")?.to_string();
        let timeout_ms = table_usize(table, "timeout_ms", 3_000)? as u64;
        let fields = match table.get("fields") {
            Some(v) => FieldMap::from_table(Some(
                v.as_table().context("'fields' must be a table")?,
            ))?,
            None => FieldMap::default(),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            name: name.to_string(),
            url,
            query_param: table_opt_str(table, "query_param").unwrap_or_else(|| "q".into()),
            limit_param: table_opt_str(table, "limit_param").unwrap_or_else(|| "limit".into()),
            results_path: table_opt_str(table, "results_path").filter(|p| !p.is_empty()),
            api_key_env: table_opt_str(table, "api_key_env"),
            max_results: table_usize(table, "max_results", 20)?,
            fields,
            client,
        })
    }

    fn map_response(&self, body: &Value) -> Result<Vec<Item>> {
        let results = match &self.results_path {
            Some(path) => lookup(body, path)
                .with_context(|| format!("response has no '{}'", path))?,
            None => body,
        };
        let Some(elements) = results.as_array() else {
            bail!("search results are not a JSON array");
        };
        let label = self.source_label();
        let total = elements.len().min(self.max_results);
        let mut items = Vec::with_capacity(total);
        for (rank, element) in elements.iter().take(self.max_results).enumerate() {
            let Some(id) = lookup(element, &self.fields.id).and_then(scalar_string) else {
                debug!(source = %label, rank, "result without id, skipping");
                continue;
            };
            let body = lookup(element, &self.fields.body)
                .and_then(scalar_string)
                .unwrap_or_default();
            let mut item = Item::new(&label, &id, body);
            let field = |path: &Option<String>| path.as_deref().and_then(|p| lookup(element, p));
            item.title = field(&self.fields.title).and_then(scalar_string);
            item.source_url = field(&self.fields.url).and_then(scalar_string);
            item.file_path = field(&self.fields.file_path).and_then(scalar_string);
            item.authors = field(&self.fields.authors).map(string_list).unwrap_or_default();
            item.tags = field(&self.fields.tags).map(string_list).unwrap_or_default();
            if let Some(ts) = field(&self.fields.updated_at).and_then(parse_time) {
                item.updated_at = ts;
                item.created_at = ts;
            }
            if let Some(ts) = field(&self.fields.created_at).and_then(parse_time) {
                item.created_at = ts;
            }
            item.score = match field(&self.fields.score).and_then(Value::as_f64) {
                Some(s) => s,
                None => (RANK_K + 1.0) / (RANK_K + rank as f64 + 1.0),
            };
            item.metadata = element.clone();
            items.push(item);
        }

        // Endpoint scores on an arbitrary scale are brought into [0, 1].
        let max = items.iter().map(|i| i.score).fold(0.0_f64, f64::max);
        if max > 1.0 {
            for item in &mut items {
                item.score /= max;
            }
        }
        for item in &mut items {
            item.score = item.score.clamp(0.0, 1.0);
        }
        Ok(items)
    }
}

/// Follow a dot path (`fields.labels.0`) into a JSON value.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| match v {
        Value::Object(map) => map.get(key),
        Value::Array(arr) => key.parse::<usize>().ok().and_then(|i| arr.get(i)),
        _ => None,
    })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A string, an array of strings, or an array of objects with a
/// `name`/`displayName` field.
fn string_list(value: &Value) -> Vec<String> {
    let one = |v: &Value| {
        scalar_string(v).or_else(|| {
            ["name", "displayName"]
                .iter()
                .find_map(|k| v.get(*k).and_then(scalar_string))
        })
    };
    match value {
        Value::Array(arr) => arr.iter().filter_map(one).collect(),
        other => one(other).into_iter().collect(),
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

#[async_trait]
impl ConnectorSource for HttpJsonSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> &str {
        "http_json"
    }

    async fn query(&self, query: &str, filters: &SearchFilters) -> Result<Vec<Item>> {
        let limit = self.max_results.to_string();
        let mut params = vec![
            (self.query_param.as_str(), query.to_string()),
            (self.limit_param.as_str(), limit),
        ];
        if let Some(since) = filters.since {
            params.push(("since", since.to_rfc3339()));
        }
        let mut request = self.client.get(&self.url).query(&params);
        if let Some(var) = &self.api_key_env {
            let key = std::env::var(var)
                .with_context(|| format!("{} environment variable not set", var))?;
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("search endpoint returned {}: {}", status, body);
        }
        let body: Value = response.json().await?;
        self.map_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(extra: &str) -> HttpJsonSource {
        let table: toml::Table = toml::from_str(&format!(
            "type = \"http_json\"\nurl = \"http://localhost:9/search\"\n{}",
            extra
        ))
        .unwrap();
        HttpJsonSource::from_table("issues", &table).unwrap()
    }

    #[test]
    fn test_field_mapping() {
        let src = source(
            "results_path = \"issues\"\n[fields]\nid = \"key\"\ntitle = \"fields.summary\"\nbody = \"fields.description\"\nurl = \"links.web\"\nupdated_at = \"fields.updated\"\nauthors = \"fields.assignee\"\ntags = \"fields.labels\"\n",
        );
        let body = json!({
            "issues": [
                {
                    "key": "AUTH-42",
                    "fields": {
                        "summary": "Token refresh fails on Safari",
                        "description": "Users are logged out after an hour.",
                        "updated": "2024-05-02T12:00:00Z",
                        "assignee": {"displayName": "Ana"},
                        "labels": ["auth", "safari"]
                    },
                    "links": {"web": "https://tracker.example/AUTH-42"}
                },
                {"fields": {"summary": "no key"}}
            ]
        });
        let items = src.map_response(&body).unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.id, "http_json:issues:AUTH-42");
        assert_eq!(item.title.as_deref(), Some("Token refresh fails on Safari"));
        assert_eq!(item.source_url.as_deref(), Some("https://tracker.example/AUTH-42"));
        assert_eq!(item.authors, vec!["Ana".to_string()]);
        assert_eq!(item.tags, vec!["auth".to_string(), "safari".to_string()]);
        assert_eq!(item.updated_at.to_rfc3339(), "2024-05-02T12:00:00+00:00");
        assert!(item.score > 0.0 && item.score <= 1.0);
    }

    #[test]
    fn test_rank_scores_descend() {
        let src = source("");
        let body = json!([
            {"id": 1, "body": "first"},
            {"id": 2, "body": "second"}
        ]);
        let items = src.map_response(&body).unwrap();
        assert_eq!(items[0].score, 1.0);
        assert!(items[1].score < items[0].score);
        assert_eq!(items[1].source_id, "2");
    }

    #[test]
    fn test_endpoint_scores_normalized() {
        let src = source("[fields]\nscore = \"relevance\"\n");
        let body = json!([
            {"id": "a", "body": "x", "relevance": 12.0},
            {"id": "b", "body": "y", "relevance": 3.0}
        ]);
        let items = src.map_response(&body).unwrap();
        assert_eq!(items[0].score, 1.0);
        assert_eq!(items[1].score, 0.25);
    }

    #[test]
    fn test_non_array_response_is_error() {
        let src = source("");
        assert!(src.map_response(&json!({"error": "bad"})).is_err());
    }
}
