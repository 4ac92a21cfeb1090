//! Live-query connectors to external knowledge sources.
//!
//! A [`ConnectorSource`] answers one query against one external system and
//! returns [`Item`]s for federation. Connectors are queried independently
//! and concurrently; a failing connector only costs its own results.
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │          ConnectorRegistry          │
//! │   type → factory     label → source │
//! │  ┌─────────┐ ┌──────────┐ ┌───────┐ │
//! │  │ git_log │ │http_json │ │custom │ │
//! │  └─────────┘ └──────────┘ └───────┘ │
//! └──────────────────┬──────────────────┘
//!                    ▼
//!            QueryService fan-out
//! ```
//!
//! Config instantiates sources by type:
//!
//! ```toml
//! [connectors.history]
//! type = "git_log"
//! repo = "."
//! ```

pub mod git_log;
pub mod http_json;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use context_weave_core::models::Item;

use crate::config::Config;
use crate::retriever::SearchFilters;

#[async_trait]
pub trait ConnectorSource: Send + Sync {
    /// Instance name from config (`history` in `[connectors.history]`).
    fn name(&self) -> &str;

    /// Type identifier, e.g. `"git_log"`.
    fn source_type(&self) -> &str;

    /// `"{type}:{name}"`; used as the item source and in `source_errors`.
    fn source_label(&self) -> String {
        format!("{}:{}", self.source_type(), self.name())
    }

    /// Query the source. Scores must lie in `[0.0, 1.0]`.
    async fn query(&self, query: &str, filters: &SearchFilters) -> Result<Vec<Item>>;
}

/// Builds a source from its name and config table.
pub type ConnectorFactory =
    Box<dyn Fn(&str, &toml::Table) -> Result<Arc<dyn ConnectorSource>> + Send + Sync>;

pub struct ConnectorRegistry {
    factories: BTreeMap<String, ConnectorFactory>,
    sources: Vec<Arc<dyn ConnectorSource>>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    /// A registry with the built-in types and no sources.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
            sources: Vec::new(),
        };
        registry.register_type("git_log", |name, table| {
            Ok(Arc::new(git_log::GitLogSource::from_table(name, table)?))
        });
        registry.register_type("http_json", |name, table| {
            Ok(Arc::new(http_json::HttpJsonSource::from_table(name, table)?))
        });
        registry
    }

    pub fn register_type<F>(&mut self, source_type: &str, factory: F)
    where
        F: Fn(&str, &toml::Table) -> Result<Arc<dyn ConnectorSource>> + Send + Sync + 'static,
    {
        self.factories
            .insert(source_type.to_string(), Box::new(factory));
    }

    pub fn types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate every `[connectors.<name>]` entry.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (name, table) in &config.connectors {
            let source_type = table
                .get("type")
                .and_then(|v| v.as_str())
                .with_context(|| format!("connector '{}' has no type", name))?;
            let factory = match registry.factories.get(source_type) {
                Some(f) => f,
                None => bail!(
                    "connector '{}' has unknown type '{}' (known: {})",
                    name,
                    source_type,
                    registry.types().join(", ")
                ),
            };
            let source = factory(name, table)
                .with_context(|| format!("invalid config for connector '{}'", name))?;
            registry.register(source)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, source: Arc<dyn ConnectorSource>) -> Result<()> {
        let label = source.source_label();
        if self.sources.iter().any(|s| s.source_label() == label) {
            bail!("duplicate connector '{}'", label);
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn sources(&self) -> &[Arc<dyn ConnectorSource>] {
        &self.sources
    }

    /// Find a source by label (`git_log:history`) or bare name.
    pub fn find(&self, key: &str) -> Option<&Arc<dyn ConnectorSource>> {
        self.sources
            .iter()
            .find(|s| s.source_label() == key)
            .or_else(|| self.sources.iter().find(|s| s.name() == key))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Required string field of a connector table.
pub(crate) fn table_str<'a>(table: &'a toml::Table, key: &str) -> Result<&'a str> {
    table
        .get(key)
        .and_then(|v| v.as_str())
        .with_context(|| format!("missing string field '{}'", key))
}

pub(crate) fn table_opt_str(table: &toml::Table, key: &str) -> Option<String> {
    table.get(key).and_then(|v| v.as_str()).map(String::from)
}

pub(crate) fn table_usize(table: &toml::Table, key: &str, default: usize) -> Result<usize> {
    match table.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_integer()
            .and_then(|i| usize::try_from(i).ok())
            .with_context(|| format!("'{}' must be a non-negative integer", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl ConnectorSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn source_type(&self) -> &str {
            "static"
        }
        async fn query(&self, _query: &str, _filters: &SearchFilters) -> Result<Vec<Item>> {
            Ok(vec![Item::new("static:fixed", "1", "hello")])
        }
    }

    fn config(extra: &str) -> Config {
        crate::config::parse_config(&format!("[db]\npath = \"x\"\n{}", extra)).unwrap()
    }

    #[test]
    fn test_from_config_builds_builtins() {
        let cfg = config(
            "[connectors.history]\ntype = \"git_log\"\nrepo = \".\"\n\n[connectors.issues]\ntype = \"http_json\"\nurl = \"http://localhost:9/search\"\n",
        );
        let registry = ConnectorRegistry::from_config(&cfg).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.find("git_log:history").is_some());
        assert_eq!(
            registry.find("issues").map(|s| s.source_label()),
            Some("http_json:issues".to_string())
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let cfg = config("[connectors.chat]\ntype = \"carrier_pigeon\"\n");
        let err = ConnectorRegistry::from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("unknown type"));
    }

    #[test]
    fn test_custom_type_and_duplicates() {
        let mut registry = ConnectorRegistry::new();
        registry.register_type("static", |_, _| Ok(Arc::new(Fixed)));
        assert!(registry.types().contains(&"static"));
        registry.register(Arc::new(Fixed)).unwrap();
        assert!(registry.register(Arc::new(Fixed)).is_err());
    }
}
