//! Configuration
//!
//! TOML-backed settings: the ordered provider/model fallback chain plus the
//! timing knobs for generation and the cache. Loaded once at startup and
//! consulted read-only afterwards. A missing file yields defaults; a corrupt
//! file is preserved with a `.corrupt` suffix and defaults are used.

use crate::orchestrator::ProviderModelPair;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// One configured completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Full chat-completions endpoint URL.
    pub base_url: String,
    /// Environment variable holding the bearer key; unset for local gateways.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Models to try for this provider, in fallback order.
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Providers in fallback order; the chain is providers × models, ordered.
    pub providers: Vec<ProviderConfig>,
    pub attempt_timeout_ms: u64,
    pub total_budget_ms: u64,
    /// How often a waiter polls a foreign in-flight generation.
    pub poll_interval_ms: u64,
    /// How long a waiter polls before giving up with "still generating".
    pub wait_timeout_ms: u64,
    /// In-flight entries older than this are reclaimed as abandoned.
    pub inflight_grace_secs: u64,
    /// Ready entries older than this read as absent.
    pub cache_ttl_days: u64,
    /// Overrides the platform cache directory when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            providers: vec![ProviderConfig {
                name: "openrouter".to_string(),
                base_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
                api_key_env: Some("OPENROUTER_API_KEY".to_string()),
                models: vec![
                    "anthropic/claude-3.5-haiku".to_string(),
                    "openai/gpt-4o-mini".to_string(),
                ],
            }],
            attempt_timeout_ms: 60_000,
            total_budget_ms: 180_000,
            poll_interval_ms: 500,
            wait_timeout_ms: 120_000,
            inflight_grace_secs: 600,
            cache_ttl_days: 30,
            cache_dir: None,
        }
    }
}

impl ReportConfig {
    /// Default config file location under the user config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("trendscribe").join("config.toml"))
    }

    /// Load from the default location, or return defaults.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from an explicit path. Missing file yields defaults; an
    /// unparseable file is set aside as `.corrupt` and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupt; backup saved, defaults loaded"
                );
                Self::default()
            }
        }
    }

    /// Flatten providers × models into the ordered fallback chain.
    pub fn chain(&self) -> Vec<ProviderModelPair> {
        self.providers
            .iter()
            .flat_map(|p| {
                p.models.iter().map(|m| ProviderModelPair {
                    provider: p.name.clone(),
                    model: m.clone(),
                })
            })
            .collect()
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_millis(self.total_budget_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn inflight_grace(&self) -> Duration {
        Duration::from_secs(self.inflight_grace_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_days * 24 * 3600)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(crate::cache::ReportCache::default_dir)
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReportConfig::load_from(&dir.path().join("nope.toml"));
        assert!(!config.providers.is_empty());
        assert_eq!(config.cache_ttl_days, 30);
    }

    #[test]
    fn chain_flattens_providers_in_order() {
        let config = ReportConfig {
            providers: vec![
                ProviderConfig {
                    name: "primary".to_string(),
                    base_url: "https://a.example/v1/chat/completions".to_string(),
                    api_key_env: Some("A_KEY".to_string()),
                    models: vec!["m1".to_string(), "m2".to_string()],
                },
                ProviderConfig {
                    name: "local".to_string(),
                    base_url: "http://127.0.0.1:11434/v1/chat/completions".to_string(),
                    api_key_env: None,
                    models: vec!["m3".to_string()],
                },
            ],
            ..Default::default()
        };
        let chain = config.chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].to_string(), "primary/m1");
        assert_eq!(chain[1].to_string(), "primary/m2");
        assert_eq!(chain[2].to_string(), "local/m3");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
attempt_timeout_ms = 5000

[[providers]]
name = "local"
base_url = "http://127.0.0.1:11434/v1/chat/completions"
models = ["qwen2.5"]
"#,
        )
        .unwrap();

        let config = ReportConfig::load_from(&path);
        assert_eq!(config.attempt_timeout_ms, 5000);
        assert_eq!(config.total_budget_ms, 180_000);
        assert_eq!(config.providers.len(), 1);
        assert!(config.providers[0].api_key_env.is_none());
    }

    #[test]
    fn corrupt_file_is_preserved_and_defaults_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is [ not toml").unwrap();

        let config = ReportConfig::load_from(&path);
        assert_eq!(config.cache_ttl_days, 30);
        assert!(dir.path().join("config.toml.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = ReportConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let back: ReportConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(back.chain(), config.chain());
        assert_eq!(back.attempt_timeout_ms, config.attempt_timeout_ms);
    }
}
