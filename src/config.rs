use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::redis::{redact, ConnectionTarget};
use crate::costs::ModelCosts;
use crate::errors::CacheError;
use crate::retry::{secs_to_duration, RetryPolicy};

/// Process-wide default connection target.
pub const REDIS_URL_ENV: &str = "LLM_CACHE_REDIS_URL";

/// Alternative location of the config file.
pub const CONFIG_PATH_ENV: &str = "LLM_CACHE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-model pricing, merged over the built-in table
    #[serde(default)]
    pub costs: HashMap<String, ModelCosts>,
}

/// Where and how long results are kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL. `LLM_CACHE_REDIS_URL` takes precedence.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Budget for a single store operation
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_ttl_secs() -> u64 {
    15 * 24 * 60 * 60
}

fn default_key_prefix() -> String {
    "llm-cache".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Backoff tuning for agent calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_wait_secs")]
    pub initial_wait_secs: f64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: f64,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_max_transient_delay_secs")]
    pub max_transient_delay_secs: f64,
}

fn default_initial_wait_secs() -> f64 {
    1.0
}

fn default_max_wait_secs() -> f64 {
    10.0
}

fn default_max_transient_retries() -> u32 {
    3
}

fn default_max_transient_delay_secs() -> f64 {
    8.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_wait_secs: default_initial_wait_secs(),
            max_wait_secs: default_max_wait_secs(),
            max_transient_retries: default_max_transient_retries(),
            max_transient_delay_secs: default_max_transient_delay_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> Result<RetryPolicy, CacheError> {
        let policy = RetryPolicy::from_secs(self.initial_wait_secs, self.max_wait_secs)?
            .with_transient(
                self.max_transient_retries,
                secs_to_duration("max_transient_delay", self.max_transient_delay_secs)?,
            );
        Ok(policy)
    }
}

impl Config {
    /// Loads the config file (if any) and applies environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        let config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            Self::default()
        };

        Ok(config.with_env_overrides())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("llm-caching").join("config.toml"))
    }

    /// Replaces `store.url` with `LLM_CACHE_REDIS_URL` when it is set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            if !url.trim().is_empty() {
                self.store.url = Some(url);
            }
        }
        self
    }

    /// Picks the connection target: `explicit` first, then the environment,
    /// then the file. The result is validated but not connected to.
    pub fn resolve_connection(&self, explicit: Option<&str>) -> Result<String, CacheError> {
        let from_env = std::env::var(REDIS_URL_ENV).ok();
        let url = [explicit, from_env.as_deref(), self.store.url.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|url| !url.is_empty())
            .ok_or_else(|| {
                CacheError::configuration(format!(
                    "no store URL configured; pass one explicitly, set {REDIS_URL_ENV}, \
                     or set store.url in the config file"
                ))
            })?;

        ConnectionTarget::parse(url)?;
        tracing::debug!(url = %redact(url), "Resolved store connection");
        Ok(url.to_string())
    }

    pub fn ttl(&self) -> Result<Duration, CacheError> {
        if self.store.ttl_secs == 0 {
            return Err(CacheError::configuration("store.ttl_secs must be greater than zero"));
        }
        Ok(Duration::from_secs(self.store.ttl_secs))
    }

    pub fn store_timeout(&self) -> Result<Duration, CacheError> {
        if self.store.timeout_ms == 0 {
            return Err(CacheError::configuration("store.timeout_ms must be greater than zero"));
        }
        Ok(Duration::from_millis(self.store.timeout_ms))
    }

    /// Checks every value that does not depend on the connection target.
    pub fn validate(&self) -> Result<(), CacheError> {
        self.ttl()?;
        self.store_timeout()?;
        self.retry.policy()?;
        for (model, costs) in &self.costs {
            costs.validate(model)?;
        }
        Ok(())
    }
}
