//! Runtime configuration of the synchronization engine.
//!
//! Precedence: built-in defaults, then an optional TOML file, then `CATALOG_*`
//! environment variables.
//!
//! | variable | field |
//! |---|---|
//! | `CATALOG_DETAIL_TTL_SECS` | `detail_ttl_secs` |
//! | `CATALOG_COLLECTION_TTL_SECS` | `collection_ttl_secs` |
//! | `CATALOG_SEARCH_TTL_SECS` | `search_ttl_secs` |
//! | `CATALOG_CACHE_TIMEOUT_MS` | `cache_timeout_ms` |
//! | `CATALOG_SIDE_EFFECT_TIMEOUT_MS` | `side_effect_timeout_ms` |
//! | `CATALOG_DISPATCH` | `dispatch` (`background` / `inline`) |
//! | `CATALOG_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `CATALOG_RETRY_BASE_DELAY_MS` | `retry.base_delay_ms` |
//! | `CATALOG_RELAY_INTERVAL_MS` | `relay_interval_ms` |
//! | `CATALOG_RELAY_BATCH` | `relay_batch` |
//! | `CATALOG_RECONCILE_INTERVAL_SECS` | `reconcile_interval_secs` |
//! | `CATALOG_TOMBSTONE_GRACE_SECS` | `tombstone_grace_secs` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// How post-commit side effects are awaited by the writer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Return as soon as the commit (and the detail-key delete) is done.
    #[default]
    Background,
    /// Await every side effect up to the side-effect timeout before returning.
    /// Effects still running at the deadline continue in the background.
    Inline,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" | "async" => Ok(DispatchMode::Background),
            "inline" | "sync" => Ok(DispatchMode::Inline),
            other => Err(format!("unknown dispatch mode `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub detail_ttl_secs: u64,
    pub collection_ttl_secs: u64,
    pub search_ttl_secs: u64,
    /// Bound on every cache round trip; a slower read is treated as a miss.
    pub cache_timeout_ms: u64,
    /// Bound on each attempt of a post-commit side effect.
    pub side_effect_timeout_ms: u64,
    pub dispatch: DispatchMode,
    pub retry: RetryPolicy,
    pub relay_interval_ms: u64,
    pub relay_batch: usize,
    pub reconcile_interval_secs: u64,
    /// Age after which reconciliation drops search tombstones.
    pub tombstone_grace_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            detail_ttl_secs: 600,
            collection_ttl_secs: 300,
            search_ttl_secs: 30,
            cache_timeout_ms: 100,
            side_effect_timeout_ms: 2_000,
            dispatch: DispatchMode::Background,
            retry: RetryPolicy::default(),
            relay_interval_ms: 1_000,
            relay_batch: 100,
            reconcile_interval_secs: 300,
            tombstone_grace_secs: 3_600,
        }
    }
}

impl SyncConfig {
    /// Defaults, overlaid with `path` (if given), overlaid with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        base.with_overrides(|var| std::env::var(var).ok())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Apply `CATALOG_*` overrides read through `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        fn parse<T: FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
            slot: &mut T,
        ) -> Result<(), ConfigError> {
            if let Some(raw) = lookup(var) {
                *slot = raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { var, value: raw.clone() })?;
            }
            Ok(())
        }

        parse(&lookup, "CATALOG_DETAIL_TTL_SECS", &mut self.detail_ttl_secs)?;
        parse(&lookup, "CATALOG_COLLECTION_TTL_SECS", &mut self.collection_ttl_secs)?;
        parse(&lookup, "CATALOG_SEARCH_TTL_SECS", &mut self.search_ttl_secs)?;
        parse(&lookup, "CATALOG_CACHE_TIMEOUT_MS", &mut self.cache_timeout_ms)?;
        parse(&lookup, "CATALOG_SIDE_EFFECT_TIMEOUT_MS", &mut self.side_effect_timeout_ms)?;
        parse(&lookup, "CATALOG_DISPATCH", &mut self.dispatch)?;
        parse(&lookup, "CATALOG_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        parse(&lookup, "CATALOG_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms)?;
        parse(&lookup, "CATALOG_RELAY_INTERVAL_MS", &mut self.relay_interval_ms)?;
        parse(&lookup, "CATALOG_RELAY_BATCH", &mut self.relay_batch)?;
        parse(&lookup, "CATALOG_RECONCILE_INTERVAL_SECS", &mut self.reconcile_interval_secs)?;
        parse(&lookup, "CATALOG_TOMBSTONE_GRACE_SECS", &mut self.tombstone_grace_secs)?;
        Ok(self)
    }

    pub fn detail_ttl(&self) -> Duration {
        Duration::from_secs(self.detail_ttl_secs)
    }

    pub fn collection_ttl(&self) -> Duration {
        Duration::from_secs(self.collection_ttl_secs)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_secs)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn side_effect_timeout(&self) -> Duration {
        Duration::from_millis(self.side_effect_timeout_ms)
    }

    pub fn relay_interval(&self) -> Duration {
        Duration::from_millis(self.relay_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn tombstone_grace(&self) -> Duration {
        Duration::from_secs(self.tombstone_grace_secs)
    }
}
