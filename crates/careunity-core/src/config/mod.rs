//! Sync configuration for client apps.
//!
//! Provides a unified `SyncConfig` used by the CLI and embedding clients to
//! locate the API and tune batching, retries and timeouts.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_BATCH_SIZE: usize = 25;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_CONFLICT_RETENTION_DAYS: u64 = 30;
const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

/// Environment variable overriding the API base URL
pub const ENV_API_URL: &str = "CAREUNITY_API_URL";
/// Environment variable overriding the retry threshold
pub const ENV_MAX_RETRIES: &str = "CAREUNITY_MAX_RETRIES";
/// Environment variable overriding the batch size
pub const ENV_BATCH_SIZE: &str = "CAREUNITY_BATCH_SIZE";

/// Runtime configuration of the sync core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Base URL of the care-management API (e.g. `https://api.example.com`)
    pub api_base_url: Option<String>,
    /// Operations dequeued per batch
    pub batch_size: usize,
    /// Transient failures tolerated before an operation is terminally failed
    pub max_retries: u32,
    /// First retry delay; doubles per attempt
    pub backoff_base_ms: u64,
    /// Upper bound on the retry delay
    pub backoff_max_ms: u64,
    /// Bound on every API call
    pub request_timeout_ms: u64,
    /// Reachability probe cadence
    pub probe_interval_secs: u64,
    /// Periodic sync cadence while online
    pub sync_interval_secs: u64,
    /// Days a resolved conflict is kept for review; 0 keeps them forever
    pub conflict_retention_days: u64,
    /// Per entity type strategy overrides (`visit = "client-wins"`)
    pub strategies: BTreeMap<String, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            probe_interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            conflict_retention_days: DEFAULT_CONFLICT_RETENTION_DAYS,
            strategies: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file; a missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        parse_sync_config(&raw).map_err(|error| {
            Error::Config(format!("failed to parse {}: {error}", path.display()))
        })
    }

    /// Apply `CAREUNITY_*` overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = normalize_text_option(lookup(ENV_API_URL)) {
            self.api_base_url = Some(url);
        }
        if let Some(value) = lookup(ENV_MAX_RETRIES).and_then(|raw| raw.trim().parse().ok()) {
            self.max_retries = value;
        }
        if let Some(value) = lookup(ENV_BATCH_SIZE).and_then(|raw| raw.trim().parse().ok()) {
            self.batch_size = value;
        }
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.api_base_url {
            if !is_http_url(url) {
                return Err(Error::Config(
                    "api_base_url must include http:// or https://".to_string(),
                ));
            }
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.probe_interval_secs == 0 {
            return Err(Error::Config(
                "probe_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(Error::Config(
                "backoff_max_ms must not be below backoff_base_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// API base URL without a trailing slash.
    pub fn api_base_url(&self) -> Option<String> {
        normalize_text_option(self.api_base_url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
    }

    /// Delay before retry number `retry_count` (1-based), doubling and capped.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Retention of resolved conflicts in milliseconds, `None` when unlimited.
    pub fn conflict_retention_ms(&self) -> Option<i64> {
        if self.conflict_retention_days == 0 {
            return None;
        }
        let days = i64::try_from(self.conflict_retention_days).unwrap_or(i64::MAX);
        Some(days.saturating_mul(DAY_MS))
    }
}

/// Parse a config from a raw JSON payload, applying defaults and validation.
pub fn parse_sync_config(payload: &str) -> Result<SyncConfig> {
    let config: SyncConfig = serde_json::from_str(payload)
        .map_err(|error| Error::Config(format!("invalid sync config JSON: {error}")))?;
    config.validate()?;
    Ok(config)
}
