//! Engine configuration.
//!
//! Provides the `EngineConfig` bundle read from a JSON file, with environment
//! overrides applied on top, and the retry policy shared by the operation
//! queue and the sync orchestrator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::EntityKind;
use crate::util::{is_http_url, normalize_text_option};
use crate::Result;

const CONFIG_FILE: &str = "tripsync.json";
const DATABASE_FILE: &str = "tripsync.db";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BATCH_SIZE: usize = 20;
const DEFAULT_SHORT_INTERVAL_SECS: u64 = 2 * 60;
const DEFAULT_LONG_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_CONNECTIVITY_SPACING_SECS: u64 = 30;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BASE_DELAY_SECS: u64 = 30;
const DEFAULT_MAX_DELAY_SECS: u64 = 60 * 60;

/// Automated handling of detected conflicts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Park the conflict until the user picks a side
    #[default]
    Manual,
    /// Resolve immediately by keeping local fields
    PreferLocal,
    /// Resolve immediately by adopting the server row
    PreferServer,
}

/// Retry policy for queued operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before an operation is classified as permanently failed
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_secs: DEFAULT_BASE_DELAY_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
        }
    }
}

impl RetryConfig {
    /// Set the retry budget
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_secs = delay.as_secs();
        self
    }

    /// Set the delay cap
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_secs = delay.as_secs();
        self
    }

    /// Delay to wait after the given number of failed attempts:
    /// `min(2^retry_count * base_delay, max_delay)`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let secs = 2u64
            .checked_pow(retry_count)
            .and_then(|factor| factor.checked_mul(self.base_delay_secs))
            .map_or(self.max_delay_secs, |secs| secs.min(self.max_delay_secs));
        Duration::from_secs(secs)
    }

    /// Whether an operation with this many failures may still be attempted
    pub const fn has_budget(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// Sync cycle and scheduling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Timeout applied to every remote call
    pub request_timeout_secs: u64,
    /// Maximum operations drained per cycle
    pub batch_size: usize,
    /// Interval while the operation queue is non-empty
    pub short_interval_secs: u64,
    /// Interval while nothing is queued
    pub long_interval_secs: u64,
    /// Minimum spacing between connectivity-triggered cycles
    pub min_connectivity_spacing_secs: u64,
    /// Kinds pushed but never pulled
    pub export_only: Vec<EntityKind>,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            short_interval_secs: DEFAULT_SHORT_INTERVAL_SECS,
            long_interval_secs: DEFAULT_LONG_INTERVAL_SECS,
            min_connectivity_spacing_secs: DEFAULT_CONNECTIVITY_SPACING_SECS,
            export_only: vec![EntityKind::WorkSchedule],
            conflict_policy: ConflictPolicy::Manual,
        }
    }
}

impl SyncConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn short_interval(&self) -> Duration {
        Duration::from_secs(self.short_interval_secs)
    }

    pub const fn long_interval(&self) -> Duration {
        Duration::from_secs(self.long_interval_secs)
    }

    pub const fn min_connectivity_spacing(&self) -> Duration {
        Duration::from_secs(self.min_connectivity_spacing_secs)
    }

    /// Whether server changes for this kind are ignored on pull
    pub fn is_export_only(&self, kind: EntityKind) -> bool {
        self.export_only.contains(&kind)
    }
}

/// Endpoint of the authoritative backend
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl RemoteConfig {
    /// Base URL, if it is a usable HTTP(S) URL
    pub fn endpoint(&self) -> Option<String> {
        let url = normalize_text_option(self.base_url.clone())?;
        is_http_url(&url).then(|| url.trim_end_matches('/').to_string())
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local store location; `None` uses [`default_database_path`]
    pub database_path: Option<PathBuf>,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub remote: RemoteConfig,
}

impl EngineConfig {
    /// Resolved local store location
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }

    /// Apply `TRIPSYNC_*` environment variables on top of this config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides read through `lookup`; unparsable values are ignored
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |name: &str| normalize_text_option(lookup(name));

        if let Some(path) = read("TRIPSYNC_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(url) = read("TRIPSYNC_API_URL") {
            self.remote.base_url = Some(url);
        }
        if let Some(key) = read("TRIPSYNC_API_KEY") {
            self.remote.api_key = Some(key);
        }
        if let Some(value) = read("TRIPSYNC_MAX_RETRIES") {
            match value.parse() {
                Ok(max_retries) => self.retry.max_retries = max_retries,
                Err(error) => tracing::warn!("Ignoring TRIPSYNC_MAX_RETRIES={value}: {error}"),
            }
        }
        if let Some(value) = read("TRIPSYNC_BATCH_SIZE") {
            match value.parse::<usize>() {
                Ok(batch_size) if batch_size > 0 => self.sync.batch_size = batch_size,
                Ok(_) => tracing::warn!("Ignoring TRIPSYNC_BATCH_SIZE=0"),
                Err(error) => tracing::warn!("Ignoring TRIPSYNC_BATCH_SIZE={value}: {error}"),
            }
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tripsync")
}

/// Default local store location under the platform data directory
pub fn default_database_path() -> PathBuf {
    data_dir().join(DATABASE_FILE)
}

/// Default configuration file location
pub fn default_config_path() -> PathBuf {
    data_dir().join(CONFIG_FILE)
}

/// Load the configuration file, then apply environment overrides
pub fn load_config() -> EngineConfig {
    let mut config = load_config_from_path(&default_config_path());
    config.apply_env_overrides();
    config
}

/// Load a configuration file; a missing or unreadable file yields defaults
pub fn load_config_from_path(path: &Path) -> EngineConfig {
    if !path.exists() {
        return EngineConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<EngineConfig>(&content) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(
                    "Failed to parse engine config at {}: {}",
                    path.display(),
                    error
                );
                EngineConfig::default()
            }
        },
        Err(error) => {
            tracing::warn!(
                "Failed to read engine config at {}: {}",
                path.display(),
                error
            );
            EngineConfig::default()
        }
    }
}

/// Write the configuration as pretty JSON, creating parent directories
pub fn save_config_to_path(config: &EngineConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
