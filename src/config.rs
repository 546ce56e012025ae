//! Configuration types for archive-cacher

use crate::error::{Error, Result};
use crate::types::{OverwriteMode, Perspective};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default free-space floor for the cache volume, in GB
pub const DEFAULT_MINIMUM_FREE_SPACE_GB: u64 = 75;

/// Smallest purge batch the evictor will request from the store
pub const MIN_PURGE_BATCH_SIZE: usize = 50;

/// Messages a single batch or task may escalate to the durable log
pub const DEFAULT_DURABLE_ERROR_LIMIT: u32 = 50;

/// Task store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite task store (default: "archive-cacher.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Name presented when leasing and completing tasks
    ///
    /// Defaults to `FileCacher_<hostname>` when unset.
    #[serde(default)]
    pub processor_name: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            processor_name: None,
        }
    }
}

/// Cache volume and eviction configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Free space that must remain on the cache volume, in GB (0 disables eviction)
    #[serde(default = "default_minimum_free_space_gb")]
    pub minimum_free_space_gb: u64,

    /// Which path field of a cache entry is authoritative
    #[serde(default)]
    pub perspective: Perspective,

    /// Number of oldest cached entries fetched per eviction pass (clamped to at least 50)
    #[serde(default = "default_purge_batch_size")]
    pub purge_batch_size: usize,

    /// Runaway guard for the eviction loop (default: 25)
    #[serde(default = "default_max_purge_iterations")]
    pub max_purge_iterations: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            minimum_free_space_gb: default_minimum_free_space_gb(),
            perspective: Perspective::default(),
            purge_batch_size: default_purge_batch_size(),
            max_purge_iterations: default_max_purge_iterations(),
        }
    }
}

impl CacheConfig {
    /// Purge batch size after applying the lower bound
    pub fn effective_batch_size(&self) -> usize {
        self.purge_batch_size.max(MIN_PURGE_BATCH_SIZE)
    }
}

/// Archive service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Base URL of the archive service
    #[serde(default = "default_archive_url")]
    pub base_url: String,

    /// Maximum number of files returned by a dataset listing (default: 10000)
    #[serde(default = "default_max_file_count")]
    pub max_file_count: usize,

    /// List every stored revision of a file instead of the newest only
    #[serde(default)]
    pub include_all_revisions: bool,

    /// Number of files downloaded in parallel (default: 4)
    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,

    /// How existing files in the target directory are treated
    #[serde(default)]
    pub overwrite: OverwriteMode,

    /// Timeout for a single archive HTTP request (default: 300 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_archive_url(),
            max_file_count: default_max_file_count(),
            include_all_revisions: false,
            concurrent_downloads: default_concurrent_downloads(),
            overwrite: OverwriteMode::default(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Retry configuration for task store calls
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts per call, including the first (default: 4)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout applied to each individual attempt (default: 20 seconds)
    #[serde(default = "default_call_timeout", with = "duration_serde")]
    pub call_timeout: Duration,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            call_timeout: default_call_timeout(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for dated log files (console only when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Maximum messages escalated to the durable log per batch or task (default: 50)
    #[serde(default = "default_durable_error_limit")]
    pub durable_error_limit: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
            durable_error_limit: default_durable_error_limit(),
        }
    }
}

/// Update blackout configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlackoutConfig {
    /// Skip the run when operating-system updates are expected (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for BlackoutConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Main configuration for the cache agent
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Task store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Cache volume and eviction settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Archive service settings
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Retry settings for task store calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Update blackout settings
    #[serde(default)]
    pub blackout: BlackoutConfig,
}

impl Config {
    /// Load configuration from a JSON file
    ///
    /// Missing keys take their defaults, so an empty object is a valid file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read config file '{}': {}", path.display(), e),
            key: None,
        })?;

        let config: Config = serde_json::from_str(&content).map_err(|e| Error::Config {
            message: format!("failed to parse config file '{}': {}", path.display(), e),
            key: None,
        })?;

        Ok(config)
    }

    /// Check settings that would otherwise fail later at runtime
    pub fn validate(&self) -> Result<()> {
        if self.store.database_path.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "database path must not be empty".into(),
                key: Some("store.database_path".into()),
            });
        }

        if url::Url::parse(&self.archive.base_url).is_err() {
            return Err(Error::Config {
                message: format!("'{}' is not a valid archive URL", self.archive.base_url),
                key: Some("archive.base_url".into()),
            });
        }

        if self.archive.concurrent_downloads == 0 {
            return Err(Error::Config {
                message: "concurrent downloads must be at least 1".into(),
                key: Some("archive.concurrent_downloads".into()),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config {
                message: "retry attempts must be at least 1".into(),
                key: Some("retry.max_attempts".into()),
            });
        }

        if self.cache.max_purge_iterations == 0 {
            return Err(Error::Config {
                message: "purge iteration ceiling must be at least 1".into(),
                key: Some("cache.max_purge_iterations".into()),
            });
        }

        Ok(())
    }

    /// Processor name used for leasing, falling back to `FileCacher_<hostname>`
    pub fn processor_name(&self) -> String {
        match &self.store.processor_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => {
                let host = hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "localhost".to_string());
                format!("FileCacher_{}", host)
            }
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("archive-cacher.db")
}

fn default_minimum_free_space_gb() -> u64 {
    DEFAULT_MINIMUM_FREE_SPACE_GB
}

fn default_purge_batch_size() -> usize {
    500
}

fn default_max_purge_iterations() -> u32 {
    25
}

fn default_archive_url() -> String {
    "http://localhost:8080/".to_string()
}

fn default_max_file_count() -> usize {
    10_000
}

fn default_concurrent_downloads() -> usize {
    4
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_attempts() -> u32 {
    4
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_durable_error_limit() -> u32 {
    DEFAULT_DURABLE_ERROR_LIMIT
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
