//! Configuration types for nexrad-sync
//!
//! A [`Config`] is built once at startup and passed explicitly to the
//! components that need it. Every field has a default so an empty JSON object
//! is a valid configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard upper bound on the number of download workers
pub const MAX_WORKERS: usize = 10;

/// Main configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote bucket settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Download worker pool settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Per-task transfer retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// External conversion and completion monitoring settings
    #[serde(default)]
    pub conversion: ConversionConfig,
}

impl Config {
    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that have no sensible interpretation
    pub fn validate(&self) -> Result<()> {
        if self.download.concurrency == 0 {
            return Err(Error::config(
                "download.concurrency",
                "at least one download worker is required",
            ));
        }
        if self.download.queue_capacity == 0 {
            return Err(Error::config(
                "download.queue_capacity",
                "queue capacity must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config(
                "retry.max_attempts",
                "at least one transfer attempt is required",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "backoff multiplier must be >= 1.0",
            ));
        }
        if self.conversion.concurrency == 0 {
            return Err(Error::config(
                "conversion.concurrency",
                "at least one converter process is required",
            ));
        }
        if self.conversion.poll_interval.is_zero()
            || self.conversion.poll_interval >= Duration::from_secs(1)
        {
            return Err(Error::config(
                "conversion.poll_interval",
                "poll interval must be between 1 ms and 999 ms",
            ));
        }
        if self.store.bucket.is_empty() {
            return Err(Error::config("store.bucket", "bucket name is empty"));
        }
        url::Url::parse(&self.store.endpoint)
            .map_err(|e| Error::config("store.endpoint", format!("invalid URL: {e}")))?;
        Ok(())
    }

    /// Number of download workers actually started (clamped to [`MAX_WORKERS`])
    pub fn worker_count(&self) -> usize {
        self.download.concurrency.clamp(1, MAX_WORKERS)
    }
}

/// Remote bucket configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the S3-compatible endpoint (path-style requests)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bucket holding the Level 2 archive
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// TCP connect timeout for every request (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            bucket: default_bucket(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// When the scheduler emits a station sentinel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelMode {
    /// After the station's final task of every day
    #[default]
    PerStationDay,
    /// Once, after the station's final task of the whole range
    PerStation,
}

/// Download worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root of the local archive (default: "./data")
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Dataset path below the root (default: "NEXRAD/level2")
    #[serde(default = "default_dataset")]
    pub dataset: PathBuf,

    /// Number of download workers, one queue each (default: 4, max 10)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Capacity of each worker queue (default: 500, about one day of scans)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Re-download files that already exist locally
    #[serde(default)]
    pub overwrite: bool,

    /// File-name suffixes that are never downloaded (default: MDM and tar)
    #[serde(default = "default_exclude_suffixes")]
    pub exclude_suffixes: Vec<String>,

    /// Sentinel granularity
    #[serde(default)]
    pub sentinel_mode: SentinelMode,

    /// Upper bound on a single transfer attempt (None = unbounded)
    #[serde(default, with = "optional_duration_serde")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            dataset: default_dataset(),
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            overwrite: false,
            exclude_suffixes: default_exclude_suffixes(),
            sentinel_mode: SentinelMode::default(),
            attempt_timeout: None,
        }
    }
}

/// Retry configuration for transient transfer failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of transfer attempts per object (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt (default: none)
    #[serde(default, with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between attempts (default: 5 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: Duration::ZERO,
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Conversion launcher and completion monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Path to the wct-export script (searched on PATH if None)
    #[serde(default)]
    pub wct_export: Option<PathBuf>,

    /// wct-export batch configuration (defaults to wctBatchConfig.xml next to the script)
    #[serde(default)]
    pub batch_config: Option<PathBuf>,

    /// Output format argument passed to wct-export (default: "rnc")
    #[serde(default = "default_output_format")]
    pub output_format: String,

    /// Scratch root for batch files, converter caches and converted output (default: /tmp)
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Number of converter processes (default: 1)
    #[serde(default = "default_conversion_concurrency")]
    pub concurrency: usize,

    /// Cache directory poll interval, non-zero and under one second (default: 100 ms)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// How long the monitor may keep running after the converters exit (default: 60 s)
    #[serde(default = "default_monitor_grace", with = "duration_serde")]
    pub monitor_grace: Duration,

    /// Append-only summary table file
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            wct_export: None,
            batch_config: None,
            output_format: default_output_format(),
            scratch_root: default_scratch_root(),
            concurrency: default_conversion_concurrency(),
            poll_interval: default_poll_interval(),
            monitor_grace: default_monitor_grace(),
            report_path: None,
        }
    }
}

fn default_endpoint() -> String {
    "https://s3.amazonaws.com".to_string()
}

fn default_bucket() -> String {
    "noaa-nexrad-level2".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_dataset() -> PathBuf {
    PathBuf::from("NEXRAD").join("level2")
}

fn default_concurrency() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    500
}

fn default_exclude_suffixes() -> Vec<String> {
    vec!["MDM".to_string(), "tar".to_string()]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_output_format() -> String {
    "rnc".to_string()
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_conversion_concurrency() -> usize {
    1
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_monitor_grace() -> Duration {
    Duration::from_secs(60)
}

// Durations are written as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.store.bucket, "noaa-nexrad-level2");
        assert_eq!(config.download.concurrency, 4);
        assert_eq!(config.download.queue_capacity, 500);
        assert_eq!(config.download.exclude_suffixes, vec!["MDM", "tar"]);
        assert_eq!(config.download.sentinel_mode, SentinelMode::PerStationDay);
        assert!(!config.download.overwrite);
        assert!(config.download.attempt_timeout.is_none());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.conversion.poll_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn durations_are_milliseconds() {
        let json = r#"{
            "download": { "attempt_timeout": 1500, "sentinel_mode": "per_station" },
            "conversion": { "poll_interval": 250, "monitor_grace": 2000 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(
            config.download.attempt_timeout,
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.download.sentinel_mode, SentinelMode::PerStation);
        assert_eq!(config.conversion.poll_interval, Duration::from_millis(250));
        assert_eq!(config.conversion.monitor_grace, Duration::from_secs(2));

        let round_trip: Config =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(
            round_trip.download.attempt_timeout,
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn worker_count_is_clamped() {
        let mut config = Config::default();
        config.download.concurrency = 32;
        assert_eq!(config.worker_count(), MAX_WORKERS);

        config.download.concurrency = 3;
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;

        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("retry.max_attempts"))
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_slow_poll_interval() {
        let mut config = Config::default();
        config.conversion.poll_interval = Duration::from_millis(999);
        assert!(config.validate().is_ok());

        for rejected in [Duration::ZERO, Duration::from_secs(1), Duration::from_secs(5)] {
            config.conversion.poll_interval = rejected;
            assert!(
                matches!(
                    config.validate(),
                    Err(Error::Config { key: Some(k), .. }) if k == "conversion.poll_interval"
                ),
                "{rejected:?} accepted"
            );
        }
    }

    #[test]
    fn validate_rejects_bad_endpoint() {
        let mut config = Config::default();
        config.store.endpoint = "not a url".to_string();

        assert!(matches!(
            config.validate(),
            Err(Error::Config { key: Some(k), .. }) if k == "store.endpoint"
        ));
    }

    #[test]
    fn from_json_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "download": { "concurrency": 0 } }"#).unwrap();

        assert!(matches!(
            Config::from_json_file(&path),
            Err(Error::Config { .. })
        ));

        std::fs::write(&path, r#"{ "download": { "concurrency": 2 } }"#).unwrap();
        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.worker_count(), 2);
    }
}
