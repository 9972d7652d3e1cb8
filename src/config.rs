use crate::core::{Result, SyncError};
use crate::delivery::DEFAULT_REQUEST_TIMEOUT;
use crate::gate::DEFAULT_MAX_PHOTO_BYTES;
use crate::storage::{DurabilityMode, StoreOptions, default_schema};
use crate::sync::DrainPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://story-api.dicoding.dev/v1";
pub const DEFAULT_DATA_DIR: &str = ".storysync";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_CHECKPOINT_THRESHOLD: usize = 256;

/// Runtime configuration shared by the foreground and background contexts.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding the WAL and snapshot files
    pub data_dir: PathBuf,

    /// Base URL of the story API, without a trailing slash
    pub api_base_url: String,

    /// Upper bound for a single upload
    pub request_timeout: Duration,

    pub drain_policy: DrainPolicy,

    /// Period of the background sync callback; `None` disables it
    pub background_sync_interval: Option<Duration>,

    /// Whether queuing registers a background-sync tag instead of posting a flush message
    pub background_sync_supported: bool,

    pub max_photo_bytes: usize,

    pub durability: DurabilityMode,

    /// WAL entries written before the store checkpoints into a snapshot
    pub checkpoint_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            drain_policy: DrainPolicy::default(),
            background_sync_interval: Some(DEFAULT_SYNC_INTERVAL),
            background_sync_supported: true,
            max_photo_bytes: DEFAULT_MAX_PHOTO_BYTES,
            durability: DurabilityMode::default(),
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
        }
    }
}

impl SyncConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Reads `STORYSYNC_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("STORYSYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("STORYSYNC_API_BASE_URL") {
            config = config.api_base_url(&url);
        }
        if let Some(ms) = lookup("STORYSYNC_REQUEST_TIMEOUT_MS") {
            let ms: u64 = parse_value("STORYSYNC_REQUEST_TIMEOUT_MS", &ms)?;
            if ms == 0 {
                return Err(SyncError::Config(
                    "STORYSYNC_REQUEST_TIMEOUT_MS must be greater than zero".to_string(),
                ));
            }
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = lookup("STORYSYNC_DRAIN_POLICY") {
            config.drain_policy = policy.parse()?;
        }
        if let Some(secs) = lookup("STORYSYNC_SYNC_INTERVAL_SECS") {
            let secs: u64 = parse_value("STORYSYNC_SYNC_INTERVAL_SECS", &secs)?;
            config.background_sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(flag) = lookup("STORYSYNC_BACKGROUND_SYNC") {
            config.background_sync_supported = parse_flag("STORYSYNC_BACKGROUND_SYNC", &flag)?;
        }
        if let Some(bytes) = lookup("STORYSYNC_MAX_PHOTO_BYTES") {
            config.max_photo_bytes = parse_value("STORYSYNC_MAX_PHOTO_BYTES", &bytes)?;
        }
        if let Some(mode) = lookup("STORYSYNC_DURABILITY") {
            config.durability = mode.parse()?;
        }
        if let Some(entries) = lookup("STORYSYNC_CHECKPOINT_THRESHOLD") {
            config.checkpoint_threshold = parse_value("STORYSYNC_CHECKPOINT_THRESHOLD", &entries)?;
        }

        Ok(config)
    }

    pub fn data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn api_base_url(mut self, url: &str) -> Self {
        self.api_base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn background_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.background_sync_interval = interval;
        self
    }

    pub fn background_sync_supported(mut self, supported: bool) -> Self {
        self.background_sync_supported = supported;
        self
    }

    pub fn max_photo_bytes(mut self, bytes: usize) -> Self {
        self.max_photo_bytes = bytes;
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }

    /// Store options for the shared `story-app-db` store.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::new(&self.data_dir, default_schema())
            .durability(self.durability)
            .checkpoint_threshold(self.checkpoint_threshold)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{} has invalid value '{}'", key, raw)))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::Config(format!("{} must be a boolean, got '{}'", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.drain_policy, DrainPolicy::ContinuePastTransient);
        assert_eq!(config.background_sync_interval, Some(Duration::from_secs(300)));
        assert!(config.background_sync_supported);
        assert_eq!(config.max_photo_bytes, 1_048_576);
        assert_eq!(config.durability, DurabilityMode::Sync);
    }

    #[test]
    fn test_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("STORYSYNC_DATA_DIR", "/tmp/stories"),
            ("STORYSYNC_API_BASE_URL", "http://127.0.0.1:9000/v1/"),
            ("STORYSYNC_REQUEST_TIMEOUT_MS", "250"),
            ("STORYSYNC_DRAIN_POLICY", "abort"),
            ("STORYSYNC_SYNC_INTERVAL_SECS", "0"),
            ("STORYSYNC_BACKGROUND_SYNC", "no"),
            ("STORYSYNC_DURABILITY", "none"),
            ("STORYSYNC_CHECKPOINT_THRESHOLD", "8"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/stories"));
        assert_eq!(config.api_base_url, "http://127.0.0.1:9000/v1");
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.drain_policy, DrainPolicy::AbortOnFirstFailure);
        assert_eq!(config.background_sync_interval, None);
        assert!(!config.background_sync_supported);
        assert_eq!(config.durability, DurabilityMode::None);
        assert_eq!(config.checkpoint_threshold, 8);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for (key, value) in [
            ("STORYSYNC_REQUEST_TIMEOUT_MS", "soon"),
            ("STORYSYNC_REQUEST_TIMEOUT_MS", "0"),
            ("STORYSYNC_DRAIN_POLICY", "maybe"),
            ("STORYSYNC_BACKGROUND_SYNC", "perhaps"),
            ("STORYSYNC_DURABILITY", "paper"),
            ("STORYSYNC_CHECKPOINT_THRESHOLD", "-1"),
        ] {
            let err = SyncConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(matches!(err, SyncError::Config(_)), "{} = {}", key, value);
        }
    }
}
