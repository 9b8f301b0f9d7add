use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::murmur::blobs::BlobStoreConfig;
use crate::murmur::error::{MurmurError, Result};

/// Exponential backoff for idempotent reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, 0)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 50)
    }
}

#[derive(Debug, Clone)]
pub struct MurmurConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Prefix of every public attachment URL
    pub public_base_url: String,

    /// Per-receiver backlog of the change notifier
    pub notifier_capacity: usize,

    /// Events buffered for each subscriber before it counts as lagging
    pub subscription_buffer: usize,

    pub default_history_limit: usize,
    pub max_history_limit: usize,

    /// Backoff for history reads that hit an unavailable store
    pub read_retry: RetryPolicy,

    pub blob: BlobStoreConfig,

    /// Accept attachments whose type cannot be sniffed from their bytes
    pub allow_unrecognized_media: bool,
}

impl MurmurConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };
        let formatted_data_dir = data_dir.join(env_suffix);
        let formatted_logs_dir = logs_dir.join(env_suffix);

        Self {
            data_dir: formatted_data_dir,
            logs_dir: formatted_logs_dir,
            public_base_url: "http://localhost:8080".to_string(),
            notifier_capacity: 256,
            subscription_buffer: 64,
            default_history_limit: 50,
            max_history_limit: 500,
            read_retry: RetryPolicy::default(),
            blob: BlobStoreConfig::default(),
            allow_unrecognized_media: false,
        }
    }

    /// Like [`MurmurConfig::new`], then applies `MURMUR_*` overrides from the
    /// environment and from a `.env` file if one exists.
    pub fn from_env(data_dir: &Path, logs_dir: &Path) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(
                target: "murmur::config::from_env",
                "Loaded environment from {}",
                path.display()
            ),
            Err(_) => tracing::debug!(
                target: "murmur::config::from_env",
                "No .env file found, using process environment only"
            ),
        }

        Self::new(data_dir, logs_dir).apply_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("MURMUR_PUBLIC_BASE_URL") {
            self.public_base_url = url;
        }
        if let Some(value) = parse_var(&lookup, "MURMUR_NOTIFIER_CAPACITY")? {
            self.notifier_capacity = value;
        }
        if let Some(value) = parse_var(&lookup, "MURMUR_SUBSCRIPTION_BUFFER")? {
            self.subscription_buffer = value;
        }
        if let Some(value) = parse_var(&lookup, "MURMUR_MAX_OBJECT_BYTES")? {
            self.blob.max_object_bytes = value;
        }
        if let Some(value) = parse_var(&lookup, "MURMUR_MAX_BUCKET_BYTES")? {
            self.blob.max_bucket_bytes = Some(value);
        }
        self.validate()?;
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.public_base_url.trim().is_empty() {
            return Err(MurmurError::Configuration(
                "public_base_url must not be empty".to_string(),
            ));
        }
        if self.notifier_capacity == 0 || self.subscription_buffer == 0 {
            return Err(MurmurError::Configuration(
                "notifier_capacity and subscription_buffer must be positive".to_string(),
            ));
        }
        if self.default_history_limit == 0 || self.default_history_limit > self.max_history_limit {
            return Err(MurmurError::Configuration(format!(
                "default_history_limit must be in 1..={}",
                self.max_history_limit
            )));
        }
        if self.read_retry.max_attempts == 0 {
            return Err(MurmurError::Configuration(
                "read_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MurmurError::Configuration(format!("{key} has invalid value {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::murmur::error::ErrorKind;

    fn base() -> MurmurConfig {
        MurmurConfig::new(Path::new("/tmp/murmur/data"), Path::new("/tmp/murmur/logs"))
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_new_appends_build_suffix() {
        let config = base();
        let suffix = if cfg!(debug_assertions) { "dev" } else { "release" };
        assert_eq!(config.data_dir, PathBuf::from("/tmp/murmur/data").join(suffix));
        assert_eq!(config.logs_dir, PathBuf::from("/tmp/murmur/logs").join(suffix));
        assert_eq!(config.default_history_limit, 50);
        assert_eq!(config.blob.max_object_bytes, 4 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = base()
            .apply_overrides(env(&[
                ("MURMUR_PUBLIC_BASE_URL", "https://chat.example.com"),
                ("MURMUR_NOTIFIER_CAPACITY", "16"),
                ("MURMUR_SUBSCRIPTION_BUFFER", " 8 "),
                ("MURMUR_MAX_OBJECT_BYTES", "1024"),
                ("MURMUR_MAX_BUCKET_BYTES", "4096"),
            ]))
            .unwrap();

        assert_eq!(config.public_base_url, "https://chat.example.com");
        assert_eq!(config.notifier_capacity, 16);
        assert_eq!(config.subscription_buffer, 8);
        assert_eq!(config.blob.max_object_bytes, 1024);
        assert_eq!(config.blob.max_bucket_bytes, Some(4096));
    }

    #[test]
    fn test_missing_overrides_keep_defaults() {
        let config = base().apply_overrides(env(&[])).unwrap();
        assert_eq!(config.public_base_url, "http://localhost:8080");
        assert_eq!(config.notifier_capacity, 256);
        assert_eq!(config.blob.max_bucket_bytes, None);
    }

    #[test]
    fn test_malformed_override_is_configuration_error() {
        let err = base()
            .apply_overrides(env(&[("MURMUR_NOTIFIER_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, MurmurError::Configuration(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err = base()
            .apply_overrides(env(&[("MURMUR_SUBSCRIPTION_BUFFER", "0")]))
            .unwrap_err();
        assert!(matches!(err, MurmurError::Configuration(_)));
    }

    #[test]
    fn test_retry_delays_grow_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(0), 50);
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::none().should_retry(0));
        assert_eq!(RetryPolicy::new(3, u64::MAX).delay_ms(10), u64::MAX);
    }
}
