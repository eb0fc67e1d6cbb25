//! Configuration for the producer service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ProducerError, Result};
use crate::pattern::ArtifactNamePattern;

/// How the producer reacts to being over its storage budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QuotaMode {
    /// Block production until retention brings usage under budget, failing
    /// with a quota deadlock after the configured timeout.
    Backpressure,
    /// Evict immediately and keep producing, even if eviction could not
    /// fully clear the over-budget state.
    Eviction,
}

impl Default for QuotaMode {
    fn default() -> Self {
        QuotaMode::Backpressure
    }
}

/// Retention stopping predicate. Both variants reduce to the same
/// oldest-first elimination, differing only in when elimination stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionLimit {
    /// Keep total artifact bytes at or under this limit.
    MaxTotalBytes(u64),
    /// Keep at most this many artifacts.
    MaxArtifactCount(u64),
}

impl RetentionLimit {
    /// Whether a directory holding `total_bytes` across `artifact_count`
    /// artifacts exceeds this limit.
    pub fn is_exceeded(&self, total_bytes: u64, artifact_count: u64) -> bool {
        match self {
            RetentionLimit::MaxTotalBytes(limit) => total_bytes > *limit,
            RetentionLimit::MaxArtifactCount(limit) => artifact_count > *limit,
        }
    }
}

/// Configuration for the producer service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory artifacts are written to.
    pub output_dir: PathBuf,

    /// Filename prefix for artifacts.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Filename suffix for artifacts.
    #[serde(default = "default_name_suffix")]
    pub name_suffix: String,

    /// Token refill rate in artifacts per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_sec: f64,

    /// Token bucket capacity (maximum burst size).
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: f64,

    /// Storage budget in bytes. Mutually exclusive with
    /// `max_artifact_count`.
    #[serde(default)]
    pub byte_limit: Option<u64>,

    /// Maximum number of artifacts to keep. Mutually exclusive with
    /// `byte_limit`.
    #[serde(default)]
    pub max_artifact_count: Option<u64>,

    /// Reaction to an exceeded budget.
    #[serde(default)]
    pub quota_mode: QuotaMode,

    /// Check the quota every this many artifacts. The usage scan is O(n) in
    /// directory size, so checking on a cadence trades staleness for
    /// throughput.
    #[serde(default = "default_quota_sample_every")]
    pub quota_sample_every: u64,

    /// How long backpressure mode may wait for space before failing with a
    /// quota deadlock. `None` waits indefinitely.
    #[serde(default)]
    pub quota_wait_timeout_secs: Option<u64>,

    /// Stop after producing this many artifacts. `None` runs until
    /// cancelled.
    #[serde(default)]
    pub max_artifacts: Option<u64>,

    /// Name of the single entry inside each artifact.
    #[serde(default = "default_entry_name")]
    pub entry_name: String,

    /// Content of the entry inside each artifact.
    #[serde(default = "default_entry_content")]
    pub entry_content: String,
}

fn default_name_prefix() -> String {
    "artifact-".to_string()
}

fn default_name_suffix() -> String {
    ".tar.gz".to_string()
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_bucket_capacity() -> f64 {
    1.0
}

fn default_quota_sample_every() -> u64 {
    1
}

fn default_entry_name() -> String {
    "william.txt".to_string()
}

fn default_entry_content() -> String {
    "William".to_string()
}

impl Config {
    /// Configuration with defaults for everything but the output directory.
    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            name_prefix: default_name_prefix(),
            name_suffix: default_name_suffix(),
            refill_rate_per_sec: default_refill_rate(),
            bucket_capacity: default_bucket_capacity(),
            byte_limit: None,
            max_artifact_count: None,
            quota_mode: QuotaMode::default(),
            quota_sample_every: default_quota_sample_every(),
            quota_wait_timeout_secs: None,
            max_artifacts: None,
            entry_name: default_entry_name(),
            entry_content: default_entry_content(),
        }
    }

    /// Load configuration from a TOML file.
    pub async fn load(path: &str) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProducerError::Configuration(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            ProducerError::Configuration(format!("Failed to parse config file {}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Called before the producer starts; any
    /// failure here is fatal before `Running`.
    pub fn validate(&self) -> Result<()> {
        if !self.refill_rate_per_sec.is_finite() || self.refill_rate_per_sec <= 0.0 {
            return Err(ProducerError::Configuration(
                "refill_rate_per_sec must be positive".to_string(),
            ));
        }
        if !self.bucket_capacity.is_finite() || self.bucket_capacity < 1.0 {
            return Err(ProducerError::Configuration(
                "bucket_capacity must be at least 1".to_string(),
            ));
        }
        if self.byte_limit.is_some() && self.max_artifact_count.is_some() {
            return Err(ProducerError::Configuration(
                "byte_limit and max_artifact_count are mutually exclusive".to_string(),
            ));
        }
        if self.byte_limit == Some(0) {
            return Err(ProducerError::Configuration(
                "byte_limit must be greater than zero".to_string(),
            ));
        }
        if self.max_artifact_count == Some(0) {
            return Err(ProducerError::Configuration(
                "max_artifact_count must be greater than zero".to_string(),
            ));
        }
        if self.quota_sample_every == 0 {
            return Err(ProducerError::Configuration(
                "quota_sample_every must be greater than zero".to_string(),
            ));
        }
        if self.entry_name.is_empty() {
            return Err(ProducerError::Configuration(
                "entry_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The artifact naming pattern for this configuration.
    pub fn pattern(&self) -> ArtifactNamePattern {
        ArtifactNamePattern::new(self.name_prefix.clone(), self.name_suffix.clone())
    }

    /// The configured retention limit, if any. `None` disables quota
    /// enforcement entirely.
    pub fn retention_limit(&self) -> Option<RetentionLimit> {
        if let Some(bytes) = self.byte_limit {
            Some(RetentionLimit::MaxTotalBytes(bytes))
        } else {
            self.max_artifact_count.map(RetentionLimit::MaxArtifactCount)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::with_output_dir("/tmp/artifacts");
        assert!(config.validate().is_ok());
        assert_eq!(config.entry_name, "william.txt");
        assert_eq!(config.entry_content, "William");
        assert!(config.retention_limit().is_none());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut config = Config::with_output_dir("/tmp/artifacts");
        config.refill_rate_per_sec = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conflicting_limits_rejected() {
        let mut config = Config::with_output_dir("/tmp/artifacts");
        config.byte_limit = Some(1024);
        config.max_artifact_count = Some(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = Config::with_output_dir("/tmp/artifacts");
        config.byte_limit = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::with_output_dir("/tmp/artifacts");
        config.max_artifact_count = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_limit_selection() {
        let mut config = Config::with_output_dir("/tmp/artifacts");
        config.byte_limit = Some(1024);
        assert_eq!(
            config.retention_limit(),
            Some(RetentionLimit::MaxTotalBytes(1024))
        );

        config.byte_limit = None;
        config.max_artifact_count = Some(3);
        assert_eq!(
            config.retention_limit(),
            Some(RetentionLimit::MaxArtifactCount(3))
        );
    }

    #[test]
    fn test_limit_predicates() {
        let bytes = RetentionLimit::MaxTotalBytes(100);
        assert!(!bytes.is_exceeded(100, 5));
        assert!(bytes.is_exceeded(101, 5));

        let count = RetentionLimit::MaxArtifactCount(3);
        assert!(!count.is_exceeded(1000, 3));
        assert!(count.is_exceeded(0, 4));
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
output_dir = "/var/lib/stockpile"
refill_rate_per_sec = 2.5
byte_limit = 1048576
quota_mode = "eviction"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/var/lib/stockpile"));
        assert_eq!(config.refill_rate_per_sec, 2.5);
        assert_eq!(config.byte_limit, Some(1048576));
        assert_eq!(config.quota_mode, QuotaMode::Eviction);
        assert_eq!(config.name_prefix, "artifact-");
        assert!(config.validate().is_ok());
    }
}
