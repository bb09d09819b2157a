use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher::TransactionMatcher;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Hard upper bound on pairs per call, imposed by the service.
    pub batch_size: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8788/verify".to_string(),
            api_key: None,
            timeout_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub date_tolerance_days: i64,
    /// Extra days on each side of the page's date span when loading
    /// candidate rows.
    pub window_padding_days: i64,
    pub definite_threshold: f32,
    pub uncertain_floor: f32,
    pub tie_margin: f32,
    pub max_candidates_per_transaction: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        let matcher = TransactionMatcher::default();
        Self {
            date_tolerance_days: matcher.date_tolerance_days,
            window_padding_days: 5,
            definite_threshold: matcher.definite_threshold,
            uncertain_floor: matcher.uncertain_floor,
            tie_margin: matcher.tie_margin,
            max_candidates_per_transaction: matcher.max_candidates,
        }
    }
}

impl MatchingConfig {
    pub fn matcher(&self) -> TransactionMatcher {
        TransactionMatcher {
            date_tolerance_days: self.date_tolerance_days,
            definite_threshold: self.definite_threshold,
            uncertain_floor: self.uncertain_floor,
            tie_margin: self.tie_margin,
            max_candidates: self.max_candidates_per_transaction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub max_pages_per_sync: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self { max_pages_per_sync: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub aggregator: AggregatorConfig,
    pub verifier: VerifierConfig,
    pub matching: MatchingConfig,
    pub sync: PagingConfig,
    pub database_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            verifier: VerifierConfig::default(),
            matching: MatchingConfig::default(),
            sync: PagingConfig::default(),
            database_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.verifier.batch_size == 0 {
            return Err(ConfigError::Invalid("verifier.batch_size must be at least 1".into()));
        }
        if self.matching.max_candidates_per_transaction == 0 {
            return Err(ConfigError::Invalid(
                "matching.max_candidates_per_transaction must be at least 1".into(),
            ));
        }
        if self.matching.date_tolerance_days < 0 || self.matching.window_padding_days < 0 {
            return Err(ConfigError::Invalid("matching day counts must not be negative".into()));
        }
        for (name, value) in [
            ("definite_threshold", self.matching.definite_threshold),
            ("uncertain_floor", self.matching.uncertain_floor),
            ("tie_margin", self.matching.tie_margin),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "matching.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.matching.uncertain_floor > self.matching.definite_threshold {
            return Err(ConfigError::Invalid(
                "matching.uncertain_floor must not exceed matching.definite_threshold".into(),
            ));
        }
        if self.sync.max_pages_per_sync == 0 {
            return Err(ConfigError::Invalid("sync.max_pages_per_sync must be at least 1".into()));
        }
        Ok(())
    }
}
