//! Run configuration.
//!
//! All pipeline components take an immutable [`Config`] by reference;
//! there is no process-global state. The record deserializes from a JSON
//! settings file with serde defaults, so a partial file only overrides
//! the keys it names.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ChronicleError;

/// Named model-quality budget an operation requests from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Cheapest model; per-commit classification.
    Fast,
    /// Mid-range model; daily synthesis.
    Balanced,
    /// Strongest model; weekly narration.
    Quality,
}

impl Tier {
    /// All tiers, in ascending quality order.
    pub const ALL: [Self; 3] = [Self::Fast, Self::Balanced, Self::Quality];
}

/// One value per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerTier<T> {
    /// Value for [`Tier::Fast`].
    pub fast: T,
    /// Value for [`Tier::Balanced`].
    pub balanced: T,
    /// Value for [`Tier::Quality`].
    pub quality: T,
}

impl<T> PerTier<T> {
    /// Returns the value configured for `tier`.
    pub fn get(&self, tier: Tier) -> &T {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Balanced => &self.balanced,
            Tier::Quality => &self.quality,
        }
    }
}

/// Fan-out bounds for the three pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concurrency {
    /// Parallel Tier-1 calls over commits.
    #[serde(default = "default_t1_bound")]
    pub t1: usize,
    /// Parallel Tier-2 calls over days.
    #[serde(default = "default_t2_bound")]
    pub t2: usize,
    /// Parallel Tier-3 calls over weeks.
    #[serde(default = "default_t3_bound")]
    pub t3: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            t1: default_t1_bound(),
            t2: default_t2_bound(),
            t3: default_t3_bound(),
        }
    }
}

fn default_t1_bound() -> usize {
    let cpus = thread::available_parallelism().map_or(4, usize::from);
    (cpus * 2).min(8)
}

fn default_t2_bound() -> usize {
    4
}

fn default_t3_bound() -> usize {
    1
}

/// Retry/backoff policy for the LLM gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per logical call.
    #[serde(default = "default_retry_max")]
    pub max: u32,
    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    /// Upper bound on a single backoff delay, in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: default_retry_max(),
            base_ms: default_retry_base_ms(),
            max_ms: default_retry_max_ms(),
        }
    }
}

fn default_retry_max() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    30_000
}

/// Immutable configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Concrete model name per tier.
    pub tier_models: PerTier<String>,
    /// Per-tier output token cap.
    pub max_tokens: PerTier<u32>,
    /// Generation temperature.
    pub temperature: f32,
    /// Per-tier token-bucket refill rate, in calls per minute.
    pub rate_per_min: PerTier<u32>,
    /// Per-tier token-bucket burst capacity.
    pub burst: PerTier<u32>,
    /// Fan-out bounds.
    pub concurrency: Concurrency,
    /// Conventional-commit prefixes that mark a commit candidate-trivial.
    pub trivial_prefixes: Vec<String>,
    /// Regex patterns; a commit whose every file matches one is
    /// candidate-trivial.
    pub trivial_path_patterns: Vec<String>,
    /// Version string baked into every cache key; bump to expire a prompt
    /// generation.
    pub prompt_template_version: String,
    /// Overlap between adjacent prompt chunks as a fraction of chunk size.
    pub chunk_overlap: f64,
    /// Input token budget handed to the prompt fitter.
    pub input_token_budget: usize,
    /// Retry/backoff policy.
    pub retries: RetryConfig,
    /// Per-LLM-call timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Wall-clock timeout for the whole run, in milliseconds. `None`
    /// means unbounded.
    pub run_timeout_ms: Option<u64>,
    /// Directory holding the artifact cache (one file per key).
    pub cache_dir: PathBuf,
    /// Group commits into days by UTC instead of the author's timezone.
    pub group_days_in_utc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tier_models: PerTier {
                fast: "claude-3-5-haiku-latest".to_string(),
                balanced: "claude-sonnet-4-5".to_string(),
                quality: "claude-opus-4-1".to_string(),
            },
            max_tokens: PerTier {
                fast: 4_096,
                balanced: 8_192,
                quality: 16_384,
            },
            temperature: 0.3,
            rate_per_min: PerTier {
                fast: 60,
                balanced: 30,
                quality: 10,
            },
            burst: PerTier {
                fast: 10,
                balanced: 5,
                quality: 2,
            },
            concurrency: Concurrency::default(),
            trivial_prefixes: vec!["style".to_string(), "chore".to_string()],
            trivial_path_patterns: Vec::new(),
            prompt_template_version: "v1".to_string(),
            chunk_overlap: 0.10,
            input_token_budget: 100_000,
            retries: RetryConfig::default(),
            timeout_ms: 300_000,
            run_timeout_ms: None,
            cache_dir: default_cache_dir(),
            group_days_in_utc: false,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("git-chronicle")
}

impl Config {
    /// Loads configuration from a JSON settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants a run depends on. Returns
    /// [`ChronicleError::Input`] describing the first violation.
    pub fn validate(&self) -> Result<(), ChronicleError> {
        for tier in Tier::ALL {
            if self.tier_models.get(tier).is_empty() {
                return Err(ChronicleError::Input(format!(
                    "empty model name for tier {tier:?}"
                )));
            }
            if *self.rate_per_min.get(tier) == 0 {
                return Err(ChronicleError::Input(format!(
                    "rate_per_min must be positive for tier {tier:?}"
                )));
            }
        }
        if self.concurrency.t1 == 0 || self.concurrency.t2 == 0 || self.concurrency.t3 == 0 {
            return Err(ChronicleError::Input(
                "concurrency bounds must be positive".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.chunk_overlap) {
            return Err(ChronicleError::Input(format!(
                "chunk_overlap {} outside [0.0, 0.5]",
                self.chunk_overlap
            )));
        }
        if self.input_token_budget == 0 {
            return Err(ChronicleError::Input(
                "input_token_budget must be positive".to_string(),
            ));
        }
        for pattern in &self.trivial_path_patterns {
            Regex::new(pattern).map_err(|e| {
                ChronicleError::Input(format!("invalid trivial_path_pattern '{pattern}': {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_t1_bound_is_capped() {
        assert!(default_t1_bound() <= 8);
        assert!(default_t1_bound() >= 1);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "temperature": 0.7, "trivial_prefixes": ["style", "chore", "docs"] }}"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.trivial_prefixes.len(), 3);
        // untouched keys keep their defaults
        assert_eq!(config.retries.max, 5);
        assert_eq!(config.timeout_ms, 300_000);
    }

    #[test]
    fn rejects_bad_path_pattern() {
        let config = Config {
            trivial_path_patterns: vec!["([".to_string()],
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("trivial_path_pattern"));
    }

    #[test]
    fn rejects_zero_rate() {
        let mut config = Config::default();
        config.rate_per_min.fast = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_overlap_above_half() {
        let config = Config {
            chunk_overlap: 0.9,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
