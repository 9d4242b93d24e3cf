//! TOML configuration for salesscope.
//!
//! A single `Config` is built once at process start and handed by reference
//! to every component. Every section has compiled-in defaults, so an empty
//! (or missing) file is a valid configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::series::Granularity;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SALESSCOPE_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub hypothesis: HypothesisConfig,
    #[serde(default)]
    pub dialogue: DialogueConfig,
    #[serde(default)]
    pub followup: FollowUpConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `SALESSCOPE_CONFIG`.
    /// 2. `./salesscope.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SALESSCOPE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new("salesscope.toml");
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Rolling z-score detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Flag when `|value - mean| > z_threshold * std_dev`.
    pub z_threshold: f64,
    /// Baselines with fewer samples than this are skipped.
    pub min_samples: usize,
    /// Trailing window length, in buckets, for daily series.
    pub daily_window: usize,
    /// Trailing window length, in buckets, for weekly series.
    pub weekly_window: usize,
    /// Trailing window length, in buckets, for monthly series.
    pub monthly_window: usize,
    /// Severity bands on |z|: `[mild, moderate)` is mild and so on.
    pub severity: SeverityBands,
}

impl DetectionConfig {
    pub fn window_for(&self, granularity: Granularity) -> usize {
        match granularity {
            Granularity::Day => self.daily_window,
            Granularity::Week => self.weekly_window,
            Granularity::Month => self.monthly_window,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            min_samples: 5,
            daily_window: 90,
            weekly_window: 12,
            monthly_window: 12,
            severity: SeverityBands::default(),
        }
    }
}

/// Lower bounds of each severity band on |z|.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityBands {
    pub mild: f64,
    pub moderate: f64,
    pub severe: f64,
}

impl Default for SeverityBands {
    fn default() -> Self {
        Self {
            mild: 2.0,
            moderate: 3.0,
            severe: 4.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Most negative lag tried, in days.
    pub lag_min_days: i64,
    /// Most positive lag tried, in days.
    pub lag_max_days: i64,
    /// Number of results kept per anomaly.
    pub top_k: usize,
    /// p-values above this are reported as non-significant.
    pub significance: f64,
    /// Minimum aligned samples for a series/lag pair to count.
    pub min_overlap: usize,
    /// Buckets taken on each side of the anomaly.
    pub context_buckets: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            lag_min_days: -7,
            lag_max_days: 7,
            top_k: 3,
            significance: 0.05,
            min_overlap: 10,
            context_buckets: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Hypotheses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypothesisConfig {
    /// Correlations weaker than this do not produce a hypothesis.
    pub min_coefficient: f64,
    /// Confidence of the catch-all "internal action" hypothesis.
    pub fallback_confidence: f64,
    /// Optional JSON template table overriding the embedded one.
    pub template_path: Option<PathBuf>,
}

impl Default for HypothesisConfig {
    fn default() -> Self {
        Self {
            min_coefficient: 0.3,
            fallback_confidence: 0.1,
            template_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dialogue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Hypothesis turns before the open-ended escalation question.
    pub max_turns: u32,
    /// Sessions idle in AwaitingAnswer longer than this are terminated.
    /// `None` keeps them open indefinitely.
    pub idle_expiry_hours: Option<u64>,
    /// Past explanations fetched from the retrieval store at session start.
    pub precedent_limit: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_turns: 2,
            idle_expiry_hours: None,
            precedent_limit: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Follow-ups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowUpConfig {
    /// Seconds between scheduler polls.
    pub poll_interval_secs: u64,
    /// Claimed tasks not completed within this many seconds become due again.
    pub claim_lease_secs: i64,
    pub short_term_days: i64,
    pub medium_term_days: i64,
    pub long_term_days: i64,
    pub yearly_days: i64,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            claim_lease_secs: 3600,
            short_term_days: 7,
            medium_term_days: 30,
            long_term_days: 90,
            yearly_days: 365,
        }
    }
}

// ---------------------------------------------------------------------------
// External services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Chat-completions endpoint. Unset means template phrasing only.
    pub llm_endpoint: Option<String>,
    pub llm_model: String,
    /// Name of the environment variable holding the API key.
    pub llm_api_key_env: String,
    pub request_timeout_secs: u64,
    /// Attempts per external call, including the first.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Dimensions of the local hashing embedder.
    pub embedding_dims: usize,
    /// Retrieval-store collection for responses and summaries.
    pub collection: String,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            llm_endpoint: None,
            llm_model: "gpt-4o-mini".to_string(),
            llm_api_key_env: "SALESSCOPE_LLM_API_KEY".to_string(),
            request_timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            embedding_dims: 256,
            collection: "anomaly_knowledge".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/salesscope.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
