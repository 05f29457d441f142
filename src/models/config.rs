//! Configuration models for medallion.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for medallion.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream file source configuration
    pub source: SourceConfig,

    /// Pipeline-wide settings
    pub pipeline: PipelineConfig,

    /// Cleanse stage settings
    #[serde(default)]
    pub cleanse: CleanseConfig,

    /// Aggregate stage settings
    #[serde(default)]
    pub aggregate: AggregateConfig,
}

/// Upstream source: a directory of arriving JSONL files.
///
/// K_i: Files are append-only. Arriving files are never modified in
/// place, and names grow monotonically so consumption order is stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory to watch for arriving files (supports ${ENV_VAR})
    pub dir: PathBuf,

    /// Glob pattern matched against file names
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Maximum retries when the source is temporarily unreadable
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff between retries in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_pattern() -> String {
    "*.json".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root directory for per-run checkpoints and stage outputs
    pub data_dir: PathBuf,

    /// Micro-batch trigger interval in milliseconds
    #[serde(default = "default_trigger_interval_ms")]
    pub trigger_interval_ms: u64,

    /// Timeout for waiting until the whole chain is quiescent, in seconds
    #[serde(default = "default_quiesce_timeout_secs")]
    pub quiesce_timeout_secs: u64,
}

fn default_trigger_interval_ms() -> u64 {
    250
}

fn default_quiesce_timeout_secs() -> u64 {
    30
}

/// Cleanse stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanseConfig {
    /// Field that must be present, numeric and positive for a record to
    /// survive the cleanse stage
    #[serde(default = "default_required_field")]
    pub required_field: String,
}

fn default_required_field() -> String {
    "postcode".to_string()
}

impl Default for CleanseConfig {
    fn default() -> Self {
        Self {
            required_field: default_required_field(),
        }
    }
}

/// Aggregate stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    /// Field to group the summary by
    #[serde(default = "default_group_by")]
    pub group_by: String,

    /// Optional field that must be non-null for a record to be counted
    #[serde(default)]
    pub count_field: Option<String>,
}

fn default_group_by() -> String {
    "state".to_string()
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            group_by: default_group_by(),
            count_field: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;

        // Paths may reference environment variables
        config.source.dir = expand_path(&config.source.dir);
        config.pipeline.data_dir = expand_path(&config.pipeline.data_dir);

        config.validate()?;
        Ok(config)
    }

    /// Validate configured values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.pattern.is_empty() {
            return Err(ConfigError::Invalid(
                "source.pattern must not be empty".to_string(),
            ));
        }
        if self.pipeline.trigger_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.trigger_interval_ms must be positive".to_string(),
            ));
        }
        if self.cleanse.required_field.is_empty() {
            return Err(ConfigError::Invalid(
                "cleanse.required_field must not be empty".to_string(),
            ));
        }
        if self.aggregate.group_by.is_empty() {
            return Err(ConfigError::Invalid(
                "aggregate.group_by must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

fn expand_path(path: &std::path::Path) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Invalid values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
