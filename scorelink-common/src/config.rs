//! Configuration loading and validation
//!
//! Settings resolve in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (via the CLI's `env` bindings)
//! 3. TOML config file
//! 4. Compiled defaults (fallback)
//!
//! A missing default config file is not an error: the loader logs a warning
//! and continues with defaults. An explicitly requested file that does not
//! exist is a configuration error.

use crate::{atomic_file, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SCORELINK_CONFIG";

/// Root TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub matching: MatchingSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// External tool configuration keyed by stage name
    #[serde(default)]
    pub stages: BTreeMap<String, StageSettings>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Structured JSON execution log path
    ///
    /// Defaults to `<output_dir>/execution_log.jsonl` when unset.
    #[serde(default)]
    pub execution_log: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            execution_log: None,
        }
    }
}

/// Which tied-note timing rule to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicyKind {
    /// Onsets proportional to tempo-converted notated durations
    #[default]
    Proportional,
    /// Equal split of the performed duration
    Linear,
}

/// Matching engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingSettings {
    /// Maximum |estimate - performance| accepted as a match
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: f64,

    /// Shift estimates so the first score onset meets the first performance onset
    #[serde(default)]
    pub auto_align: bool,

    /// Unmatched rate above which a warning is logged
    #[serde(default = "default_unmatched_warn_rate")]
    pub unmatched_warn_rate: f64,

    #[serde(default)]
    pub tie_policy: TiePolicyKind,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            tolerance_ms: default_tolerance_ms(),
            auto_align: false,
            unmatched_warn_rate: default_unmatched_warn_rate(),
            tie_policy: TiePolicyKind::default(),
        }
    }
}

/// Stage scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One stage at a time in topological order
    #[default]
    Sequential,
    /// Ready stages run concurrently up to `max_workers`
    BoundedParallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => f.write_str("sequential"),
            ExecutionMode::BoundedParallel => f.write_str("bounded_parallel"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" | "seq" => Ok(ExecutionMode::Sequential),
            "bounded_parallel" | "parallel" => Ok(ExecutionMode::BoundedParallel),
            other => Err(Error::Config(format!(
                "unknown execution mode '{}' (expected sequential or bounded_parallel)",
                other
            ))),
        }
    }
}

/// Retry settings for external invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Per-stage circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a trial call
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Pipeline executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_true")]
    pub continue_on_non_critical_failure: bool,
    /// Default timeout per external invocation
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_workers: default_max_workers(),
            continue_on_non_critical_failure: true,
            stage_timeout_secs: default_stage_timeout_secs(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// External tool configuration for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// argv template; the first element is the program
    #[serde(default)]
    pub command: Vec<String>,
    /// Declared output templates (expanded per entry)
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Declared input templates, checked before invocation
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Overrides `pipeline.stage_timeout_secs`
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Overrides the stage's built-in criticality
    #[serde(default)]
    pub critical: Option<bool>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            timeout_secs: None,
            critical: None,
            enabled: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tolerance_ms() -> f64 {
    100.0
}

fn default_unmatched_warn_rate() -> f64 {
    0.25
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_max_workers() -> usize {
    4
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl TomlConfig {
    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !self.matching.tolerance_ms.is_finite() || self.matching.tolerance_ms <= 0.0 {
            return Err(Error::Config(format!(
                "matching.tolerance_ms must be > 0, got {}",
                self.matching.tolerance_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.matching.unmatched_warn_rate) {
            return Err(Error::Config(
                "matching.unmatched_warn_rate must be within 0.0-1.0".to_string(),
            ));
        }
        if self.pipeline.max_workers == 0 {
            return Err(Error::Config("pipeline.max_workers must be >= 1".to_string()));
        }
        if self.pipeline.retry.max_attempts == 0 {
            return Err(Error::Config(
                "pipeline.retry.max_attempts must be >= 1".to_string(),
            ));
        }
        if !self.pipeline.retry.multiplier.is_finite() || self.pipeline.retry.multiplier < 1.0 {
            return Err(Error::Config(
                "pipeline.retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.pipeline.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "pipeline.circuit_breaker.failure_threshold must be >= 1".to_string(),
            ));
        }
        for (name, stage) in &self.stages {
            if stage.enabled && stage.command.is_empty() {
                return Err(Error::Config(format!(
                    "stages.{}.command must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Default config file location: `<config_dir>/scorelink/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("scorelink").join("config.toml"))
}

/// Load configuration
///
/// `explicit` is the `--config` / `SCORELINK_CONFIG` value. Without it the
/// default location is tried; a missing default file yields defaults.
///
/// Returns the config together with the file it was read from, if any.
pub fn load_config(explicit: Option<&Path>) -> Result<(TomlConfig, Option<PathBuf>)> {
    let (path, required) = match explicit {
        Some(path) => (Some(path.to_path_buf()), true),
        None => (default_config_path(), false),
    };

    let Some(path) = path else {
        warn!("Could not determine config directory, using compiled defaults");
        return Ok((TomlConfig::default(), None));
    };

    if !path.exists() {
        if required {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        warn!(
            path = %path.display(),
            "Config file not found, using compiled defaults"
        );
        return Ok((TomlConfig::default(), None));
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config = TomlConfig::from_toml_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    config.validate()?;

    info!(path = %path.display(), "Configuration loaded");
    Ok((config, Some(path)))
}

/// Write a configuration file atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    atomic_file::write_atomic(path, content.as_bytes())
}
