//! Configuration loading and typed config structures for steplog.
//!
//! The configuration lives in a YAML file (by convention
//! `steplog-config.yaml`). Every field has a default, so an empty file is a
//! valid Summary-mode configuration. A handful of environment variables
//! override the file after parsing:
//!
//! - `STEPLOG_MODE` overrides `mode` (`summary`, `stream`, `live_analysis`)
//! - `STEPLOG_STREAM_PATH` overrides `persistence.stream_path`
//! - `STEPLOG_ANALYZE` switches to live analysis with the given target
//!   event count

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// What happens to the steps of an event when it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Keep only per-volume counters and log a report per event.
    #[default]
    Summary,
    /// Keep every step and persist the stream per event.
    Stream,
    /// Keep every step and fold it into the analyses per event.
    LiveAnalysis,
}

impl RunMode {
    /// Whether the aggregators retain the full event stream.
    pub const fn retains_steps(self) -> bool {
        matches!(self, Self::Stream | Self::LiveAnalysis)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "summary" => Some(Self::Summary),
            "stream" => Some(Self::Stream),
            "live_analysis" | "analysis" => Some(Self::LiveAnalysis),
            _ => None,
        }
    }
}

/// Top-level steplog configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SteplogConfig {
    /// Aggregation mode, fixed for the whole run.
    #[serde(default)]
    pub mode: RunMode,

    /// Live-analysis settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Volume grouping and sensitivity.
    #[serde(default)]
    pub geometry: GeometryConfig,

    /// Where persisted streams go.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SteplogConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse_yaml(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_yaml(yaml)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse YAML without consulting the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Apply the `STEPLOG_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("STEPLOG_MODE") {
            match RunMode::parse(&val) {
                Some(mode) => self.mode = mode,
                None => warn!(value = %val, "ignoring unrecognised STEPLOG_MODE"),
            }
        }
        if let Some(val) = lookup("STEPLOG_STREAM_PATH") {
            self.persistence.stream_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("STEPLOG_ANALYZE") {
            match val.trim().parse::<u64>() {
                Ok(target) => {
                    self.mode = RunMode::LiveAnalysis;
                    self.analysis.target_events = Some(target);
                }
                Err(_) => warn!(value = %val, "ignoring non-numeric STEPLOG_ANALYZE"),
            }
        }
    }
}

/// Live-analysis configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisConfig {
    /// Finalize the analyses after this many events.
    #[serde(default)]
    pub target_events: Option<u64>,

    /// Keep accepted steps and write them next to the buckets.
    #[serde(default)]
    pub retain_raw_steps: bool,

    /// Classify the last pending secondary of each event at the event's end.
    #[serde(default = "default_true")]
    pub classify_final_track: bool,

    /// Number of categories kept in the sorted top-N buckets.
    #[serde(default = "default_top_volumes")]
    pub top_volumes: usize,

    /// Declarative step filter.
    #[serde(default)]
    pub filter: Option<FilterConfig>,

    /// Directory receiving the analysis output files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            target_events: None,
            retain_raw_steps: false,
            classify_final_track: true,
            top_volumes: default_top_volumes(),
            filter: None,
            output_dir: default_output_dir(),
        }
    }
}

/// Declarative description of which steps an analysis should see.
///
/// Empty lists mean "no restriction". Every populated criterion must hold
/// for a step to be accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FilterConfig {
    /// Accept only steps in these modules.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Accept only steps in these volumes.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Accept only these particle types.
    #[serde(default)]
    pub pdg_codes: Vec<i32>,

    /// Lower energy bound, inclusive.
    #[serde(default)]
    pub min_energy: Option<f32>,

    /// Upper energy bound, inclusive.
    #[serde(default)]
    pub max_energy: Option<f32>,

    /// Accept only steps in sensitive volumes.
    #[serde(default)]
    pub sensitive_only: bool,
}

/// Geometry metadata sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GeometryConfig {
    /// Inline volume name to module name map.
    #[serde(default)]
    pub volume_modules: BTreeMap<String, String>,

    /// Inline list of sensitive volume names.
    #[serde(default)]
    pub sensitive_volumes: Vec<String>,

    /// File of `<volume> <module>` lines.
    #[serde(default)]
    pub volume_map_file: Option<PathBuf>,

    /// File of sensitive volume names, one per line.
    #[serde(default)]
    pub sensitive_volume_file: Option<PathBuf>,
}

/// Stream persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersistenceConfig {
    /// JSON-lines file receiving Stream-mode records.
    #[serde(default = "default_stream_path")]
    pub stream_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            stream_path: default_stream_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_true() -> bool {
    true
}

const fn default_top_volumes() -> usize {
    30
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("steplog-analysis")
}

fn default_stream_path() -> PathBuf {
    PathBuf::from("steplog-stream.jsonl")
}

fn default_log_level() -> String {
    "info".to_owned()
}
