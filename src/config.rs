//! Configuration management for ratewatch.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{RatewatchError, Result};
use crate::throttle::Throttle;

/// Prefix of environment variables overriding file settings,
/// e.g. `RATEWATCH__MEASURE__WINDOW_MS=5000`.
const ENV_PREFIX: &str = "RATEWATCH";

/// Main configuration for ratewatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewatchConfig {
    /// Measurement window configuration
    #[serde(default)]
    pub measure: MeasureConfig,

    /// Progress report configuration
    #[serde(default)]
    pub report: ReportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Windowed measure configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureConfig {
    /// Number of slots in the probe ring
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            window_ms: default_window_ms(),
        }
    }
}

fn default_buffer_size() -> u32 {
    10
}

fn default_window_ms() -> i64 {
    1000
}

/// Progress report configuration.
///
/// At most one of `max_frequency_hz` and `min_interval_ms` may be set.
/// With neither set, reports are limited to [`DEFAULT_REPORT_HZ`]. A
/// frequency or interval of zero reports every update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Maximum progress reports per second
    #[serde(default)]
    pub max_frequency_hz: Option<f32>,

    /// Minimum milliseconds between progress reports
    #[serde(default)]
    pub min_interval_ms: Option<i64>,

    /// Print the final report as JSON
    #[serde(default)]
    pub json: bool,
}

/// Report frequency used when none is configured.
pub const DEFAULT_REPORT_HZ: f32 = 2.0;

impl ReportConfig {
    /// Throttling policy for progress reports.
    pub fn throttle(&self) -> Throttle {
        match (self.max_frequency_hz, self.min_interval_ms) {
            (_, Some(ms)) => Throttle::MinInterval(ms),
            (Some(hz), None) => Throttle::MaxFrequency(hz),
            (None, None) => Throttle::MaxFrequency(DEFAULT_REPORT_HZ),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit log lines as JSON
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatewatchConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `RATEWATCH__*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            let path = path.as_ref();
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RatewatchConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatewatchConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatewatchError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.measure.buffer_size == 0 {
            return Err(RatewatchError::Config(
                "measure.buffer_size must be positive".to_string(),
            ));
        }
        if self.measure.window_ms <= 0 {
            return Err(RatewatchError::Config(
                "measure.window_ms must be positive".to_string(),
            ));
        }
        if let Some(hz) = self.report.max_frequency_hz {
            if hz.is_nan() {
                return Err(RatewatchError::Config(
                    "report.max_frequency_hz must be a number".to_string(),
                ));
            }
        }
        if self.report.max_frequency_hz.is_some() && self.report.min_interval_ms.is_some() {
            return Err(RatewatchError::Config(
                "set either report.max_frequency_hz or report.min_interval_ms, not both".to_string(),
            ));
        }
        Ok(())
    }
}
