//! Positioner configuration.
//!
//! A [`PositionerConfig`] names the control points a positioner binds to and
//! its move defaults. It is loaded with Figment from a TOML file (or string),
//! with `DAQ_POSITIONER_`-prefixed environment variables layered on top.
//!
//! ```toml
//! name = "cryostat"
//! setpoint_point = "TC1:SP"
//! readback_points = ["TC1:RBV", "TC1:SAMPLE"]
//! primary_readback = 0
//! tolerance = 0.05
//! timeout = "10m"
//! settle_time = "30s"
//! ```
//!
//! Durations use humantime syntax (`"500ms"`, `"2s"`, `"10m"`).

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::control_point::PointValue;
use crate::error::{PositionerError, PositionerResult};
use crate::tolerance::Tolerance;

/// Prefix for environment overrides, e.g. `DAQ_POSITIONER_TIMEOUT=30s`.
pub const ENV_PREFIX: &str = "DAQ_POSITIONER_";

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// No file at the given path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parsing or semantic validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Configuration of one positioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionerConfig {
    /// Positioner name, used in logs.
    pub name: String,

    /// Address of the writable setpoint.
    pub setpoint_point: String,

    /// Readback addresses; all must be within tolerance for a move to finish.
    pub readback_points: Vec<String>,

    /// Index into `readback_points` reported by `position()`.
    #[serde(default)]
    pub primary_readback: usize,

    /// Hardware "motion done" flag.
    #[serde(default)]
    pub done_point: Option<String>,

    /// Point written to halt motion.
    #[serde(default)]
    pub stop_point: Option<String>,

    /// Value written to `stop_point`.
    #[serde(default = "default_stop_value")]
    pub stop_value: PointValue,

    /// Default completion tolerance.
    #[serde(default)]
    pub tolerance: Option<f64>,

    /// Move deadline. Unset means no deadline.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Default settle time after entering tolerance.
    #[serde(default, with = "humantime_serde")]
    pub settle_time: Duration,
}

fn default_stop_value() -> PointValue {
    PointValue::Int(1)
}

impl PositionerConfig {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> PositionerResult<()> {
        if self.name.trim().is_empty() {
            return Err(PositionerError::Configuration(
                "positioner name must not be empty".to_string(),
            ));
        }
        if self.setpoint_point.trim().is_empty() {
            return Err(PositionerError::Configuration(format!(
                "positioner '{}' has an empty setpoint_point",
                self.name
            )));
        }
        if self.readback_points.is_empty() {
            return Err(PositionerError::Configuration(format!(
                "positioner '{}' needs at least one readback point",
                self.name
            )));
        }
        if self.primary_readback >= self.readback_points.len() {
            return Err(PositionerError::Configuration(format!(
                "primary_readback {} out of range ({} readback points)",
                self.primary_readback,
                self.readback_points.len()
            )));
        }
        if let Some(tolerance) = self.tolerance {
            Tolerance::new(tolerance)?;
        }
        Ok(())
    }
}

/// Load a positioner configuration from a TOML file.
///
/// Environment variables prefixed with [`ENV_PREFIX`] override file values.
pub fn load_config(path: &Path) -> Result<PositionerConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
    }

    debug!("Loading positioner config from: {}", path.display());

    let config: PositionerConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    finish_loading(config)
}

/// Load a positioner configuration from TOML text.
pub fn load_config_str(toml: &str) -> Result<PositionerConfig> {
    let config: PositionerConfig = Figment::new()
        .merge(Toml::string(toml))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .context("Failed to parse positioner config")?;

    finish_loading(config)
}

fn finish_loading(config: PositionerConfig) -> Result<PositionerConfig> {
    config
        .validate()
        .map_err(|e| ConfigLoadError::ValidationError(e.to_string()))?;

    info!(
        "Loaded positioner config: {} ({} readbacks)",
        config.name,
        config.readback_points.len()
    );
    Ok(config)
}
