//! Settings of the static analysis driver.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Parameters of [`StaticAnalysis`](crate::StaticAnalysis).
///
/// Missing fields take their default values when parsed from JSON.
///
/// # Examples
/// ```
/// use femstate::AnalysisConfig;
///
/// let config = AnalysisConfig::from_json_str(r#"{ "load_steps": 4 }"#).expect("valid");
/// assert_eq!(config.load_steps, 4);
/// assert_eq!(config.max_iterations, AnalysisConfig::default().max_iterations);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Number of equal load increments taking the load factor from 0 to 1.
    pub load_steps: u32,
    /// Norm of the unbalanced force, relative to the external load, below which
    /// an iteration converged.
    pub tolerance: f64,
    /// Newton iterations attempted per increment.
    pub max_iterations: u32,
    /// Smallest fraction of the nominal increment tried before giving up.
    pub min_step_fraction: f64,
    /// Checkpoint every this many committed steps; 0 disables checkpoints.
    pub checkpoint_interval: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            load_steps: 10,
            tolerance: 1.0e-6,
            max_iterations: 25,
            min_step_fraction: 1.0 / 64.0,
            checkpoint_interval: 0,
        }
    }
}

impl AnalysisConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise the
    /// errors of [`AnalysisConfig::from_json_str`].
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Reject values the driver cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load_steps == 0 {
            return Err(ConfigError::Invalid {
                field: "load_steps",
                reason: "must be at least 1",
            });
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::Invalid {
                field: "tolerance",
                reason: "must be positive",
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "max_iterations",
                reason: "must be at least 1",
            });
        }
        if !(self.min_step_fraction > 0.0 && self.min_step_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "min_step_fraction",
                reason: "must lie in (0, 1]",
            });
        }
        Ok(())
    }
}
