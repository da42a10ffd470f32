//! Simulation configuration types.

use serde::{Deserialize, Serialize};

/// Adaptive step control of the network integrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegratorConfig {
    /// Absolute error tolerance.
    #[serde(default = "default_tolerance")]
    pub abs_tolerance: f64,
    /// Relative error tolerance.
    #[serde(default = "default_tolerance")]
    pub rel_tolerance: f64,
    /// Step size used for the first step of a fresh trajectory.
    #[serde(default = "default_initial_step")]
    pub initial_step: f64,
    /// Smallest step the controller may propose before the integration
    /// is declared diverged.
    #[serde(default = "default_min_step")]
    pub min_step: f64,
    /// Upper bound on any single step.
    #[serde(default = "default_max_step")]
    pub max_step: f64,
    /// Concentrations below this value are snapped to zero.
    #[serde(default = "default_min_concentration")]
    pub min_concentration: f64,
    /// Concentrations above this value are a divergence.
    #[serde(default = "default_max_concentration")]
    pub max_concentration: f64,
    /// Safety factor applied to the proposed step scale.
    #[serde(default = "default_safety")]
    pub safety: f64,
    /// Smallest step scale after an accepted or rejected step.
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,
    /// Largest step scale after an accepted step.
    #[serde(default = "default_max_scale")]
    pub max_scale: f64,
    /// Exponent on the current error ratio.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Exponent on the previous error ratio (step memory).
    #[serde(default)]
    pub beta: f64,
    /// Floor and initial value for the remembered error ratio.
    #[serde(default = "default_min_error_memory")]
    pub min_error_memory: f64,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            abs_tolerance: default_tolerance(),
            rel_tolerance: default_tolerance(),
            initial_step: default_initial_step(),
            min_step: default_min_step(),
            max_step: default_max_step(),
            min_concentration: default_min_concentration(),
            max_concentration: default_max_concentration(),
            safety: default_safety(),
            min_scale: default_min_scale(),
            max_scale: default_max_scale(),
            alpha: default_alpha(),
            beta: 0.0,
            min_error_memory: default_min_error_memory(),
        }
    }
}

fn default_tolerance() -> f64 {
    1e-6
}
fn default_initial_step() -> f64 {
    1e-3
}
fn default_min_step() -> f64 {
    1e-6
}
fn default_max_step() -> f64 {
    1.0
}
fn default_min_concentration() -> f64 {
    1e-6
}
fn default_max_concentration() -> f64 {
    1e9
}
fn default_safety() -> f64 {
    0.9
}
fn default_min_scale() -> f64 {
    0.333
}
fn default_max_scale() -> f64 {
    6.0
}
fn default_alpha() -> f64 {
    1.0 / 8.0
}
fn default_min_error_memory() -> f64 {
    1e-4
}

/// Error thresholds and simulation switches used when scoring a genotype.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SimParams {
    /// Deviation tolerated at each observation before it counts as error.
    #[serde(default)]
    pub local_threshold: f64,
    /// Error tolerated per experiment.
    #[serde(default)]
    pub experiment_threshold: f64,
    /// Error tolerated on the aggregate over all experiments.
    #[serde(default)]
    pub global_threshold: f64,
    /// Simulate every input and output node, not only those an output
    /// depends on.
    #[serde(default)]
    pub include_all_features: bool,
    /// Integrator step control.
    #[serde(default)]
    pub integrator: IntegratorConfig,
}

impl IntegratorConfig {
    /// Validate the step control parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.abs_tolerance <= 0.0 || self.rel_tolerance < 0.0 {
            return Err(ConfigError::InvalidTolerance);
        }
        if self.min_step <= 0.0
            || self.initial_step < self.min_step
            || self.max_step < self.initial_step
        {
            return Err(ConfigError::InvalidStepBounds {
                min: self.min_step,
                initial: self.initial_step,
                max: self.max_step,
            });
        }
        if self.min_concentration < 0.0 || self.max_concentration <= self.min_concentration {
            return Err(ConfigError::InvalidConcentrationBounds);
        }
        if self.min_scale <= 0.0 || self.min_scale > 1.0 || self.max_scale < 1.0 {
            return Err(ConfigError::InvalidScaleBounds);
        }
        Ok(())
    }
}

impl SimParams {
    /// Validate thresholds and integrator settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("local", self.local_threshold),
            ("experiment", self.experiment_threshold),
            ("global", self.global_threshold),
        ] {
            if !(value >= 0.0) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        self.integrator.validate()
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Integrator tolerances must be positive")]
    InvalidTolerance,
    #[error("Step bounds must satisfy 0 < min ({min}) <= initial ({initial}) <= max ({max})")]
    InvalidStepBounds { min: f64, initial: f64, max: f64 },
    #[error("Concentration bounds must satisfy 0 <= min < max")]
    InvalidConcentrationBounds,
    #[error("Step scale bounds must satisfy 0 < min <= 1 <= max")]
    InvalidScaleBounds,
    #[error("The {name} error threshold must be non-negative, got {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(SimParams::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params: SimParams = serde_json::from_str(r#"{"local_threshold": 0.5}"#).unwrap();
        assert_eq!(params.local_threshold, 0.5);
        assert_eq!(params.integrator, IntegratorConfig::default());
        assert_eq!(params.integrator.max_step, 1.0);
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let params = SimParams {
            global_threshold: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::InvalidThreshold { name: "global", .. })
        ));
    }

    #[test]
    fn test_inverted_step_bounds_rejected() {
        let integrator = IntegratorConfig {
            min_step: 0.1,
            initial_step: 0.01,
            ..Default::default()
        };
        assert!(integrator.validate().is_err());
    }
}
