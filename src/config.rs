//! Configuration System using Figment
//!
//! Strongly-typed configuration for a validation run. Configuration is loaded from:
//! 1. `config/validate.toml` (or an explicit path)
//! 2. Environment variables prefixed with `DAQ_VALIDATE_`, nested keys split on `__`
//!
//! Durations use humantime notation (`"2s"`, `"250ms"`).
//!
//! # Example
//! ```no_run
//! use daq_validate::config::ValidationConfig;
//!
//! // DAQ_VALIDATE_PROBE__TIMEOUT=5s overrides [probe] timeout
//! let config = ValidationConfig::load()?;
//! config.validate()?;
//! println!("Probing {} devices", config.devices.len());
//! # Ok::<(), daq_validate::error::ValidationError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, ValidationError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::plans::PlanSpec;
use crate::hardware::registry::DeviceConfig;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/validate.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DAQ_VALIDATE_";

const DEMO_CONFIG: &str = include_str!("../config/validate.toml");

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Connectivity probe settings
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Plan execution settings
    #[serde(default)]
    pub plans: PlansConfig,
    /// Pass/fail policy
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Every capability label, registered up front
    #[serde(default)]
    pub labels: Vec<String>,
    /// Device inventory
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Additional plans appended to the plans suite
    #[serde(default)]
    pub extra_plans: Vec<PlanSpec>,
    /// Per-suite settings
    #[serde(default)]
    pub suites: SuitesConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-validate".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Connectivity probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Bound on each canonical read
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Probes in flight at once
    pub concurrency: usize,
    /// Retry policy for unreachable devices
    pub retry: RetryPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Plan execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlansConfig {
    /// Timeout for built-in plans
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Distance moved by the operations round trip
    pub round_trip_delta: f64,
    /// Allowed distance from the start position after a round trip
    pub round_trip_tolerance: f64,
    /// Run every plan in simulation mode
    pub simulate: bool,
    /// Pause after each scan move
    #[serde(with = "humantime_serde")]
    pub settle_pause: Duration,
    /// Retry policy for built-in plans
    pub retry: RetryPolicy,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            round_trip_delta: 0.1,
            round_trip_tolerance: 1e-3,
            simulate: false,
            settle_pause: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

/// What a suite with nothing to check means for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptySuitePolicy {
    /// Reported with a warning, does not fail the run
    #[default]
    Warn,
    /// Fails the run
    Fail,
}

/// Pass/fail policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Treatment of empty suites
    pub empty_suite: EmptySuitePolicy,
}

/// Per-suite settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuitesConfig {
    /// Label whose first device drives motion plans
    pub motor_label: String,
    /// Label whose first device is read by plans
    pub detector_label: String,
    /// Connectivity suite
    pub connectivity: ConnectivitySuiteConfig,
}

impl Default for SuitesConfig {
    fn default() -> Self {
        Self {
            motor_label: "motors".to_string(),
            detector_label: "detectors".to_string(),
            connectivity: ConnectivitySuiteConfig::default(),
        }
    }
}

/// Connectivity suite settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySuiteConfig {
    /// Labels to probe; all registered labels when unset
    pub labels: Option<Vec<String>>,
}

impl ValidationConfig {
    /// Load configuration from `config/validate.toml` and environment variables
    ///
    /// Environment variables override file values with prefix `DAQ_VALIDATE_`.
    /// Example: `DAQ_VALIDATE_PROBE__CONCURRENCY=8`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ValidationError::Configuration(format!(
                "config file '{}' not found",
                path.display()
            )));
        }
        Ok(Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// The built-in demonstration instrument: four motors, a scaler, an area
    /// detector, baseline IOC statistics and support calculations
    pub fn demo() -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::string(DEMO_CONFIG)).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(ValidationError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.probe.concurrency == 0 {
            return invalid("probe.concurrency must be at least 1".to_string());
        }
        if self.probe.timeout.is_zero() {
            return invalid("probe.timeout must be greater than zero".to_string());
        }
        if self.plans.timeout.is_zero() {
            return invalid("plans.timeout must be greater than zero".to_string());
        }
        if self.plans.round_trip_tolerance < 0.0 {
            return invalid(format!(
                "plans.round_trip_tolerance must not be negative, got {}",
                self.plans.round_trip_tolerance
            ));
        }

        let declared: HashSet<&str> = self.labels.iter().map(String::as_str).collect();
        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.id.as_str()) {
                return invalid(format!("Duplicate device ID: {}", device.id));
            }
            if device.labels.is_empty() {
                return invalid(format!("Device '{}' has no labels", device.id));
            }
            if let Some(label) = device.labels.iter().find(|l| !declared.contains(l.as_str())) {
                return invalid(format!(
                    "Device '{}' uses label '{label}' which is not listed in `labels`",
                    device.id
                ));
            }
            if device.read_path.trim().is_empty() {
                return invalid(format!("Device '{}' has an empty read_path", device.id));
            }
        }

        for plan in &self.extra_plans {
            if plan.name.trim().is_empty() {
                return invalid("extra plan with an empty name".to_string());
            }
            if plan.timeout.is_zero() {
                return invalid(format!("extra plan '{}' has a zero timeout", plan.name));
            }
            if plan.return_tolerance.is_some_and(|t| t < 0.0) {
                return invalid(format!(
                    "extra plan '{}' has a negative return_tolerance",
                    plan.name
                ));
            }
            if let Err(reason) = plan.kind.validate() {
                return invalid(format!("extra plan '{}': {reason}", plan.name));
            }
        }

        if let Some(labels) = &self.suites.connectivity.labels {
            if labels.is_empty() {
                return invalid("suites.connectivity.labels must not be empty".to_string());
            }
        }

        Ok(())
    }

    /// Labels probed by the connectivity suite
    pub fn connectivity_labels(&self) -> Vec<String> {
        self.suites
            .connectivity
            .labels
            .clone()
            .unwrap_or_else(|| self.labels.clone())
    }
}
