//! Error types for the validation engine.
//!
//! This module defines `ValidationError`, the single error type shared by the
//! registry, probe, runner, aggregator and orchestrator. It is built with
//! `thiserror` so that variants can be created from underlying errors with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: The device could not be reached inside the timeout. This is
//!   the only *transient* error: retry policies may try again.
//! - **`Read`**: The device was reachable but retrieving a value faulted.
//! - **`PlanExecution`**: The execution engine reported a fault, or the plan's
//!   timeout elapsed while the engine was still running.
//! - **`UnknownLabel`**: Discovery was requested for a capability label that was
//!   never registered. A caller/configuration bug, not a hardware condition.
//! - **`AggregationInvariant`**: Suite counts disagree with the recorded results.
//!   Indicates the validation engine itself is unreliable and is the only error
//!   that should escape to the process level.
//! - **`Configuration`** / **`Config`** / **`Io`**: Setup problems detected before
//!   any validation runs.
//!
//! Device and plan failures are normally *not* returned as errors at all: the
//! probe and runner turn them into `ProbeResult`/`PlanResult` values. Drivers and
//! engines report typed conditions by returning a `ValidationError` inside an
//! `anyhow::Error`; see [`classify`].

use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the validation error type.
pub type AppResult<T> = std::result::Result<T, ValidationError>;

/// Primary error type for the validation engine.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Device did not answer inside the timeout
    #[error("Device '{device}' unreachable: {message}")]
    Connection {
        /// Registry id of the device
        device: String,
        /// Driver or timeout detail
        message: String,
    },

    /// Device answered but the value could not be retrieved
    #[error("Read of '{path}' on device '{device}' failed: {message}")]
    Read {
        /// Registry id of the device
        device: String,
        /// Read path (PV name or signal key) that faulted
        path: String,
        /// Fault reported by the driver
        message: String,
    },

    /// Engine fault or plan timeout
    #[error("Plan '{plan}' failed: {message}")]
    PlanExecution {
        /// Name of the plan as shown in reports
        plan: String,
        /// Engine fault or timeout detail
        message: String,
    },

    /// Label that was never registered
    #[error("Unknown capability label '{0}'")]
    UnknownLabel(String),

    /// Suite counts disagree with the stored results
    #[error(
        "Aggregation invariant violated in suite '{suite}': stored {passed}/{total}, recounted {recounted_passed}/{recounted_total}"
    )]
    AggregationInvariant {
        /// Suite whose counts disagree
        suite: String,
        /// Stored pass count
        passed: usize,
        /// Stored total
        total: usize,
        /// Passes counted from the stored results
        recounted_passed: usize,
        /// Results actually stored
        recounted_total: usize,
    },

    /// Semantic check on a loaded config failed
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Config file or environment could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Filesystem error while loading inputs
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ValidationError {
    /// Shorthand for a connection failure.
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a read fault.
    pub fn read(
        device: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Read {
            device: device.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a plan execution failure.
    pub fn plan(plan: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PlanExecution {
            plan: plan.into(),
            message: message.into(),
        }
    }

    /// Timeout while waiting on a device, expressed as a connection failure.
    pub fn timed_out(device: impl Into<String>, after: Duration) -> Self {
        Self::connection(device, format!("read timed out after {after:?}"))
    }

    /// Whether retrying the failed operation could plausibly succeed.
    ///
    /// Only unreachable devices are transient. Unknown labels, read faults and
    /// engine faults are deterministic and must not be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ValidationError::Connection { .. })
    }

    /// True for errors that indicate a defect in the validation engine itself.
    pub fn is_engine_fault(&self) -> bool {
        matches!(self, ValidationError::AggregationInvariant { .. })
    }
}

/// How a collaborator error should be treated by the probe and runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Device could not be reached (transient)
    Unreachable,
    /// Any other fault reported by the backend (deterministic)
    Fault,
}

/// Classify an error returned through an `anyhow::Result` collaborator trait.
///
/// Untyped errors are treated as backend faults.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    match err.downcast_ref::<ValidationError>() {
        Some(e) if e.is_transient() => ErrorClass::Unreachable,
        _ => ErrorClass::Fault,
    }
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_are_transient() {
        assert!(ValidationError::connection("m1", "no route").is_transient());
        assert!(!ValidationError::read("m1", "gp:m1.RBV", "bad value").is_transient());
        assert!(!ValidationError::UnknownLabel("motors".into()).is_transient());
        assert!(!ValidationError::plan("count", "boom").is_transient());
    }

    #[test]
    fn classifies_wrapped_errors() {
        let unreachable: anyhow::Error = ValidationError::connection("m1", "down").into();
        assert_eq!(classify(&unreachable), ErrorClass::Unreachable);

        let fault: anyhow::Error = ValidationError::read("m1", "x", "parity").into();
        assert_eq!(classify(&fault), ErrorClass::Fault);

        let untyped = anyhow::anyhow!("driver exploded");
        assert_eq!(classify(&untyped), ErrorClass::Fault);
    }

    #[test]
    fn timeout_message_mentions_duration() {
        let err = ValidationError::timed_out("det", Duration::from_secs(2));
        assert!(err.to_string().contains("timed out after 2s"));
        assert!(err.is_transient());
    }

    #[test]
    fn invariant_violation_is_an_engine_fault() {
        let err = ValidationError::AggregationInvariant {
            suite: "connectivity".into(),
            passed: 3,
            total: 2,
            recounted_passed: 2,
            recounted_total: 2,
        };
        assert!(err.is_engine_fault());
        assert!(err.to_string().contains("connectivity"));
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
