//! # daq-validate Core Library
//!
//! Setup validation for a laboratory instrument-control stack: are the devices
//! reachable, does the execution engine drive them, and do runs land in the
//! catalog? The library holds the validation engine; `main.rs` is a thin CLI
//! over it.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (`config/validate.toml` plus
//!   `DAQ_VALIDATE_*` environment overrides): devices, labels, timeouts, policy.
//! - **`error`**: The `ValidationError` enum and the classification of
//!   collaborator errors into unreachable vs. fault.
//! - **`error_recovery`**: Bounded retry policies, off by default.
//! - **`hardware`**: Capability traits (`Readable`, `Movable`, `Triggerable`,
//!   `MultiChannel`), mock devices and the capability-label `DeviceRegistry`.
//! - **`experiment`**: Plan generators, the `ExecutionEngine` contract with its
//!   simulated implementation, and the run catalog.
//! - **`validation`**: Connectivity probe, plan runner, result aggregator and
//!   the suite orchestrator.
//! - **`inventory`**: Device listings and per-device property analysis.
//! - **`tracing_setup`**: Structured logging initialisation.
//!
//! ## Example
//!
//! ```no_run
//! use daq_validate::config::ValidationConfig;
//! use daq_validate::validation::{Suite, ValidationContext, ValidationOrchestrator};
//!
//! # async fn run() -> Result<(), daq_validate::error::ValidationError> {
//! let config = ValidationConfig::demo()?;
//! let ctx = ValidationContext::from_config(config).await?;
//! let report = ValidationOrchestrator::new(ctx).run(&Suite::all()).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod hardware;
pub mod inventory;
pub mod tracing_setup;
pub mod validation;
