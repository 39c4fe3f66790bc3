//! Device Capability Contract
//!
//! Fine-grained capability traits that instrument adapters implement. The
//! validation core only ever sees devices through these traits:
//!
//! - Every device implements `Readable` (the probe needs `read` + `is_connected`)
//! - A motor adds `Movable`
//! - A scaler adds `Triggerable + MultiChannel`
//! - An area detector adds `Triggerable`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Adapters report typed conditions by returning a
//! [`ValidationError`](crate::error::ValidationError) inside the `anyhow::Error`:
//! `Connection` for an unreachable device, `Read` for a value fault. Anything
//! else is treated as a backend fault.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Thermocouple { prefix: String }
//!
//! #[async_trait]
//! impl Readable for Thermocouple {
//!     async fn read(&self, path: &str) -> Result<Value> {
//!         Ok(json!(21.4))
//!     }
//!
//!     async fn is_connected(&self) -> bool {
//!         true
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Capability: Property Readout
///
/// Every registered device implements this. `path` is a backend-specific
/// property address (e.g. a process-variable name such as `gp:m1.RBV`).
///
/// # Contract
/// - `read` may block for as long as the backend likes; callers bound it
/// - A `Value::Null` result means the backend answered without a value
/// - `is_connected` is a cheap, cached view of the link state
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read one property of the device
    async fn read(&self, path: &str) -> Result<Value>;

    /// Whether the backend currently believes the device is reachable
    async fn is_connected(&self) -> bool;
}

/// Capability: Motion Control
///
/// Devices that can move to positions (motors, stages, rotation mounts).
///
/// # Contract
/// - Positions are in device-native units (typically mm or degrees)
/// - `move_abs` and `move_rel` return once the target is reached
/// - `limits` returns `(low, high)` soft limits
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = self.position().await?;
        self.move_abs(current + distance).await
    }

    /// Get current position
    async fn position(&self) -> Result<f64>;

    /// Soft limits as `(low, high)`
    async fn limits(&self) -> Result<(f64, f64)>;

    /// Wait for motion to settle
    async fn wait_settled(&self) -> Result<()> {
        Ok(())
    }

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Acquisition Trigger
///
/// Detectors that acquire on demand (scalers, area detectors).
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Prepare for acquisition. Most simulated devices need nothing here.
    async fn arm(&self) -> Result<()> {
        Ok(())
    }

    /// Acquire once and return when the acquisition is complete
    async fn trigger(&self) -> Result<()>;
}

/// Capability: Multi-Channel Detection
///
/// Detectors exposing several independent channels (e.g. a 32-channel scaler).
pub trait MultiChannel: Send + Sync {
    /// Number of channels the detector exposes
    fn channel_count(&self) -> usize;
}
