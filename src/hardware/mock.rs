//! Mock Hardware Implementations
//!
//! Provides simulated devices for validating the engine without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockMotor` - Motion axis with soft limits (`<prefix>.RBV`, `.VAL`, `.DESC`, `.EGU`, `.HLM`, `.LLM`)
//! - `MockScaler` - Multi-channel counter (`<prefix>.CNT`, `.T`, `.S1`..`.Sn`, `.DESC`)
//! - `MockAreaDetector` - Triggerable camera (`<prefix>cam1:Acquire`, `cam1:ArrayCounter_RBV`, ...)
//! - `MockSignal` - Single process variable (baseline sensors, support calculations)
//!
//! # Fault Injection
//!
//! Every mock carries a [`MockBehavior`] that can be swapped at runtime:
//!
//! ```rust,ignore
//! let motor = Arc::new(MockMotor::new("gp:m3"));
//! motor.set_behavior(MockBehavior::Hang);     // read never completes
//! motor.set_behavior(MockBehavior::Disconnected);
//! ```
//!
//! The factories at the bottom of this file let the registry build the same
//! devices from configuration (`driver = "mock_motor"` etc.).

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::ValidationError;
use crate::hardware::capabilities::{Movable, MultiChannel, Readable, Triggerable};
use crate::hardware::registry::{DeviceComponents, DeviceConfig, DeviceFactory};

// =============================================================================
// MockBehavior - injectable backend behaviour
// =============================================================================

/// How a mock device answers requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockBehavior {
    /// Answer normally
    #[default]
    Normal,
    /// Report the device as unreachable
    Disconnected,
    /// Fail every request with a backend fault
    Fault(String),
    /// Never answer
    Hang,
    /// Answer reads with a null value
    Null,
}

/// Shared per-device link state: behaviour plus a fixed response latency.
#[derive(Debug)]
struct Link {
    name: String,
    behavior: RwLock<MockBehavior>,
    latency: Duration,
}

impl Link {
    fn new(name: &str, behavior: MockBehavior, latency: Duration) -> Self {
        Self {
            name: name.to_string(),
            behavior: RwLock::new(behavior),
            latency,
        }
    }

    /// Wait for the simulated round trip and apply the current behaviour.
    ///
    /// Returns `Ok(false)` when the backend answers without a value.
    async fn gate(&self) -> Result<bool> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let behavior = self.behavior.read().clone();
        match behavior {
            MockBehavior::Normal => Ok(true),
            MockBehavior::Null => Ok(false),
            MockBehavior::Disconnected => {
                Err(ValidationError::connection(&self.name, "channel not connected").into())
            }
            MockBehavior::Fault(message) => Err(anyhow!(message)),
            MockBehavior::Hang => {
                futures::future::pending::<()>().await;
                Ok(false)
            }
        }
    }

    /// Read through the link, resolving the value with `lookup` when the backend answers.
    async fn read_with(&self, path: &str, lookup: impl FnOnce() -> Option<Value>) -> Result<Value> {
        if !self.gate().await? {
            return Ok(Value::Null);
        }
        lookup().ok_or_else(|| ValidationError::read(&self.name, path, "no such property").into())
    }

    fn is_connected(&self) -> bool {
        !matches!(*self.behavior.read(), MockBehavior::Disconnected)
    }

    fn set(&self, behavior: MockBehavior) {
        debug!(device = %self.name, ?behavior, "Mock behaviour changed");
        *self.behavior.write() = behavior;
    }
}

// =============================================================================
// MockMotor - Simulated Motion Axis
// =============================================================================

/// Mock motion axis
///
/// Simulates a motor record with:
/// - Soft limits (moves outside them are rejected)
/// - Optional finite speed (instantaneous by default)
/// - Thread-safe position tracking
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockMotor::new("gp:m1");
/// motor.move_abs(1.5).await?;
/// assert_eq!(motor.read("gp:m1.RBV").await?, json!(1.5));
/// ```
pub struct MockMotor {
    prefix: String,
    description: String,
    units: String,
    position: RwLock<f64>,
    limits: (f64, f64),
    speed: Option<f64>,
    link: Link,
}

impl MockMotor {
    /// Create a motor at position 0.0 with limits of +/-100
    pub fn new(prefix: &str) -> Self {
        Self::with_config(prefix, MockMotorSettings::default())
    }

    /// Create a motor from driver settings
    pub fn with_config(prefix: &str, cfg: MockMotorSettings) -> Self {
        Self {
            prefix: prefix.to_string(),
            description: cfg.description.unwrap_or_else(|| format!("Motor {prefix}")),
            units: cfg.units,
            position: RwLock::new(cfg.initial_position),
            limits: (cfg.low_limit, cfg.high_limit),
            speed: cfg.speed,
            link: Link::new(prefix, cfg.behavior, cfg.latency),
        }
    }

    /// Swap the injected behaviour
    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.link.set(behavior);
    }

    fn property(&self, path: &str) -> Option<Value> {
        let field = path.strip_prefix(self.prefix.as_str())?;
        let value = match field {
            ".RBV" | ".VAL" => json!(*self.position.read()),
            ".DESC" => json!(self.description),
            ".EGU" => json!(self.units),
            ".HLM" => json!(self.limits.1),
            ".LLM" => json!(self.limits.0),
            _ => return None,
        };
        Some(value)
    }
}

#[async_trait]
impl Readable for MockMotor {
    async fn read(&self, path: &str) -> Result<Value> {
        self.link.read_with(path, || self.property(path)).await
    }

    async fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

#[async_trait]
impl Movable for MockMotor {
    async fn move_abs(&self, target: f64) -> Result<()> {
        self.link.gate().await?;
        let (low, high) = self.limits;
        if !(low..=high).contains(&target) {
            bail!(
                "{}: target {target} outside soft limits [{low}, {high}]",
                self.prefix
            );
        }

        let current = *self.position.read();
        if let Some(speed) = self.speed.filter(|s| *s > 0.0) {
            let travel = Duration::from_secs_f64((target - current).abs() / speed);
            sleep(travel).await;
        }

        *self.position.write() = target;
        debug!(motor = %self.prefix, from = current, to = target, "Mock motor moved");
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        self.link.gate().await?;
        Ok(*self.position.read())
    }

    async fn limits(&self) -> Result<(f64, f64)> {
        Ok(self.limits)
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// MockScaler - Simulated Counter Card
// =============================================================================

/// Mock multi-channel scaler
///
/// Every trigger performs one counting cycle; channel `n` then reads
/// `rate * preset_time * n + cycles`.
pub struct MockScaler {
    prefix: String,
    description: String,
    channels: usize,
    preset_time: f64,
    rate: f64,
    cycles: AtomicU64,
    link: Link,
}

impl MockScaler {
    /// Create a 32-channel scaler with a 1s preset time
    pub fn new(prefix: &str) -> Self {
        Self::with_config(prefix, MockScalerSettings::default())
    }

    /// Create a scaler from driver settings
    pub fn with_config(prefix: &str, cfg: MockScalerSettings) -> Self {
        Self {
            prefix: prefix.to_string(),
            description: cfg.description.unwrap_or_else(|| format!("Scaler {prefix}")),
            channels: cfg.channels,
            preset_time: cfg.preset_time,
            rate: cfg.rate,
            cycles: AtomicU64::new(0),
            link: Link::new(prefix, cfg.behavior, cfg.latency),
        }
    }

    /// Swap the injected behaviour
    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.link.set(behavior);
    }

    /// Number of completed counting cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    fn property(&self, path: &str) -> Option<Value> {
        let field = path.strip_prefix(self.prefix.as_str())?;
        let value = match field {
            ".CNT" => json!(0),
            ".T" => json!(self.preset_time),
            ".DESC" => json!(self.description),
            ".NCH" => json!(self.channels),
            other => {
                let channel: usize = other.strip_prefix(".S")?.parse().ok()?;
                if channel == 0 || channel > self.channels {
                    return None;
                }
                let counts = self.rate * self.preset_time * channel as f64 + self.cycles() as f64;
                json!(counts)
            }
        };
        Some(value)
    }
}

#[async_trait]
impl Readable for MockScaler {
    async fn read(&self, path: &str) -> Result<Value> {
        self.link.read_with(path, || self.property(path)).await
    }

    async fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

#[async_trait]
impl Triggerable for MockScaler {
    async fn trigger(&self) -> Result<()> {
        self.link.gate().await?;
        self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl MultiChannel for MockScaler {
    fn channel_count(&self) -> usize {
        self.channels
    }
}

// =============================================================================
// MockAreaDetector - Simulated Camera
// =============================================================================

/// Mock area detector
///
/// Exposes the usual `cam1:` records; each trigger acquires one frame and bumps
/// `cam1:ArrayCounter_RBV`.
pub struct MockAreaDetector {
    prefix: String,
    size: (u32, u32),
    frames: AtomicU64,
    link: Link,
}

impl MockAreaDetector {
    /// Create a 1024x1024 detector
    pub fn new(prefix: &str) -> Self {
        Self::with_config(prefix, MockAreaDetectorSettings::default())
    }

    /// Create a detector from driver settings
    pub fn with_config(prefix: &str, cfg: MockAreaDetectorSettings) -> Self {
        Self {
            prefix: prefix.to_string(),
            size: (cfg.width, cfg.height),
            frames: AtomicU64::new(0),
            link: Link::new(prefix, cfg.behavior, cfg.latency),
        }
    }

    /// Swap the injected behaviour
    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.link.set(behavior);
    }

    /// Number of frames acquired so far
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    fn property(&self, path: &str) -> Option<Value> {
        let field = path.strip_prefix(self.prefix.as_str())?;
        let value = match field {
            "cam1:Acquire" => json!(0),
            "cam1:ArrayCounter_RBV" => json!(self.frame_count()),
            "cam1:ArraySize_RBV" => json!([self.size.0, self.size.1]),
            "cam1:MaxSizeX_RBV" => json!(self.size.0),
            "cam1:MaxSizeY_RBV" => json!(self.size.1),
            "cam1:Manufacturer_RBV" => json!("Simulated detector"),
            _ => return None,
        };
        Some(value)
    }
}

#[async_trait]
impl Readable for MockAreaDetector {
    async fn read(&self, path: &str) -> Result<Value> {
        self.link.read_with(path, || self.property(path)).await
    }

    async fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

#[async_trait]
impl Triggerable for MockAreaDetector {
    async fn trigger(&self) -> Result<()> {
        self.link.gate().await?;
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockSignal - Simulated Process Variable
// =============================================================================

/// Mock single-value signal (IOC statistics, user calculations, transforms)
pub struct MockSignal {
    pv: String,
    description: String,
    value: RwLock<Value>,
    link: Link,
}

impl MockSignal {
    /// Create a signal holding `value`
    pub fn new(pv: &str, value: Value) -> Self {
        Self::with_config(
            pv,
            MockSignalSettings {
                value,
                ..MockSignalSettings::default()
            },
        )
    }

    /// Create a signal from driver settings
    pub fn with_config(pv: &str, cfg: MockSignalSettings) -> Self {
        Self {
            pv: pv.to_string(),
            description: cfg.description.unwrap_or_else(|| pv.to_string()),
            value: RwLock::new(cfg.value),
            link: Link::new(pv, cfg.behavior, cfg.latency),
        }
    }

    /// Swap the injected behaviour
    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.link.set(behavior);
    }

    /// Replace the held value
    pub fn set_value(&self, value: Value) {
        *self.value.write() = value;
    }

    fn property(&self, path: &str) -> Option<Value> {
        let field = path.strip_prefix(self.pv.as_str())?;
        match field {
            "" | ".VAL" => Some(self.value.read().clone()),
            ".DESC" => Some(json!(self.description)),
            _ => None,
        }
    }
}

#[async_trait]
impl Readable for MockSignal {
    async fn read(&self, path: &str) -> Result<Value> {
        self.link.read_with(path, || self.property(path)).await
    }

    async fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

// =============================================================================
// Driver settings
// =============================================================================

fn default_high_limit() -> f64 {
    100.0
}

fn default_low_limit() -> f64 {
    -100.0
}

fn default_units() -> String {
    "mm".to_string()
}

fn default_channels() -> usize {
    32
}

fn default_preset_time() -> f64 {
    1.0
}

fn default_rate() -> f64 {
    1000.0
}

fn default_size() -> u32 {
    1024
}

/// Settings for `mock_motor`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockMotorSettings {
    /// Initial position in engineering units
    pub initial_position: f64,
    /// Lower soft limit
    #[serde(default = "default_low_limit")]
    pub low_limit: f64,
    /// Upper soft limit
    #[serde(default = "default_high_limit")]
    pub high_limit: f64,
    /// Travel speed in units/sec; instantaneous when unset
    pub speed: Option<f64>,
    /// `.DESC` field
    pub description: Option<String>,
    /// `.EGU` field
    #[serde(default = "default_units")]
    pub units: String,
    /// Injected behaviour
    pub behavior: MockBehavior,
    /// Simulated response latency
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

impl Default for MockMotorSettings {
    fn default() -> Self {
        Self {
            initial_position: 0.0,
            low_limit: default_low_limit(),
            high_limit: default_high_limit(),
            speed: None,
            description: None,
            units: default_units(),
            behavior: MockBehavior::Normal,
            latency: Duration::ZERO,
        }
    }
}

/// Settings for `mock_scaler`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockScalerSettings {
    /// Number of channels
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Counting time per trigger in seconds (`.T`)
    #[serde(default = "default_preset_time")]
    pub preset_time: f64,
    /// Simulated count rate per channel
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// `.DESC` field
    pub description: Option<String>,
    /// Injected behaviour
    pub behavior: MockBehavior,
    /// Simulated response latency
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

impl Default for MockScalerSettings {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            preset_time: default_preset_time(),
            rate: default_rate(),
            description: None,
            behavior: MockBehavior::Normal,
            latency: Duration::ZERO,
        }
    }
}

/// Settings for `mock_area_detector`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockAreaDetectorSettings {
    /// Sensor width in pixels
    #[serde(default = "default_size")]
    pub width: u32,
    /// Sensor height in pixels
    #[serde(default = "default_size")]
    pub height: u32,
    /// Injected behaviour
    pub behavior: MockBehavior,
    /// Simulated response latency
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

impl Default for MockAreaDetectorSettings {
    fn default() -> Self {
        Self {
            width: default_size(),
            height: default_size(),
            behavior: MockBehavior::Normal,
            latency: Duration::ZERO,
        }
    }
}

/// Settings for `mock_signal`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MockSignalSettings {
    /// Held value
    pub value: Value,
    /// `.DESC` field
    pub description: Option<String>,
    /// Injected behaviour
    pub behavior: MockBehavior,
    /// Simulated response latency
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

/// Device prefix for a configured device: the part of `read_path` before the
/// record field, or the id when the path has no field separator.
fn prefix_of(config: &DeviceConfig, separators: &[char]) -> String {
    if let Some(prefix) = config.settings_str("prefix") {
        return prefix;
    }
    match config.read_path.rfind(separators) {
        Some(idx) => config.read_path[..idx].to_string(),
        None => config.id.clone(),
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Factory for `mock_motor` devices
pub struct MockMotorFactory;

impl DeviceFactory for MockMotorFactory {
    fn driver_type(&self) -> &'static str {
        "mock_motor"
    }

    fn name(&self) -> &'static str {
        "Simulated motor record"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: MockMotorSettings = settings.clone().try_into()?;
        if cfg.low_limit > cfg.high_limit {
            bail!("low_limit {} exceeds high_limit {}", cfg.low_limit, cfg.high_limit);
        }
        Ok(())
    }

    fn build(&self, config: DeviceConfig) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockMotorSettings = config.settings.clone().try_into()?;
            let motor = Arc::new(MockMotor::with_config(&prefix_of(&config, &['.']), cfg));
            Ok(DeviceComponents {
                readable: Some(motor.clone()),
                movable: Some(motor),
                ..Default::default()
            })
        })
    }
}

/// Factory for `mock_scaler` devices
pub struct MockScalerFactory;

impl DeviceFactory for MockScalerFactory {
    fn driver_type(&self) -> &'static str {
        "mock_scaler"
    }

    fn name(&self) -> &'static str {
        "Simulated scaler"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: MockScalerSettings = settings.clone().try_into()?;
        if cfg.channels == 0 {
            bail!("scaler needs at least one channel");
        }
        Ok(())
    }

    fn build(&self, config: DeviceConfig) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockScalerSettings = config.settings.clone().try_into()?;
            let scaler = Arc::new(MockScaler::with_config(&prefix_of(&config, &['.']), cfg));
            Ok(DeviceComponents {
                readable: Some(scaler.clone()),
                triggerable: Some(scaler.clone()),
                multi_channel: Some(scaler),
                ..Default::default()
            })
        })
    }
}

/// Factory for `mock_area_detector` devices
pub struct MockAreaDetectorFactory;

impl DeviceFactory for MockAreaDetectorFactory {
    fn driver_type(&self) -> &'static str {
        "mock_area_detector"
    }

    fn name(&self) -> &'static str {
        "Simulated area detector"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let _: MockAreaDetectorSettings = settings.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: DeviceConfig) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockAreaDetectorSettings = config.settings.clone().try_into()?;
            let prefix = match config.settings_str("prefix") {
                Some(prefix) => prefix,
                None => config
                    .read_path
                    .find("cam1:")
                    .map(|idx| config.read_path[..idx].to_string())
                    .unwrap_or_else(|| config.id.clone()),
            };
            let detector = Arc::new(MockAreaDetector::with_config(&prefix, cfg));
            Ok(DeviceComponents {
                readable: Some(detector.clone()),
                triggerable: Some(detector),
                ..Default::default()
            })
        })
    }
}

/// Factory for `mock_signal` devices
pub struct MockSignalFactory;

impl DeviceFactory for MockSignalFactory {
    fn driver_type(&self) -> &'static str {
        "mock_signal"
    }

    fn name(&self) -> &'static str {
        "Simulated signal"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let _: MockSignalSettings = settings.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: DeviceConfig) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockSignalSettings = config.settings.clone().try_into()?;
            let signal = Arc::new(MockSignal::with_config(&config.read_path, cfg));
            Ok(DeviceComponents {
                readable: Some(signal),
                ..Default::default()
            })
        })
    }
}

/// All built-in mock factories
pub fn mock_factories() -> Vec<Arc<dyn DeviceFactory>> {
    vec![
        Arc::new(MockMotorFactory),
        Arc::new(MockScalerFactory),
        Arc::new(MockAreaDetectorFactory),
        Arc::new(MockSignalFactory),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_motor_moves_and_reads_back() {
        let motor = MockMotor::new("gp:m1");

        assert_eq!(motor.position().await.unwrap(), 0.0);
        motor.move_abs(2.5).await.unwrap();
        assert_eq!(motor.read("gp:m1.RBV").await.unwrap(), json!(2.5));

        motor.move_rel(-0.5).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_mock_motor_rejects_moves_outside_limits() {
        let motor = MockMotor::new("gp:m1");
        assert!(motor.move_abs(500.0).await.is_err());
        assert_eq!(motor.position().await.unwrap(), 0.0);
        assert_eq!(motor.limits().await.unwrap(), (-100.0, 100.0));
    }

    #[tokio::test]
    async fn test_unknown_property_is_a_read_error() {
        let motor = MockMotor::new("gp:m1");
        let err = motor.read("gp:m1.BOGUS").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_behaviours() {
        let signal = MockSignal::new("gp:IOC_CPU_LOAD", json!(12.5));
        assert_eq!(signal.read("gp:IOC_CPU_LOAD").await.unwrap(), json!(12.5));

        signal.set_behavior(MockBehavior::Null);
        assert_eq!(signal.read("gp:IOC_CPU_LOAD").await.unwrap(), Value::Null);

        signal.set_behavior(MockBehavior::Disconnected);
        assert!(!signal.is_connected().await);
        let err = signal.read("gp:IOC_CPU_LOAD").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::Connection { .. })
        ));

        signal.set_behavior(MockBehavior::Fault("parity error".into()));
        let err = signal.read("gp:IOC_CPU_LOAD").await.unwrap_err();
        assert!(err.to_string().contains("parity"));
    }

    #[tokio::test]
    async fn test_hanging_device_never_answers() {
        let motor = MockMotor::new("gp:m3");
        motor.set_behavior(MockBehavior::Hang);
        let outcome =
            tokio::time::timeout(Duration::from_millis(50), motor.read("gp:m3.RBV")).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_scaler_counts_per_trigger() {
        let scaler = MockScaler::new("gp:scaler1");
        assert_eq!(scaler.channel_count(), 32);
        scaler.trigger().await.unwrap();
        scaler.trigger().await.unwrap();
        assert_eq!(scaler.cycles(), 2);
        assert_eq!(scaler.read("gp:scaler1.S2").await.unwrap(), json!(2002.0));
        assert!(scaler.read("gp:scaler1.S33").await.is_err());
    }

    #[tokio::test]
    async fn test_area_detector_counts_frames() {
        let det = MockAreaDetector::new("adsim:");
        det.trigger().await.unwrap();
        assert_eq!(det.read("adsim:cam1:ArrayCounter_RBV").await.unwrap(), json!(1));
        assert_eq!(det.read("adsim:cam1:MaxSizeX_RBV").await.unwrap(), json!(1024));
    }

    #[tokio::test]
    async fn test_motor_factory_builds_from_settings() {
        let settings: toml::Value =
            toml::from_str("initial_position = 3.0\nhigh_limit = 10.0").unwrap();
        let config = DeviceConfig {
            id: "m1".into(),
            name: None,
            labels: vec!["motors".into()],
            read_path: "gp:m1.RBV".into(),
            properties: vec![],
            driver: "mock_motor".into(),
            settings,
        };

        let factory = MockMotorFactory;
        factory.validate(&config.settings).unwrap();
        let components = factory.build(config).await.unwrap();

        let motor = components.movable.unwrap();
        assert_eq!(motor.position().await.unwrap(), 3.0);
        assert_eq!(motor.limits().await.unwrap(), (-100.0, 10.0));
        let readable = components.readable.unwrap();
        assert_eq!(readable.read("gp:m1.RBV").await.unwrap(), json!(3.0));
    }

    #[test]
    fn test_motor_factory_rejects_inverted_limits() {
        let settings: toml::Value = toml::from_str("low_limit = 5.0\nhigh_limit = 1.0").unwrap();
        assert!(MockMotorFactory.validate(&settings).is_err());
    }
}
