//! Device Registry
//!
//! Central index of the devices under validation, grouped by capability label
//! (`motors`, `detectors`, `baseline`, `support`, ...).
//!
//! - **DeviceHandle**: one registered device with its metadata, capability
//!   implementations and the cached connection state
//! - **DeviceRegistry**: label index populated at configuration time; discovery
//!   is a pure lookup with no I/O
//! - **DeviceFactory**: adapter interface that turns a `[[devices]]` entry into
//!   capability implementations (`driver = "mock_motor"` etc.)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DeviceRegistry                        │
//! │  labels:  motors -> [m1, m2, m3]   detectors -> [scaler1]   │
//! │  devices: m1 -> DeviceHandle { Readable, Movable, state }   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      DeviceFactory                          │
//! │  mock_motor | mock_scaler | mock_area_detector | mock_signal│
//! ├─────────────────────────────────────────────────────────────┤
//! │                    Capability Traits                        │
//! │       Readable | Movable | Triggerable | MultiChannel       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let mut registry = DeviceRegistry::new();
//! registry.register_label("support");
//! registry.register(DeviceConfig {
//!     id: "m1".into(),
//!     name: Some("Motor 1".into()),
//!     labels: vec!["motors".into()],
//!     read_path: "gp:m1.RBV".into(),
//!     properties: vec!["gp:m1.DESC".into()],
//!     driver: "mock_motor".into(),
//!     settings: toml::Value::Table(Default::default()),
//! }).await?;
//!
//! let motors = registry.discover("motors")?;   // [m1]
//! let support = registry.discover("support")?; // [] (registered but empty)
//! ```

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AppResult, ValidationError};
use crate::hardware::capabilities::{Movable, MultiChannel, Readable, Triggerable};
use crate::hardware::mock::mock_factories;

/// Unique device identifier
pub type DeviceId = String;

// =============================================================================
// Capability / ConnectionState
// =============================================================================

/// Capability tags for introspection and inventory listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Property readout (every device)
    Readable,
    /// Motion control
    Movable,
    /// On-demand acquisition
    Triggerable,
    /// Several detector channels
    MultiChannel,
}

/// Last-known link state of a device
///
/// Written only by the connectivity probe (and the runner's live check).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never probed
    #[default]
    Unknown,
    /// Last read returned a value
    Connected,
    /// Last read reported the device unreachable
    Disconnected,
    /// Last read faulted
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

// =============================================================================
// DeviceConfig / DeviceComponents / DeviceFactory
// =============================================================================

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// One `[[devices]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier
    pub id: DeviceId,

    /// Human-readable name (defaults to the id)
    #[serde(default)]
    pub name: Option<String>,

    /// Capability labels; must be non-empty
    pub labels: Vec<String>,

    /// Canonical property the connectivity probe reads
    pub read_path: String,

    /// Extra property paths read by inventory analysis
    #[serde(default)]
    pub properties: Vec<String>,

    /// Factory name (`mock_motor`, `mock_scaler`, ...)
    pub driver: String,

    /// Driver-specific settings table
    #[serde(default = "empty_table")]
    pub settings: toml::Value,
}

impl DeviceConfig {
    /// Minimal config with empty settings
    pub fn new(
        id: impl Into<String>,
        labels: &[&str],
        read_path: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            read_path: read_path.into(),
            properties: Vec::new(),
            driver: driver.into(),
            settings: empty_table(),
        }
    }

    /// String-valued entry of the settings table
    pub fn settings_str(&self, key: &str) -> Option<String> {
        self.settings
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Capability implementations produced by a factory
///
/// `readable` is mandatory; registration fails without it.
#[derive(Default, Clone)]
pub struct DeviceComponents {
    /// Property readout
    pub readable: Option<Arc<dyn Readable>>,
    /// Motion control
    pub movable: Option<Arc<dyn Movable>>,
    /// Acquisition trigger
    pub triggerable: Option<Arc<dyn Triggerable>>,
    /// Channel introspection
    pub multi_channel: Option<Arc<dyn MultiChannel>>,
}

/// Adapter interface resolving a configured driver name to capability
/// implementations before any validation runs.
pub trait DeviceFactory: Send + Sync + 'static {
    /// Driver name used in the `driver` field
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for listings and error messages
    fn name(&self) -> &'static str;

    /// Check the settings table without building anything
    fn validate(&self, settings: &toml::Value) -> Result<()>;

    /// Build the device
    fn build(&self, config: DeviceConfig) -> BoxFuture<'static, Result<DeviceComponents>>;
}

// =============================================================================
// DeviceHandle
// =============================================================================

/// A registered device
pub struct DeviceHandle {
    config: DeviceConfig,
    readable: Arc<dyn Readable>,
    movable: Option<Arc<dyn Movable>>,
    triggerable: Option<Arc<dyn Triggerable>>,
    multi_channel: Option<Arc<dyn MultiChannel>>,
    state: RwLock<ConnectionState>,
}

impl DeviceHandle {
    fn new(config: DeviceConfig, components: DeviceComponents) -> AppResult<Self> {
        let readable = components.readable.ok_or_else(|| {
            ValidationError::Configuration(format!(
                "device '{}' has no readable implementation",
                config.id
            ))
        })?;
        Ok(Self {
            config,
            readable,
            movable: components.movable,
            triggerable: components.triggerable,
            multi_channel: components.multi_channel,
            state: RwLock::new(ConnectionState::Unknown),
        })
    }

    /// Device identifier
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Display name, falling back to the id
    pub fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or(&self.config.id)
    }

    /// Capability labels
    pub fn labels(&self) -> &[String] {
        &self.config.labels
    }

    /// Canonical probe path
    pub fn read_path(&self) -> &str {
        &self.config.read_path
    }

    /// Extra inventory paths
    pub fn properties(&self) -> &[String] {
        &self.config.properties
    }

    /// Driver that built this device
    pub fn driver_type(&self) -> &str {
        &self.config.driver
    }

    /// Property readout
    pub fn readable(&self) -> Arc<dyn Readable> {
        self.readable.clone()
    }

    /// Motion control, if the device moves
    pub fn movable(&self) -> Option<Arc<dyn Movable>> {
        self.movable.clone()
    }

    /// Acquisition trigger, if the device acquires on demand
    pub fn triggerable(&self) -> Option<Arc<dyn Triggerable>> {
        self.triggerable.clone()
    }

    /// Channel introspection, if the detector is multi-channel
    pub fn multi_channel(&self) -> Option<Arc<dyn MultiChannel>> {
        self.multi_channel.clone()
    }

    /// Capabilities this device provides
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::Readable];
        if self.movable.is_some() {
            caps.push(Capability::Movable);
        }
        if self.triggerable.is_some() {
            caps.push(Capability::Triggerable);
        }
        if self.multi_channel.is_some() {
            caps.push(Capability::MultiChannel);
        }
        caps
    }

    /// Cached connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Cache a new connection state
    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.config.id)
            .field("labels", &self.config.labels)
            .field("driver", &self.config.driver)
            .field("state", &self.connection_state())
            .finish()
    }
}

// =============================================================================
// DeviceRegistry
// =============================================================================

/// Capability-label index of registered devices
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Arc<DeviceHandle>>,
    order: Vec<DeviceId>,
    label_order: Vec<String>,
    by_label: HashMap<String, Vec<DeviceId>>,
    factories: HashMap<&'static str, Arc<dyn DeviceFactory>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Create an empty registry with the built-in mock factories installed
    pub fn new() -> Self {
        let mut registry = Self {
            devices: HashMap::new(),
            order: Vec::new(),
            label_order: Vec::new(),
            by_label: HashMap::new(),
            factories: HashMap::new(),
        };
        for factory in mock_factories() {
            registry.add_factory(factory);
        }
        registry
    }

    /// Build a registry from configured labels and devices
    pub async fn from_config(labels: &[String], devices: &[DeviceConfig]) -> AppResult<Self> {
        let mut registry = Self::new();
        for label in labels {
            registry.register_label(label);
        }
        for device in devices {
            registry.register(device.clone()).await?;
        }
        info!(
            devices = registry.len(),
            labels = registry.label_order.len(),
            "Device registry populated"
        );
        Ok(registry)
    }

    /// Install a factory, replacing any with the same driver name
    pub fn add_factory(&mut self, factory: Arc<dyn DeviceFactory>) {
        self.factories.insert(factory.driver_type(), factory);
    }

    /// Register a capability label. Returns false if it already existed.
    pub fn register_label(&mut self, label: &str) -> bool {
        if self.by_label.contains_key(label) {
            return false;
        }
        self.label_order.push(label.to_string());
        self.by_label.insert(label.to_string(), Vec::new());
        true
    }

    /// Registered labels in registration order
    pub fn labels(&self) -> Vec<String> {
        self.label_order.clone()
    }

    /// Build a device through its factory and register it
    pub async fn register(&mut self, config: DeviceConfig) -> AppResult<()> {
        let factory = self.factories.get(config.driver.as_str()).cloned().ok_or_else(|| {
            ValidationError::Configuration(format!(
                "device '{}': unknown driver '{}'",
                config.id, config.driver
            ))
        })?;

        factory.validate(&config.settings).map_err(|e| {
            ValidationError::Configuration(format!("device '{}': {e}", config.id))
        })?;

        let components = factory.build(config.clone()).await.map_err(|e| {
            ValidationError::Configuration(format!("device '{}': {e}", config.id))
        })?;

        self.register_components(config, components)
    }

    /// Register pre-built capability implementations
    ///
    /// Labels named by the config are registered on the fly.
    pub fn register_components(
        &mut self,
        config: DeviceConfig,
        components: DeviceComponents,
    ) -> AppResult<()> {
        if self.devices.contains_key(&config.id) {
            return Err(ValidationError::Configuration(format!(
                "duplicate device id '{}'",
                config.id
            )));
        }
        if config.labels.is_empty() {
            return Err(ValidationError::Configuration(format!(
                "device '{}' has no capability labels",
                config.id
            )));
        }

        let handle = Arc::new(DeviceHandle::new(config, components)?);
        let id = handle.id().to_string();
        for label in handle.labels() {
            self.register_label(label);
            if let Some(ids) = self.by_label.get_mut(label) {
                if !ids.contains(&id) {
                    ids.push(id.clone());
                }
            }
        }
        debug!(device = %id, labels = ?handle.labels(), "Device registered");
        self.order.push(id.clone());
        self.devices.insert(id, handle);
        Ok(())
    }

    /// Devices carrying `label`, in registration order
    ///
    /// # Errors
    /// `UnknownLabel` if the label was never registered. A registered label
    /// with no devices yields an empty vector.
    pub fn discover(&self, label: &str) -> AppResult<Vec<Arc<DeviceHandle>>> {
        let ids = self
            .by_label
            .get(label)
            .ok_or_else(|| ValidationError::UnknownLabel(label.to_string()))?;
        Ok(ids
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect())
    }

    /// [`discover`](Self::discover) for several labels at once
    pub fn discover_all<S: AsRef<str>>(
        &self,
        labels: &[S],
    ) -> AppResult<BTreeMap<String, Vec<Arc<DeviceHandle>>>> {
        labels
            .iter()
            .map(|label| {
                let label = label.as_ref();
                Ok((label.to_string(), self.discover(label)?))
            })
            .collect()
    }

    /// Device by id
    pub fn get(&self, id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.get(id).cloned()
    }

    /// All devices in registration order
    pub fn devices(&self) -> Vec<Arc<DeviceHandle>> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no devices are registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockMotor, MockScaler};

    fn motor_config(id: &str) -> DeviceConfig {
        DeviceConfig::new(id, &["motors"], format!("gp:{id}.RBV"), "mock_motor")
    }

    #[tokio::test]
    async fn test_register_and_discover() {
        let mut registry = DeviceRegistry::new();
        registry.register_label("support");
        for id in ["m3", "m1", "m2"] {
            registry.register(motor_config(id)).await.unwrap();
        }

        let ids: Vec<_> = registry
            .discover("motors")
            .unwrap()
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(ids, vec!["m3", "m1", "m2"]);
        assert!(registry.discover("support").unwrap().is_empty());
        assert_eq!(registry.labels(), vec!["support", "motors"]);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_label() {
        let registry = DeviceRegistry::new();
        let err = registry.discover("unregistered-label").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownLabel(l) if l == "unregistered-label"));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let mut registry = DeviceRegistry::new();
        registry.register(motor_config("m1")).await.unwrap();
        let err = registry.register(motor_config("m1")).await.unwrap_err();
        assert!(matches!(err, ValidationError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_driver_rejected() {
        let mut registry = DeviceRegistry::new();
        let config = DeviceConfig::new("x", &["motors"], "x.RBV", "epics_motor");
        let err = registry.register(config).await.unwrap_err();
        assert!(err.to_string().contains("unknown driver 'epics_motor'"));
    }

    #[test]
    fn test_register_components_requires_readable() {
        let mut registry = DeviceRegistry::new();
        let motor = Arc::new(MockMotor::new("gp:m1"));
        let components = DeviceComponents {
            movable: Some(motor),
            ..Default::default()
        };
        let err = registry
            .register_components(motor_config("m1"), components)
            .unwrap_err();
        assert!(err.to_string().contains("no readable"));
    }

    #[test]
    fn test_capabilities_and_state() {
        let mut registry = DeviceRegistry::new();
        let scaler = Arc::new(MockScaler::new("gp:scaler1"));
        registry
            .register_components(
                DeviceConfig::new("scaler1", &["detectors"], "gp:scaler1.S1", "mock_scaler"),
                DeviceComponents {
                    readable: Some(scaler.clone()),
                    triggerable: Some(scaler.clone()),
                    multi_channel: Some(scaler),
                    ..Default::default()
                },
            )
            .unwrap();

        let handle = registry.get("scaler1").unwrap();
        assert_eq!(
            handle.capabilities(),
            vec![
                Capability::Readable,
                Capability::Triggerable,
                Capability::MultiChannel
            ]
        );
        assert_eq!(handle.connection_state(), ConnectionState::Unknown);
        handle.set_connection_state(ConnectionState::Connected);
        assert_eq!(handle.connection_state(), ConnectionState::Connected);
        assert_eq!(handle.multi_channel().unwrap().channel_count(), 32);
    }

    #[tokio::test]
    async fn test_discover_all_fails_on_first_unknown_label() {
        let mut registry = DeviceRegistry::new();
        registry.register(motor_config("m1")).await.unwrap();
        let map = registry.discover_all(&["motors"]).unwrap();
        assert_eq!(map["motors"].len(), 1);
        assert!(registry.discover_all(&["motors", "lasers"]).is_err());
    }
}
