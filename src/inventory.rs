//! Device inventory
//!
//! A timestamped listing of the registry grouped by label, plus a per-device
//! analysis that reads the canonical path and every configured property with a
//! bounded timeout. Neither ever fails: unreachable properties are recorded
//! next to the ones that answered.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::hardware::registry::{Capability, ConnectionState, DeviceHandle, DeviceRegistry};

/// Entries shown per label by the human-readable summary
const SUMMARY_PREVIEW: usize = 3;

/// One device in the inventory
#[derive(Debug, Clone, Serialize)]
pub struct InventoryEntry {
    /// Device identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Driver that built the device
    pub driver: String,
    /// Canonical probe path
    pub read_path: String,
    /// Capabilities provided
    pub capabilities: Vec<Capability>,
    /// Cached connection state
    pub state: ConnectionState,
}

impl From<&DeviceHandle> for InventoryEntry {
    fn from(device: &DeviceHandle) -> Self {
        Self {
            id: device.id().to_string(),
            name: device.name().to_string(),
            driver: device.driver_type().to_string(),
            read_path: device.read_path().to_string(),
            capabilities: device.capabilities(),
            state: device.connection_state(),
        }
    }
}

/// Registry snapshot grouped by label, in label registration order
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    /// Snapshot time
    pub generated_at: DateTime<Utc>,
    /// Devices per label
    pub labels: Vec<(String, Vec<InventoryEntry>)>,
}

impl Inventory {
    /// Snapshot `registry`
    pub fn generate(registry: &DeviceRegistry) -> Self {
        let labels = registry
            .labels()
            .into_iter()
            .map(|label| {
                let entries = registry
                    .discover(&label)
                    .unwrap_or_default()
                    .iter()
                    .map(|d| InventoryEntry::from(d.as_ref()))
                    .collect();
                (label, entries)
            })
            .collect();
        Self {
            generated_at: Utc::now(),
            labels,
        }
    }

    /// Entries under `label`
    pub fn label(&self, label: &str) -> Option<&[InventoryEntry]> {
        self.labels
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, entries)| entries.as_slice())
    }
}

impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "📊 Device inventory (as of {})",
            self.generated_at.format("%Y-%m-%d %H:%M:%S")
        )?;
        for (label, entries) in &self.labels {
            writeln!(f)?;
            writeln!(f, "🔧 {label}: {}", entries.len())?;
            for entry in entries.iter().take(SUMMARY_PREVIEW) {
                writeln!(
                    f,
                    "   - {} ({}): {} [{}]",
                    entry.id, entry.read_path, entry.name, entry.state
                )?;
            }
            if entries.len() > SUMMARY_PREVIEW {
                writeln!(f, "   ... and {} more", entries.len() - SUMMARY_PREVIEW)?;
            }
        }
        Ok(())
    }
}

/// Result of reading one property
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyReading {
    /// The property answered
    Value(Value),
    /// The read failed or timed out
    Failed(String),
}

/// Per-device property readout
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAnalysis {
    /// Device identifier
    pub id: String,
    /// True iff at least one read succeeded
    pub connected: bool,
    /// Reading per path
    pub properties: BTreeMap<String, PropertyReading>,
}

impl fmt::Display for DeviceAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.connected { "✅" } else { "❌" };
        writeln!(f, "{mark} {}", self.id)?;
        for (path, reading) in &self.properties {
            match reading {
                PropertyReading::Value(v) => writeln!(f, "   {path} = {v}")?,
                PropertyReading::Failed(e) => writeln!(f, "   {path}: {e}")?,
            }
        }
        Ok(())
    }
}

/// Read the canonical path and every property of `device`, each within `limit`
pub async fn analyze_device(device: &DeviceHandle, limit: Duration) -> DeviceAnalysis {
    let readable = device.readable();
    let mut properties = BTreeMap::new();
    let mut connected = false;

    let paths = std::iter::once(device.read_path())
        .chain(device.properties().iter().map(String::as_str));
    for path in paths {
        let reading = match timeout(limit, readable.read(path)).await {
            Ok(Ok(value)) => {
                connected = true;
                PropertyReading::Value(value)
            }
            Ok(Err(e)) => PropertyReading::Failed(format!("{e:#}")),
            Err(_) => PropertyReading::Failed(format!("timed out after {limit:?}")),
        };
        debug!(device = %device.id(), path, ?reading, "Property read");
        properties.insert(path.to_string(), reading);
    }

    DeviceAnalysis {
        id: device.id().to_string(),
        connected,
        properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::hardware::registry::DeviceConfig;

    async fn demo_registry() -> DeviceRegistry {
        let config = ValidationConfig::demo().unwrap();
        DeviceRegistry::from_config(&config.labels, &config.devices)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_inventory_groups_by_label() {
        let registry = demo_registry().await;
        let inventory = Inventory::generate(&registry);
        assert_eq!(inventory.label("motors").unwrap().len(), 4);
        assert_eq!(inventory.label("detectors").unwrap().len(), 2);
        assert!(inventory.label("missing").is_none());

        let text = inventory.to_string();
        assert!(text.contains("motors: 4"));
        assert!(text.contains("... and 1 more"));
    }

    #[tokio::test]
    async fn test_analyze_reads_every_property() {
        let registry = demo_registry().await;
        let motor = registry.get("m1").unwrap();
        let analysis = analyze_device(&motor, Duration::from_secs(1)).await;
        assert!(analysis.connected);
        assert_eq!(
            analysis.properties["gp:m1.DESC"],
            PropertyReading::Value(Value::String("GP motor 1".into()))
        );
        assert_eq!(analysis.properties.len(), 6);
    }

    #[tokio::test]
    async fn test_analyze_records_unknown_property() {
        let mut registry = DeviceRegistry::new();
        let mut config = DeviceConfig::new("calc", &["support"], "gp:userCalc1", "mock_signal");
        config.properties = vec!["gp:userCalc1.CALC".into()];
        registry.register(config).await.unwrap();

        let analysis = analyze_device(&registry.get("calc").unwrap(), Duration::from_secs(1)).await;
        assert!(analysis.connected);
        assert!(matches!(
            analysis.properties["gp:userCalc1.CALC"],
            PropertyReading::Failed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_hung_device() {
        let mut registry = DeviceRegistry::new();
        let mut config = DeviceConfig::new("m9", &["motors"], "gp:m9.RBV", "mock_motor");
        config.settings = toml::Value::Table(toml::toml! { behavior = "hang" });
        registry.register(config).await.unwrap();

        let analysis =
            analyze_device(&registry.get("m9").unwrap(), Duration::from_millis(100)).await;
        assert!(!analysis.connected);
        assert!(matches!(
            analysis.properties["gp:m9.RBV"],
            PropertyReading::Failed(ref e) if e.contains("timed out")
        ));
    }
}
