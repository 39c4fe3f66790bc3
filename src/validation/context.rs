//! Validation context
//!
//! Everything a validation run shares, built once at run start and passed by
//! reference: configuration, device registry, run catalog and the engine
//! handle. Dropping the context releases all of them.

use std::sync::Arc;
use tracing::info;

use crate::config::ValidationConfig;
use crate::error::AppResult;
use crate::experiment::catalog::{Catalog, InMemoryCatalog};
use crate::experiment::engine::{EngineHandle, SimulatedEngine};
use crate::hardware::registry::DeviceRegistry;
use crate::validation::probe::ConnectivityProbe;
use crate::validation::runner::PlanRunner;

/// Shared state of one validation run
#[derive(Clone)]
pub struct ValidationContext {
    /// Loaded configuration
    pub config: Arc<ValidationConfig>,
    /// Devices under validation
    pub registry: Arc<DeviceRegistry>,
    /// Run catalog, read-only from the validation side
    pub catalog: Arc<dyn Catalog>,
    /// Exclusive handle on the execution engine
    pub engine: EngineHandle,
}

impl ValidationContext {
    /// Build the registry from configuration and attach the simulated engine
    pub async fn from_config(config: ValidationConfig) -> AppResult<Self> {
        let registry = Arc::new(DeviceRegistry::from_config(&config.labels, &config.devices).await?);
        let catalog = Arc::new(InMemoryCatalog::new());
        let engine = SimulatedEngine::new(registry.clone(), catalog.clone())
            .with_simulation(config.plans.simulate)
            .with_settle_time(config.plans.settle_pause);
        info!(
            devices = registry.len(),
            simulate = config.plans.simulate,
            "Validation context ready"
        );
        Ok(Self {
            config: Arc::new(config),
            registry,
            catalog,
            engine: EngineHandle::new(Arc::new(engine)),
        })
    }

    /// Context around collaborators built elsewhere
    pub fn new(
        config: ValidationConfig,
        registry: Arc<DeviceRegistry>,
        catalog: Arc<dyn Catalog>,
        engine: EngineHandle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            catalog,
            engine,
        }
    }

    /// Probe configured from `[probe]`
    pub fn probe(&self) -> ConnectivityProbe {
        ConnectivityProbe::from_config(&self.config.probe)
    }

    /// Runner bound to this context's engine
    pub fn runner(&self) -> PlanRunner {
        PlanRunner::new(
            self.engine.clone(),
            self.registry.clone(),
            self.catalog.clone(),
        )
        .with_check_timeout(self.config.probe.timeout)
    }
}
