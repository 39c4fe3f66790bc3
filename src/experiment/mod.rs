//! Plans, the execution engine and the run catalog.

pub mod catalog;
pub mod engine;
pub mod plans;

pub use catalog::{Catalog, InMemoryCatalog, RunRecord};
pub use engine::{EngineHandle, EngineState, ExecutionEngine, RunSummary, SimulatedEngine};
pub use plans::{Plan, PlanCommand, PlanKind, PlanSpec};
