//! Validation engine: connectivity probes, plan runs, result aggregation and
//! suite orchestration.

pub mod context;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod runner;

pub use context::ValidationContext;
pub use orchestrator::{Phase, Suite, ValidationOrchestrator};
pub use probe::ConnectivityProbe;
pub use report::{
    CheckResult, ErrorResult, Outcome, PlanOutcome, PlanResult, ProbeOutcome, ProbeResult,
    ResultAggregator, SuiteReport, ValidationReport, Verdict,
};
pub use runner::PlanRunner;
