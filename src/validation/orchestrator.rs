//! Validation orchestrator
//!
//! Runs suites one after another through a fixed phase sequence:
//!
//! ```text
//! Idle ─▶ Discovering ─▶ Probing | Executing ─▶ Aggregating ─┐
//!              ▲                                             │ next suite
//!              └─────────────────────────────────────────────┘
//!                                                    all suites ─▶ Done
//! ```
//!
//! A suite always runs to completion: device and plan failures are results,
//! an unknown label becomes a suite-level error. A panic while probing costs
//! only the device it happened on. A panic inside the runner turns that plan
//! and the suite's remaining plans into error results. Only an aggregation
//! invariant violation escapes [`ValidationOrchestrator::run`].

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{panic_message, AppResult, ValidationError};
use crate::experiment::plans::{PlanKind, PlanSpec};
use crate::hardware::registry::DeviceId;
use crate::validation::context::ValidationContext;
use crate::validation::report::{CheckResult, ErrorResult, ResultAggregator, ValidationReport};

/// Half width of the built-in scans around the current position
pub const SCAN_HALF_WIDTH: f64 = 0.1;

/// Points of the built-in scans
pub const SCAN_POINTS: usize = 5;

/// Orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing started
    Idle,
    /// Resolving labels to devices
    Discovering,
    /// Connectivity probes in flight
    Probing,
    /// Plans executing
    Executing,
    /// Recording suite results
    Aggregating,
    /// Report built
    Done,
}

/// Validation suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suite {
    /// Probe every device of every configured label
    Connectivity,
    /// Motion round trip and a single count
    Operations,
    /// Plans that must leave a record in the catalog
    DataCollection,
    /// Built-in, custom and configured plans
    Plans,
}

impl Suite {
    /// Every suite in execution order
    pub fn all() -> Vec<Suite> {
        vec![
            Suite::Connectivity,
            Suite::Operations,
            Suite::DataCollection,
            Suite::Plans,
        ]
    }

    /// Name used in reports
    pub fn name(self) -> &'static str {
        match self {
            Suite::Connectivity => "connectivity",
            Suite::Operations => "operations",
            Suite::DataCollection => "data_collection",
            Suite::Plans => "plans",
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Suite {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connectivity" => Ok(Suite::Connectivity),
            "operations" => Ok(Suite::Operations),
            "data_collection" | "data" => Ok(Suite::DataCollection),
            "plans" => Ok(Suite::Plans),
            other => Err(ValidationError::Configuration(format!(
                "unknown suite '{other}'"
            ))),
        }
    }
}

/// Motor and detector resolved for the plan suites
#[derive(Debug, Default)]
struct Targets {
    motors: Vec<DeviceId>,
    detector: Option<DeviceId>,
}

impl Targets {
    fn motor(&self) -> Option<&DeviceId> {
        self.motors.first()
    }
}

/// A plan to run, or the reason it could not be prepared
type Planned = Result<PlanSpec, ErrorResult>;

/// Sequences suites over one [`ValidationContext`]
pub struct ValidationOrchestrator {
    ctx: ValidationContext,
    transitions: Mutex<Vec<Phase>>,
}

impl ValidationOrchestrator {
    /// Orchestrator over `ctx`
    pub fn new(ctx: ValidationContext) -> Self {
        Self {
            ctx,
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Shared context
    pub fn context(&self) -> &ValidationContext {
        &self.ctx
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.transitions.lock().last().copied().unwrap_or(Phase::Idle)
    }

    /// Phases entered during the last run, in order
    pub fn transitions(&self) -> Vec<Phase> {
        self.transitions.lock().clone()
    }

    fn enter(&self, phase: Phase) {
        info!(?phase, "Entering phase");
        self.transitions.lock().push(phase);
    }

    /// Run `suites` in order and build the report
    ///
    /// # Errors
    /// Only `AggregationInvariant`: the counts of a suite disagree with its
    /// results, so the report cannot be trusted.
    pub async fn run(&self, suites: &[Suite]) -> AppResult<ValidationReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.transitions.lock().clear();
        info!(%run_id, suites = ?suites, "Validation run starting");

        let aggregator = ResultAggregator::new();
        for &suite in suites {
            let span = info_span!("suite", name = suite.name());
            self.run_suite(suite, &aggregator).instrument(span).await?;
        }

        let report = aggregator.finish(run_id, started_at, self.ctx.config.policy.empty_suite);
        self.enter(Phase::Done);
        info!(
            %run_id,
            passed = report.passed,
            total = report.total,
            overall_passed = report.overall_passed,
            "Validation run complete"
        );
        Ok(report)
    }

    async fn run_suite(&self, suite: Suite, aggregator: &ResultAggregator) -> AppResult<()> {
        aggregator.begin_suite(suite.name());
        let results = match suite {
            Suite::Connectivity => self.connectivity().await,
            Suite::Operations | Suite::DataCollection | Suite::Plans => {
                self.enter(Phase::Discovering);
                let planned = match self.targets() {
                    Ok(targets) => self.plans_for(suite, &targets).await,
                    Err(error) => vec![Err(error)],
                };
                self.execute(planned).await
            }
        };

        self.enter(Phase::Aggregating);
        aggregator.record_all(suite.name(), results)
    }

    async fn connectivity(&self) -> Vec<CheckResult> {
        self.enter(Phase::Discovering);
        let groups: Vec<_> = self
            .ctx
            .config
            .connectivity_labels()
            .into_iter()
            .map(|label| {
                let devices = self.ctx.registry.discover(&label);
                (label, devices)
            })
            .collect();

        self.enter(Phase::Probing);
        let probe = self.ctx.probe();
        let mut results = Vec::new();
        for (label, discovered) in groups {
            let devices = match discovered {
                Ok(devices) => devices,
                Err(e) => {
                    warn!(label = %label, error = %e, "Label not probed");
                    results.push(ErrorResult::new(&label, e.to_string()).into());
                    continue;
                }
            };
            info!(label = %label, devices = devices.len(), "Probing label");
            results.extend(
                probe
                    .check_all(&devices)
                    .await
                    .into_iter()
                    .map(CheckResult::from),
            );
        }
        results
    }

    fn targets(&self) -> Result<Targets, ErrorResult> {
        let suites = &self.ctx.config.suites;
        let discover = |label: &str| {
            self.ctx
                .registry
                .discover(label)
                .map_err(|e| ErrorResult::new(label, e.to_string()))
        };
        let motors = discover(suites.motor_label.as_str())?;
        let detectors = discover(suites.detector_label.as_str())?;
        Ok(Targets {
            motors: motors.iter().map(|d| d.id().to_string()).collect(),
            detector: detectors.first().map(|d| d.id().to_string()),
        })
    }

    /// Built-in spec with the configured timeout and retry policy
    fn spec(&self, name: &str, kind: PlanKind) -> PlanSpec {
        let plans = &self.ctx.config.plans;
        PlanSpec::new(name, kind)
            .with_timeout(plans.timeout)
            .with_retry(plans.retry.clone())
    }

    async fn plans_for(&self, suite: Suite, targets: &Targets) -> Vec<Planned> {
        let plans = &self.ctx.config.plans;
        let motor = targets.motor();
        let detector = targets.detector.as_ref();
        let mut planned = Vec::new();

        match suite {
            Suite::Connectivity => {}

            Suite::Operations => {
                if let Some(m) = motor {
                    planned.push(Ok(self
                        .spec(
                            "round_trip",
                            PlanKind::RoundTrip {
                                delta: plans.round_trip_delta,
                            },
                        )
                        .with_movers(&[m])
                        .with_return_tolerance(plans.round_trip_tolerance)));
                }
                if let Some(d) = detector {
                    planned.push(Ok(self.count("count", d)));
                }
            }

            Suite::DataCollection => {
                if let Some(d) = detector {
                    planned.push(Ok(self.count("count", d).expect_record()));
                    if let Some(m) = motor {
                        planned.push(Ok(self.relative_scan(m, d).expect_record()));
                    }
                }
            }

            Suite::Plans => {
                let Some(d) = detector else {
                    planned.extend(self.ctx.config.extra_plans.iter().cloned().map(Ok));
                    return planned;
                };
                planned.push(Ok(self.count("count", d).expect_record()));
                if let Some(m) = motor {
                    planned.push(Ok(self.relative_scan(m, d).expect_record()));
                    planned.push(self.absolute_scan(m, d).await);

                    let custom = |name: &str, kind: PlanKind| {
                        self.spec(name, kind).with_movers(&[m]).with_detectors(&[d])
                    };
                    planned.push(Ok(custom(
                        "motor_characterization (simulated)",
                        PlanKind::MotorCharacterization {
                            range_fraction: 0.1,
                            points: SCAN_POINTS,
                        },
                    )
                    .simulated()));
                    planned.push(Ok(custom(
                        "quick_scan (simulated)",
                        PlanKind::QuickScan {
                            range: 0.5,
                            points: SCAN_POINTS,
                        },
                    )
                    .simulated()));
                    planned.push(Ok(custom(
                        "detector_optimization (simulated)",
                        PlanKind::DetectorOptimization {
                            initial_range: 1.0,
                            refinement_cycles: 1,
                            points: SCAN_POINTS,
                        },
                    )
                    .simulated()));
                    if targets.motors.len() >= 2 {
                        planned.push(Ok(self
                            .spec(
                                "sample_alignment (simulated)",
                                PlanKind::SampleAlignment {
                                    scan_range: 1.0,
                                    step_size: 0.2,
                                },
                            )
                            .with_movers(&targets.motors[..2])
                            .with_detectors(&[d])
                            .simulated()));
                    }

                    planned.push(Ok(custom(
                        "quick_scan",
                        PlanKind::QuickScan {
                            range: SCAN_HALF_WIDTH,
                            points: SCAN_POINTS,
                        },
                    )
                    .with_return_tolerance(plans.round_trip_tolerance)));
                    planned.push(Ok(custom(
                        "motor_characterization",
                        PlanKind::MotorCharacterization {
                            range_fraction: 0.05,
                            points: SCAN_POINTS,
                        },
                    )
                    .with_return_tolerance(plans.round_trip_tolerance)));
                }
                planned.extend(self.ctx.config.extra_plans.iter().cloned().map(Ok));
            }
        }
        planned
    }

    fn count(&self, name: &str, detector: &str) -> PlanSpec {
        self.spec(
            name,
            PlanKind::Count {
                num: 1,
                delay: std::time::Duration::ZERO,
            },
        )
        .with_detectors(&[detector])
    }

    fn relative_scan(&self, motor: &str, detector: &str) -> PlanSpec {
        self.spec(
            "relative_scan",
            PlanKind::RelativeScan {
                start: -SCAN_HALF_WIDTH,
                stop: SCAN_HALF_WIDTH,
                points: SCAN_POINTS,
            },
        )
        .with_movers(&[motor])
        .with_detectors(&[detector])
    }

    /// Absolute scan centred on the motor's current position
    async fn absolute_scan(&self, motor: &str, detector: &str) -> Planned {
        let position = match self.ctx.registry.get(motor).and_then(|d| d.movable()) {
            Some(axis) => tokio::time::timeout(self.ctx.config.probe.timeout, axis.position())
                .await
                .map_err(|_| "position read timed out".to_string())
                .and_then(|r| r.map_err(|e| format!("{e:#}"))),
            None => Err(format!("device '{motor}' is not movable")),
        };
        match position {
            Ok(center) => Ok(self
                .spec(
                    "scan",
                    PlanKind::Scan {
                        start: center - SCAN_HALF_WIDTH,
                        stop: center + SCAN_HALF_WIDTH,
                        points: SCAN_POINTS,
                    },
                )
                .with_movers(&[motor])
                .with_detectors(&[detector])
                .expect_record()),
            Err(message) => Err(ErrorResult::new(
                "scan",
                format!("reading position of '{motor}': {message}"),
            )),
        }
    }

    async fn execute(&self, planned: Vec<Planned>) -> Vec<CheckResult> {
        self.enter(Phase::Executing);
        let runner = self.ctx.runner();
        let mut results = Vec::with_capacity(planned.len());
        let mut pending = planned.into_iter();

        while let Some(item) = pending.next() {
            let spec = match item {
                Ok(spec) => spec,
                Err(error) => {
                    results.push(error.into());
                    continue;
                }
            };
            match AssertUnwindSafe(runner.execute(&spec)).catch_unwind().await {
                Ok(result) => results.push(result.into()),
                Err(payload) => {
                    let message = format!("runner panicked: {}", panic_message(payload.as_ref()));
                    warn!(plan = %spec.name, %message, "Internal fault while executing");
                    results.push(ErrorResult::new(&spec.name, message).into());
                    for rest in pending.by_ref() {
                        let subject = match &rest {
                            Ok(spec) => spec.name.clone(),
                            Err(error) => error.subject.clone(),
                        };
                        results.push(
                            ErrorResult::new(subject, "not run after an internal fault").into(),
                        );
                    }
                }
            }
        }
        results
    }
}
