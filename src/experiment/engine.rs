//! Execution engine
//!
//! The engine drives plans against the hardware. It is a single shared resource:
//! exactly one submission may be in flight at any time.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  submit()   ┌─────────┐
//! │ Idle │────────────▶│ Running │
//! └──────┘             └────┬────┘
//!    ▲                      │ cancel()
//!    │                      ▼
//!    │  plan returns   ┌──────────┐
//!    └─────────────────│ Aborting │
//!                      └──────────┘
//! ```
//!
//! The state returns to `Idle` when the submission future completes *or is
//! dropped*, so an aborted task cannot leave the engine wedged.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = SimulatedEngine::new(registry.clone(), catalog.clone());
//! let handle = EngineHandle::new(Arc::new(engine));
//!
//! let engine = handle.lock().await;   // exclusive access
//! let summary = engine.submit(&spec).await?;
//! ```

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::experiment::catalog::{InMemoryCatalog, RunRecord};
use crate::experiment::plans::{
    alignment_points, Count, LineScan, PeakSearch, Plan, PlanCommand, PlanKind, PlanSpec,
    RelativeMove,
};
use crate::hardware::capabilities::Movable;
use crate::hardware::registry::{DeviceHandle, DeviceRegistry};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No plan running, ready to accept a submission
    Idle,
    /// Executing a plan
    Running,
    /// Cancellation requested; stops at the next command boundary
    Aborting,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Aborting => write!(f, "aborting"),
        }
    }
}

/// What the engine reports after a successful submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Spec name
    pub plan_name: String,
    /// Generator type that ran
    pub plan_type: String,
    /// Commands executed
    pub commands: usize,
    /// Events emitted
    pub events: usize,
    /// Run uid when a record was persisted
    pub run_uid: Option<String>,
    /// Scan id when a record was persisted
    pub scan_id: Option<u64>,
    /// Whether hardware was left untouched
    pub simulated: bool,
}

/// Execution engine contract
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Execute one plan to completion
    ///
    /// Fails with "engine busy" if another submission is in flight.
    async fn submit(&self, spec: &PlanSpec) -> Result<RunSummary>;

    /// Whether [`cancel`](Self::cancel) is implemented
    fn supports_cancel(&self) -> bool {
        false
    }

    /// Request cooperative cancellation of the in-flight submission
    async fn cancel(&self) -> Result<()> {
        bail!("cancellation not supported by this engine")
    }

    /// Current state
    fn state(&self) -> EngineState;
}

/// Shared handle granting exclusive access to the engine
///
/// The runner holds the guard for the whole submission; dropping it (on
/// success, fault or timeout) releases the engine.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<AsyncMutex<Arc<dyn ExecutionEngine>>>,
}

impl EngineHandle {
    /// Wrap an engine
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            inner: Arc::new(AsyncMutex::new(engine)),
        }
    }

    /// Wait for exclusive access
    pub async fn lock(&self) -> MutexGuard<'_, Arc<dyn ExecutionEngine>> {
        self.inner.lock().await
    }

    /// Exclusive access if nobody holds it
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Arc<dyn ExecutionEngine>>> {
        self.inner.try_lock().ok()
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

// =============================================================================
// SimulatedEngine
// =============================================================================

/// Resets the engine state to `Idle` when dropped
struct RunningGuard<'a> {
    state: &'a Mutex<EngineState>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = EngineState::Idle;
    }
}

#[derive(Debug, Clone)]
struct Event {
    positions: HashMap<String, f64>,
    data: BTreeMap<String, f64>,
}

/// Per-submission execution context
#[derive(Debug, Default)]
struct RunContext {
    simulate: bool,
    commands: usize,
    positions: HashMap<String, f64>,
    collected: BTreeMap<String, f64>,
    events: Vec<Event>,
    peak_mark: usize,
    data_keys: BTreeSet<String>,
}

/// Engine executing plans against registry devices
///
/// In simulation mode (engine-wide or per spec) commands are generated and
/// counted against virtual positions, no move or trigger reaches the hardware
/// and no record is persisted. Positions and limits are still read to resolve
/// relative plans.
pub struct SimulatedEngine {
    registry: Arc<DeviceRegistry>,
    catalog: Arc<InMemoryCatalog>,
    simulate: bool,
    settle_time: Duration,
    state: Mutex<EngineState>,
    abort_requested: AtomicBool,
}

impl SimulatedEngine {
    /// Create an engine driving `registry` and persisting to `catalog`
    pub fn new(registry: Arc<DeviceRegistry>, catalog: Arc<InMemoryCatalog>) -> Self {
        Self {
            registry,
            catalog,
            simulate: false,
            settle_time: Duration::ZERO,
            state: Mutex::new(EngineState::Idle),
            abort_requested: AtomicBool::new(false),
        }
    }

    /// Simulate every submission
    pub fn with_simulation(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Pause after every scan move
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    fn begin(&self) -> Result<RunningGuard<'_>> {
        let mut state = self.state.lock();
        if *state != EngineState::Idle {
            bail!("engine busy: {}", *state);
        }
        *state = EngineState::Running;
        self.abort_requested.store(false, Ordering::SeqCst);
        Ok(RunningGuard { state: &self.state })
    }

    fn device(&self, id: &str) -> Result<Arc<DeviceHandle>> {
        self.registry
            .get(id)
            .ok_or_else(|| anyhow!("unknown device '{id}'"))
    }

    fn movable(&self, id: &str) -> Result<Arc<dyn Movable>> {
        self.device(id)?
            .movable()
            .ok_or_else(|| anyhow!("device '{id}' is not movable"))
    }

    /// Current position of `mover`, seeded into the context
    async fn origin(&self, mover: &str, ctx: &mut RunContext) -> Result<f64> {
        let position = self
            .movable(mover)?
            .position()
            .await
            .with_context(|| format!("reading position of '{mover}'"))?;
        ctx.positions.insert(mover.to_string(), position);
        Ok(position)
    }

    async fn build_plan(&self, spec: &PlanSpec, ctx: &mut RunContext) -> Result<Box<dyn Plan>> {
        if let Some(reason) = spec.missing_targets() {
            bail!(reason);
        }
        if let Err(reason) = spec.kind.validate() {
            bail!("{}: {reason}", spec.kind.type_name());
        }
        let mover = || {
            spec.movers
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("plan has no mover"))
        };
        let detector = || {
            spec.detectors
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("plan has no detector"))
        };
        let settle = self.settle_time.as_secs_f64();

        let plan: Box<dyn Plan> = match &spec.kind {
            PlanKind::Count { num, delay } => Box::new(
                Count::new(*num)
                    .with_detectors(&spec.detectors)
                    .with_delay(delay.as_secs_f64()),
            ),
            PlanKind::MoveRelative { delta } => Box::new(RelativeMove::new(&spec.movers, *delta)),
            PlanKind::RoundTrip { delta } => {
                for m in &spec.movers {
                    self.origin(m, ctx).await?;
                }
                Box::new(RelativeMove::round_trip(&spec.movers, *delta))
            }
            PlanKind::Scan {
                start,
                stop,
                points,
            } => Box::new(
                LineScan::new(&mover()?, *start, *stop, *points)
                    .with_detectors(&spec.detectors)
                    .with_settle_time(settle),
            ),
            PlanKind::RelativeScan {
                start,
                stop,
                points,
            } => {
                let axis = mover()?;
                let origin = self.origin(&axis, ctx).await?;
                Box::new(
                    LineScan::new(&axis, origin + start, origin + stop, *points)
                        .with_detectors(&spec.detectors)
                        .with_settle_time(settle)
                        .returning_to(origin),
                )
            }
            PlanKind::QuickScan { range, points } => {
                let axis = mover()?;
                let origin = self.origin(&axis, ctx).await?;
                Box::new(
                    LineScan::new(&axis, origin - range, origin + range, *points)
                        .with_detectors(&spec.detectors)
                        .with_settle_time(settle)
                        .returning_to(origin),
                )
            }
            PlanKind::MotorCharacterization {
                range_fraction,
                points,
            } => {
                let axis = mover()?;
                let origin = self.origin(&axis, ctx).await?;
                let (low, high) = self.movable(&axis)?.limits().await?;
                let half_span = (high - low) * range_fraction / 2.0;
                let start = (origin - half_span).max(low);
                let stop = (origin + half_span).min(high);
                debug!(axis = %axis, low, high, start, stop, "Characterization window");
                Box::new(
                    LineScan::new(&axis, start, stop, *points)
                        .with_detectors(&spec.detectors)
                        .with_settle_time(settle)
                        .returning_to(origin),
                )
            }
            PlanKind::DetectorOptimization {
                initial_range,
                refinement_cycles,
                points,
            } => {
                let axis = mover()?;
                self.origin(&axis, ctx).await?;
                Box::new(PeakSearch::new(
                    &[axis],
                    &detector()?,
                    *initial_range,
                    *points,
                    *refinement_cycles,
                ))
            }
            PlanKind::SampleAlignment {
                scan_range,
                step_size,
            } => {
                let points = alignment_points(*scan_range, *step_size).map_err(|e| anyhow!(e))?;
                for m in &spec.movers {
                    self.origin(m, ctx).await?;
                }
                Box::new(PeakSearch::new(
                    &spec.movers,
                    &detector()?,
                    *scan_range,
                    points,
                    1,
                ))
            }
        };
        Ok(plan)
    }

    async fn drive(&self, plan: &mut dyn Plan, ctx: &mut RunContext) -> Result<()> {
        while let Some(cmd) = plan.next_command() {
            if self.abort_requested.load(Ordering::SeqCst) {
                warn!(plan = plan.plan_type(), "Plan aborted at command boundary");
                return Err(ValidationError::plan(plan.plan_type(), "aborted").into());
            }
            ctx.commands += 1;
            self.process_command(cmd, ctx).await?;
            // Simulated commands never suspend; let cancel and timeouts run
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn process_command(&self, cmd: PlanCommand, ctx: &mut RunContext) -> Result<()> {
        debug!(?cmd, simulate = ctx.simulate, "Processing command");

        match cmd {
            PlanCommand::MoveTo {
                device_id,
                position,
            } => {
                if !ctx.simulate {
                    self.execute_move(&device_id, position).await?;
                }
                ctx.positions.insert(device_id, position);
            }

            PlanCommand::MoveRelative { device_id, delta } => {
                if ctx.simulate {
                    *ctx.positions.entry(device_id).or_insert(0.0) += delta;
                } else {
                    let motor = self.movable(&device_id)?;
                    motor
                        .move_rel(delta)
                        .await
                        .with_context(|| format!("relative move of '{device_id}' by {delta}"))?;
                    motor.wait_settled().await?;
                    let position = motor.position().await?;
                    ctx.positions.insert(device_id, position);
                }
            }

            PlanCommand::Read { device_id } => {
                let value = if ctx.simulate {
                    ctx.positions.get(&device_id).copied().unwrap_or(0.0)
                } else {
                    self.execute_read(&device_id).await?
                };
                ctx.collected.insert(device_id, value);
            }

            PlanCommand::Trigger { device_id } => {
                if !ctx.simulate {
                    self.execute_trigger(&device_id).await?;
                }
            }

            PlanCommand::Wait { seconds } => {
                if !ctx.simulate && seconds > 0.0 {
                    debug!(seconds, "Waiting");
                    sleep(Duration::from_secs_f64(seconds)).await;
                }
            }

            PlanCommand::Checkpoint { label } => {
                debug!(label = %label, "Checkpoint");
            }

            PlanCommand::EmitEvent { stream } => {
                let data = std::mem::take(&mut ctx.collected);
                ctx.data_keys.extend(data.keys().cloned());
                ctx.data_keys.extend(ctx.positions.keys().cloned());
                debug!(stream = %stream, seq = ctx.events.len() + 1, "Event");
                ctx.events.push(Event {
                    positions: ctx.positions.clone(),
                    data,
                });
            }

            PlanCommand::MoveToPeak {
                device_id,
                detector_id,
            } => {
                let peak = ctx.events[ctx.peak_mark..]
                    .iter()
                    .filter_map(|e| {
                        let reading = e.data.get(&detector_id).copied()?;
                        let position = e.positions.get(&device_id).copied()?;
                        reading.is_finite().then_some((position, reading))
                    })
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(position, _)| position)
                    .ok_or_else(|| {
                        anyhow!("no readings of '{detector_id}' to locate a peak for '{device_id}'")
                    })?;
                ctx.peak_mark = ctx.events.len();
                debug!(axis = %device_id, peak, "Moving to peak");
                if !ctx.simulate {
                    self.execute_move(&device_id, peak).await?;
                }
                ctx.positions.insert(device_id, peak);
            }
        }
        Ok(())
    }

    async fn execute_move(&self, device_id: &str, position: f64) -> Result<()> {
        debug!(device = %device_id, position, "Moving");
        let motor = self.movable(device_id)?;
        motor
            .move_abs(position)
            .await
            .with_context(|| format!("move of '{device_id}' to {position}"))?;
        motor.wait_settled().await
    }

    async fn execute_read(&self, device_id: &str) -> Result<f64> {
        debug!(device = %device_id, "Reading");
        let device = self.device(device_id)?;
        if let Some(motor) = device.movable() {
            return motor.position().await;
        }
        let value = device
            .readable()
            .read(device.read_path())
            .await
            .with_context(|| format!("read of '{}'", device.read_path()))?;
        match value {
            Value::Null => Err(ValidationError::read(
                device_id,
                device.read_path(),
                "device returned no value",
            )
            .into()),
            Value::Number(n) => Ok(n.as_f64().unwrap_or(f64::NAN)),
            Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            _ => Ok(f64::NAN),
        }
    }

    async fn execute_trigger(&self, device_id: &str) -> Result<()> {
        debug!(device = %device_id, "Triggering");
        match self.device(device_id)?.triggerable() {
            Some(det) => det
                .trigger()
                .await
                .with_context(|| format!("trigger of '{device_id}'")),
            None => {
                debug!(device = %device_id, "Device not triggerable, skipping");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ExecutionEngine for SimulatedEngine {
    async fn submit(&self, spec: &PlanSpec) -> Result<RunSummary> {
        let _running = self.begin()?;
        let mut ctx = RunContext {
            simulate: self.simulate || spec.simulate,
            ..RunContext::default()
        };

        let mut plan = self.build_plan(spec, &mut ctx).await?;
        let persist = plan.opens_run() && !ctx.simulate;
        let started_at = Utc::now();
        info!(
            plan = %spec.name,
            plan_type = plan.plan_type(),
            args = ?plan.plan_args(),
            simulate = ctx.simulate,
            "Executing plan"
        );

        let outcome = self.drive(plan.as_mut(), &mut ctx).await;

        let mut summary = RunSummary {
            plan_name: spec.name.clone(),
            plan_type: plan.plan_type().to_string(),
            commands: ctx.commands,
            events: ctx.events.len(),
            run_uid: None,
            scan_id: None,
            simulated: ctx.simulate,
        };

        if persist {
            let exit_status = match &outcome {
                Ok(()) => "success",
                Err(_) if self.abort_requested.load(Ordering::SeqCst) => "abort",
                Err(_) => "fail",
            };
            let record = RunRecord {
                uid: Uuid::new_v4().to_string(),
                scan_id: self.catalog.next_scan_id(),
                plan_name: spec.kind.type_name().to_string(),
                data_keys: std::mem::take(&mut ctx.data_keys),
                num_events: summary.events,
                exit_status: exit_status.to_string(),
                started_at,
            };
            info!(
                uid = %record.uid,
                scan_id = record.scan_id,
                exit_status,
                "Run persisted"
            );
            summary.run_uid = Some(record.uid.clone());
            summary.scan_id = Some(record.scan_id);
            self.catalog.insert(record);
        }

        outcome?;
        info!(
            plan = %spec.name,
            commands = summary.commands,
            events = summary.events,
            "Plan complete"
        );
        Ok(summary)
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    async fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            EngineState::Running => {
                info!("Abort requested");
                self.abort_requested.store(true, Ordering::SeqCst);
                *state = EngineState::Aborting;
                Ok(())
            }
            other => bail!("Cannot abort: engine is {other}"),
        }
    }

    fn state(&self) -> EngineState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::catalog::Catalog;
    use crate::experiment::plans::MAX_PLAN_POINTS;
    use crate::hardware::mock::{MockMotor, MockScaler};
    use crate::hardware::registry::{DeviceComponents, DeviceConfig};

    fn setup() -> (Arc<SimulatedEngine>, Arc<InMemoryCatalog>, Arc<MockMotor>) {
        let mut registry = DeviceRegistry::new();
        let motor = Arc::new(MockMotor::new("gp:m1"));
        registry
            .register_components(
                DeviceConfig::new("m1", &["motors"], "gp:m1.RBV", "mock_motor"),
                DeviceComponents {
                    readable: Some(motor.clone()),
                    movable: Some(motor.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
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
        let catalog = Arc::new(InMemoryCatalog::new());
        let engine = Arc::new(SimulatedEngine::new(Arc::new(registry), catalog.clone()));
        (engine, catalog, motor)
    }

    #[tokio::test]
    async fn test_count_persists_a_run() {
        let (engine, catalog, _) = setup();
        let spec = PlanSpec::new(
            "count",
            PlanKind::Count {
                num: 2,
                delay: Duration::ZERO,
            },
        )
        .with_detectors(&["scaler1"]);

        let summary = engine.submit(&spec).await.unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.scan_id, Some(1));
        assert_eq!(catalog.count(), 1);
        let latest = catalog.latest().unwrap();
        assert!(latest.data_keys.contains("scaler1"));
        assert_eq!(latest.exit_status, "success");
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_relative_scan_returns_to_origin() {
        let (engine, catalog, motor) = setup();
        motor.move_abs(1.0).await.unwrap();
        let spec = PlanSpec::new(
            "relative_scan",
            PlanKind::RelativeScan {
                start: -0.5,
                stop: 0.5,
                points: 3,
            },
        )
        .with_movers(&["m1"])
        .with_detectors(&["scaler1"]);

        engine.submit(&spec).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 1.0);
        let keys = catalog.latest().unwrap().data_keys;
        assert!(keys.contains("m1") && keys.contains("scaler1"));
    }

    #[tokio::test]
    async fn test_simulation_leaves_hardware_alone() {
        let (engine, catalog, motor) = setup();
        let spec = PlanSpec::new(
            "characterize",
            PlanKind::MotorCharacterization {
                range_fraction: 0.1,
                points: 5,
            },
        )
        .with_movers(&["m1"])
        .with_detectors(&["scaler1"])
        .simulated();

        let summary = engine.submit(&spec).await.unwrap();
        assert!(summary.simulated);
        assert!(summary.commands > 0);
        assert_eq!(catalog.count(), 0);
        assert_eq!(motor.position().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_detector_optimization_moves_to_peak() {
        let (engine, _, motor) = setup();
        let spec = PlanSpec::new(
            "optimize",
            PlanKind::DetectorOptimization {
                initial_range: 1.0,
                refinement_cycles: 2,
                points: 3,
            },
        )
        .with_movers(&["m1"])
        .with_detectors(&["scaler1"]);

        let summary = engine.submit(&spec).await.unwrap();
        assert_eq!(summary.events, 6);
        // Scaler counts grow with every trigger, so the last point of each scan peaks.
        let position = motor.position().await.unwrap();
        assert!((position - 1.5).abs() < 1e-9, "position {position}");
    }

    #[tokio::test]
    async fn test_second_submission_is_rejected_while_busy() {
        let (engine, _, _) = setup();
        let slow = PlanSpec::new(
            "slow count",
            PlanKind::Count {
                num: 3,
                delay: Duration::from_millis(200),
            },
        )
        .with_detectors(&["scaler1"]);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit(&slow).await })
        };
        sleep(Duration::from_millis(50)).await;

        let quick = PlanSpec::new(
            "count",
            PlanKind::Count {
                num: 1,
                delay: Duration::ZERO,
            },
        )
        .with_detectors(&["scaler1"]);
        let err = engine.submit(&quick).await.unwrap_err();
        assert!(err.to_string().contains("engine busy"));

        first.await.unwrap().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_stops_at_command_boundary() {
        let (engine, catalog, _) = setup();
        let slow = PlanSpec::new(
            "slow count",
            PlanKind::Count {
                num: 10,
                delay: Duration::from_millis(100),
            },
        )
        .with_detectors(&["scaler1"]);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit(&slow).await })
        };
        sleep(Duration::from_millis(150)).await;
        engine.cancel().await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert_eq!(catalog.latest().unwrap().exit_status, "abort");
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.cancel().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_plans_are_rejected_before_running() {
        let (engine, catalog, _) = setup();
        let huge = PlanSpec::new(
            "count",
            PlanKind::Count {
                num: 3_000_000,
                delay: Duration::ZERO,
            },
        )
        .with_detectors(&["scaler1"]);
        let err = engine.submit(&huge).await.unwrap_err();
        assert!(err.to_string().contains("limit is"), "{err}");

        let dense = PlanSpec::new(
            "align",
            PlanKind::SampleAlignment {
                scan_range: 1.0,
                step_size: 1e-9,
            },
        )
        .with_movers(&["m1", "m1"])
        .with_detectors(&["scaler1"]);
        let err = engine.submit(&dense).await.unwrap_err();
        assert!(err.to_string().contains("sample_alignment"), "{err}");

        assert_eq!(catalog.count(), 0);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_reaches_a_plan_that_never_suspends() {
        let (engine, catalog, _) = setup();
        let long = PlanSpec::new(
            "long count",
            PlanKind::Count {
                num: MAX_PLAN_POINTS,
                delay: Duration::ZERO,
            },
        )
        .with_detectors(&["scaler1"])
        .simulated();

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit(&long).await })
        };
        while engine.state() != EngineState::Running {
            tokio::task::yield_now().await;
        }
        engine.cancel().await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert_eq!(catalog.count(), 0);
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
