//! Plan runner
//!
//! Submits one [`PlanSpec`] at a time to the shared execution engine and turns
//! whatever happens into a [`PlanResult`]:
//!
//! 1. Resolve targets; absent or unreachable targets skip the plan without
//!    touching the engine.
//! 2. Take exclusive access to the engine. The guard is a local, so it is
//!    released on every path out of the attempt.
//! 3. Capture mover positions and the catalog count.
//! 4. Submit in a spawned task bounded by the plan timeout. On expiry the
//!    engine is cancelled if it supports it, otherwise the submission is left
//!    to finish on its own. A submission that completes inside the cancel
//!    grace period is kept and checked as usual.
//! 5. Capture positions again and verify the return tolerance and catalog
//!    record expectations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{classify, ErrorClass};
use crate::error_recovery::retry_when;
use crate::experiment::catalog::Catalog;
use crate::experiment::engine::{EngineHandle, RunSummary};
use crate::experiment::plans::PlanSpec;
use crate::hardware::registry::{ConnectionState, DeviceHandle, DeviceId, DeviceRegistry};
use crate::validation::report::{PlanOutcome, PlanResult};

/// Message recorded when the plan timeout elapses
pub const TIMED_OUT: &str = "execution timed out";

/// Default bound on position reads and live connection checks
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default wait for a cancelled submission to wind down
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

struct Attempt {
    result: PlanResult,
    retryable: bool,
}

impl Attempt {
    fn done(result: PlanResult) -> Self {
        Self {
            result,
            retryable: false,
        }
    }
}

/// Executes plans against the shared engine
#[derive(Clone)]
pub struct PlanRunner {
    engine: EngineHandle,
    registry: Arc<DeviceRegistry>,
    catalog: Arc<dyn Catalog>,
    check_timeout: Duration,
    cancel_grace: Duration,
}

impl PlanRunner {
    /// Runner over `engine`, resolving targets in `registry`
    pub fn new(
        engine: EngineHandle,
        registry: Arc<DeviceRegistry>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            engine,
            registry,
            catalog,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Bound on position reads and live connection checks
    pub fn with_check_timeout(mut self, check_timeout: Duration) -> Self {
        self.check_timeout = check_timeout;
        self
    }

    /// Wait for a cancelled submission before aborting its task
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Execute one plan
    ///
    /// Never fails: every condition becomes a [`PlanResult`]. Only engine
    /// failures caused by an unreachable device are retried, and only when
    /// the spec carries a retry policy.
    pub async fn execute(&self, spec: &PlanSpec) -> PlanResult {
        let attempt = retry_when(
            &spec.retry,
            |n| async move {
                let mut attempt = self.execute_once(spec).await;
                attempt.result.attempts = n;
                attempt
            },
            |a| a.retryable,
        )
        .await;

        let result = attempt.result;
        match result.outcome {
            PlanOutcome::Pass => info!(
                plan = %result.plan,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "Plan passed"
            ),
            PlanOutcome::Fail => warn!(
                plan = %result.plan,
                message = result.message.as_deref().unwrap_or(""),
                "Plan failed"
            ),
            PlanOutcome::Skipped => info!(
                plan = %result.plan,
                reason = result.message.as_deref().unwrap_or(""),
                "Plan skipped"
            ),
        }
        result
    }

    async fn execute_once(&self, spec: &PlanSpec) -> Attempt {
        let started = Instant::now();
        let plan_type = spec.kind.type_name();
        let skipped = |reason: String| {
            let mut result = PlanResult::new(&spec.name, plan_type, PlanOutcome::Skipped, reason);
            result.simulated = spec.simulate;
            Attempt::done(result)
        };

        if let Some(reason) = spec.missing_targets() {
            return skipped(reason);
        }
        let mut movers = Vec::new();
        for id in spec.targets() {
            let Some(device) = self.registry.get(&id) else {
                return skipped(format!("device '{id}' is not registered"));
            };
            if let Err(reason) = self.ensure_connected(&device).await {
                return skipped(reason);
            }
            if spec.movers.contains(&id) {
                movers.push(device);
            }
        }

        let engine = self.engine.lock().await;
        debug!(plan = %spec.name, state = %engine.state(), "Engine acquired");

        let before = match self.positions(&movers).await {
            Ok(positions) => positions,
            Err(message) => {
                let mut result = PlanResult::new(&spec.name, plan_type, PlanOutcome::Fail, message);
                result.elapsed = started.elapsed();
                return Attempt::done(result);
            }
        };
        let count_before = self.catalog.count();

        let mut result = PlanResult::new(&spec.name, plan_type, PlanOutcome::Fail, "");
        result.before = Some(before.clone());
        result.simulated = spec.simulate;

        let mut task = {
            let engine = Arc::clone(&*engine);
            let spec = spec.clone();
            tokio::spawn(async move { engine.submit(&spec).await })
        };

        let summary: RunSummary = match timeout(spec.timeout, &mut task).await {
            Ok(Ok(Ok(summary))) => summary,
            Ok(Ok(Err(e))) => {
                let retryable = classify(&e) == ErrorClass::Unreachable;
                result.message = Some(format!("{e:#}"));
                result.elapsed = started.elapsed();
                return Attempt { result, retryable };
            }
            Ok(Err(join_err)) => {
                result.message = Some(format!("engine task failed: {join_err}"));
                result.elapsed = started.elapsed();
                return Attempt::done(result);
            }
            Err(_) => {
                let late = if engine.supports_cancel() {
                    if let Err(e) = engine.cancel().await {
                        warn!(plan = %spec.name, error = %e, "Cancel request failed");
                    }
                    match timeout(self.cancel_grace, &mut task).await {
                        Ok(Ok(Ok(summary))) => Some(summary),
                        Ok(_) => None,
                        Err(_) => {
                            warn!(plan = %spec.name, "Submission ignored cancellation, aborting task");
                            task.abort();
                            None
                        }
                    }
                } else {
                    warn!(
                        plan = %spec.name,
                        "Engine cannot cancel, submission left running"
                    );
                    None
                };
                match late {
                    // Finished before the cancel landed; judge it like any other run
                    Some(summary) => {
                        info!(plan = %spec.name, "Submission completed during cancel grace");
                        summary
                    }
                    None => {
                        result.message = Some(TIMED_OUT.to_string());
                        result.elapsed = started.elapsed();
                        return Attempt::done(result);
                    }
                }
            }
        };
        result.simulated = summary.simulated;

        let after = match self.positions(&movers).await {
            Ok(positions) => positions,
            Err(message) => {
                result.message = Some(message);
                result.elapsed = started.elapsed();
                return Attempt::done(result);
            }
        };
        result.after = Some(after.clone());

        let count_after = self.catalog.count();
        result.records_delta = Some(count_after.saturating_sub(count_before));
        drop(engine);

        if let Some(tolerance) = spec.return_tolerance {
            if let Some(message) = return_mismatch(&before, &after, tolerance) {
                result.message = Some(message);
                result.elapsed = started.elapsed();
                return Attempt::done(result);
            }
        }

        if spec.expect_record && !summary.simulated {
            if let Err(message) = self.verify_record(&mut result) {
                result.message = Some(message);
                result.elapsed = started.elapsed();
                return Attempt::done(result);
            }
        }

        result.outcome = PlanOutcome::Pass;
        result.message = Some(match result.scan_id {
            Some(scan_id) => format!(
                "{} commands, {} events, scan {scan_id}",
                summary.commands, summary.events
            ),
            None => format!("{} commands, {} events", summary.commands, summary.events),
        });
        result.elapsed = started.elapsed();
        Attempt::done(result)
    }

    /// Target must not be known-bad; unprobed targets get a bounded live check
    async fn ensure_connected(&self, device: &DeviceHandle) -> Result<(), String> {
        match device.connection_state() {
            ConnectionState::Connected => Ok(()),
            state @ (ConnectionState::Disconnected | ConnectionState::Error) => {
                Err(format!("device '{}' is {state}", device.id()))
            }
            ConnectionState::Unknown => {
                let connected = timeout(self.check_timeout, device.readable().is_connected())
                    .await
                    .unwrap_or(false);
                if connected {
                    device.set_connection_state(ConnectionState::Connected);
                    Ok(())
                } else {
                    device.set_connection_state(ConnectionState::Disconnected);
                    Err(format!("device '{}' is not connected", device.id()))
                }
            }
        }
    }

    async fn positions(
        &self,
        movers: &[Arc<DeviceHandle>],
    ) -> Result<BTreeMap<DeviceId, f64>, String> {
        let mut positions = BTreeMap::new();
        for device in movers {
            let Some(motor) = device.movable() else {
                continue;
            };
            let position = match timeout(self.check_timeout, motor.position()).await {
                Ok(Ok(position)) => position,
                Ok(Err(e)) => {
                    return Err(format!("reading position of '{}': {e:#}", device.id()))
                }
                Err(_) => {
                    return Err(format!(
                        "reading position of '{}' timed out after {:?}",
                        device.id(),
                        self.check_timeout
                    ))
                }
            };
            positions.insert(device.id().to_string(), position);
        }
        Ok(positions)
    }

    fn verify_record(&self, result: &mut PlanResult) -> Result<(), String> {
        if result.records_delta == Some(0) {
            return Err("no new runs found in catalog".to_string());
        }
        let latest = self
            .catalog
            .latest()
            .ok_or_else(|| "catalog has no latest run".to_string())?;
        result.scan_id = Some(latest.scan_id);
        result.data_keys = latest.data_keys.iter().cloned().collect();
        if latest.data_keys.is_empty() {
            return Err(format!("run {} recorded no data keys", latest.scan_id));
        }
        Ok(())
    }
}

fn return_mismatch(
    before: &BTreeMap<DeviceId, f64>,
    after: &BTreeMap<DeviceId, f64>,
    tolerance: f64,
) -> Option<String> {
    before.iter().find_map(|(id, start)| {
        let end = after.get(id)?;
        let drift = (end - start).abs();
        (drift > tolerance).then(|| {
            format!("'{id}' did not return: started at {start}, ended at {end} (tolerance {tolerance})")
        })
    })
}
