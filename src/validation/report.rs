//! Results and aggregation
//!
//! Probe and plan outcomes are plain data. The [`ResultAggregator`] files them
//! into per-suite [`SuiteReport`]s whose counters are updated together with the
//! append and re-verified after every mutation; a mismatch is an engine defect
//! and surfaces as [`ValidationError::AggregationInvariant`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EmptySuitePolicy;
use crate::error::{AppResult, ValidationError};
use crate::hardware::registry::{ConnectionState, DeviceId};

/// Share of passing items at which a failing run is still "minor issues"
pub const MINOR_ISSUES_THRESHOLD: f64 = 0.8;

// =============================================================================
// Outcomes
// =============================================================================

/// Connectivity probe classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// Read returned a value
    Pass,
    /// Device unreachable, timed out or answered without a value
    Fail,
    /// Backend fault
    Error,
}

/// Plan execution classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    /// Completed and all checks held
    Pass,
    /// Engine fault, timeout or a failed check
    Fail,
    /// A target was absent or not connected; the engine was not called
    Skipped,
}

/// Outcome of any recorded item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Passed
    Pass,
    /// Failed
    Fail,
    /// Errored
    Error,
    /// Not attempted
    Skipped,
}

impl From<ProbeOutcome> for Outcome {
    fn from(outcome: ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::Pass => Outcome::Pass,
            ProbeOutcome::Fail => Outcome::Fail,
            ProbeOutcome::Error => Outcome::Error,
        }
    }
}

impl From<PlanOutcome> for Outcome {
    fn from(outcome: PlanOutcome) -> Self {
        match outcome {
            PlanOutcome::Pass => Outcome::Pass,
            PlanOutcome::Fail => Outcome::Fail,
            PlanOutcome::Skipped => Outcome::Skipped,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Error => "error",
            Outcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Results
// =============================================================================

/// Result of one connectivity probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Probed device
    pub device_id: DeviceId,
    /// Classification
    pub outcome: ProbeOutcome,
    /// Value read, when there was one
    pub value: Option<Value>,
    /// Failure or error message
    pub message: Option<String>,
    /// Connection state cached on the device
    pub state: ConnectionState,
    /// Wall time of the final attempt
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Attempts made, including the first
    pub attempts: u32,
}

/// Result of one plan execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// Plan name
    pub plan: String,
    /// Plan kind
    pub plan_type: String,
    /// Classification
    pub outcome: PlanOutcome,
    /// Failure reason, skip reason or completion summary
    pub message: Option<String>,
    /// Mover positions before submission
    pub before: Option<BTreeMap<DeviceId, f64>>,
    /// Mover positions after completion
    pub after: Option<BTreeMap<DeviceId, f64>>,
    /// Catalog records added by the plan
    pub records_delta: Option<usize>,
    /// Scan id of the latest record
    pub scan_id: Option<u64>,
    /// Data keys of the latest record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_keys: Vec<String>,
    /// Whether the engine ran in simulation mode
    pub simulated: bool,
    /// Wall time of the final attempt
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Attempts made, including the first
    pub attempts: u32,
}

impl PlanResult {
    /// Result carrying only an outcome and message
    pub fn new(
        plan: impl Into<String>,
        plan_type: impl Into<String>,
        outcome: PlanOutcome,
        message: impl Into<String>,
    ) -> Self {
        Self {
            plan: plan.into(),
            plan_type: plan_type.into(),
            outcome,
            message: Some(message.into()),
            before: None,
            after: None,
            records_delta: None,
            scan_id: None,
            data_keys: Vec::new(),
            simulated: false,
            elapsed: Duration::ZERO,
            attempts: 1,
        }
    }
}

/// A suite-level error: an unknown label or a fault inside the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    /// What could not be checked (label, device or plan name)
    pub subject: String,
    /// Error message
    pub message: String,
}

impl ErrorResult {
    /// Build an error entry
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Any item recorded in a suite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckResult {
    /// Connectivity probe
    Probe(ProbeResult),
    /// Plan execution
    Plan(PlanResult),
    /// Suite-level error
    Error(ErrorResult),
}

impl CheckResult {
    /// Unified outcome
    pub fn outcome(&self) -> Outcome {
        match self {
            CheckResult::Probe(r) => r.outcome.into(),
            CheckResult::Plan(r) => r.outcome.into(),
            CheckResult::Error(_) => Outcome::Error,
        }
    }

    /// Whether the item passed
    pub fn is_pass(&self) -> bool {
        self.outcome() == Outcome::Pass
    }

    /// Device, plan or label the item is about
    pub fn subject(&self) -> &str {
        match self {
            CheckResult::Probe(r) => &r.device_id,
            CheckResult::Plan(r) => &r.plan,
            CheckResult::Error(r) => &r.subject,
        }
    }

    /// Message, if any
    pub fn message(&self) -> Option<&str> {
        match self {
            CheckResult::Probe(r) => r.message.as_deref(),
            CheckResult::Plan(r) => r.message.as_deref(),
            CheckResult::Error(r) => Some(&r.message),
        }
    }
}

impl From<ProbeResult> for CheckResult {
    fn from(result: ProbeResult) -> Self {
        CheckResult::Probe(result)
    }
}

impl From<PlanResult> for CheckResult {
    fn from(result: PlanResult) -> Self {
        CheckResult::Plan(result)
    }
}

impl From<ErrorResult> for CheckResult {
    fn from(result: ErrorResult) -> Self {
        CheckResult::Error(result)
    }
}

// =============================================================================
// SuiteReport
// =============================================================================

/// Ordered results of one suite with derived counts
///
/// `passed` and `total` only change inside [`push`](SuiteReport::push), in the
/// same step as the append.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteReport {
    name: String,
    passed: usize,
    total: usize,
    results: Vec<CheckResult>,
}

impl SuiteReport {
    /// Empty suite
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: 0,
            total: 0,
            results: Vec::new(),
        }
    }

    /// Suite name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Results in recording order
    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    /// Items that passed
    pub fn passed_count(&self) -> usize {
        self.passed
    }

    /// Items recorded
    pub fn total_count(&self) -> usize {
        self.total
    }

    /// Items that did not pass (fail, error or skipped)
    pub fn failed_count(&self) -> usize {
        self.total - self.passed
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Whether every recorded item passed (true for an empty suite)
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    fn push(&mut self, result: CheckResult) {
        if result.is_pass() {
            self.passed += 1;
        }
        self.total += 1;
        self.results.push(result);
    }

    /// Recount from the stored results and compare with the counters
    pub fn check_invariant(&self) -> AppResult<()> {
        let recounted_total = self.results.len();
        let recounted_passed = self.results.iter().filter(|r| r.is_pass()).count();
        if recounted_passed != self.passed || recounted_total != self.total {
            return Err(ValidationError::AggregationInvariant {
                suite: self.name.clone(),
                passed: self.passed,
                total: self.total,
                recounted_passed,
                recounted_total,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&mut self) {
        self.passed += 1;
    }
}

// =============================================================================
// ResultAggregator
// =============================================================================

/// Accumulates results into suites in the order suites are begun
#[derive(Debug, Default)]
pub struct ResultAggregator {
    suites: Mutex<Vec<SuiteReport>>,
}

impl ResultAggregator {
    /// Empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `suite` is reported even if nothing gets recorded in it
    pub fn begin_suite(&self, suite: &str) {
        let mut suites = self.suites.lock();
        if !suites.iter().any(|s| s.name == suite) {
            suites.push(SuiteReport::new(suite));
        }
    }

    /// Append `result` to `suite`, creating the suite if needed
    ///
    /// # Errors
    /// `AggregationInvariant` if the suite counts disagree with its results
    /// after the append.
    pub fn record(&self, suite: &str, result: impl Into<CheckResult>) -> AppResult<()> {
        let result = result.into();
        let mut suites = self.suites.lock();
        let idx = match suites.iter().position(|s| s.name == suite) {
            Some(idx) => idx,
            None => {
                suites.push(SuiteReport::new(suite));
                suites.len() - 1
            }
        };
        let report = &mut suites[idx];
        debug!(
            suite,
            subject = result.subject(),
            outcome = %result.outcome(),
            "Recording result"
        );
        report.push(result);
        report.check_invariant()
    }

    /// Record several results in order, stopping at the first invariant violation
    pub fn record_all(
        &self,
        suite: &str,
        results: impl IntoIterator<Item = CheckResult>,
    ) -> AppResult<()> {
        for result in results {
            self.record(suite, result)?;
        }
        Ok(())
    }

    /// Snapshot of every suite in the order they were begun
    pub fn summarize(&self) -> Vec<SuiteReport> {
        self.suites.lock().clone()
    }

    /// Snapshot of one suite
    pub fn suite(&self, name: &str) -> Option<SuiteReport> {
        self.suites.lock().iter().find(|s| s.name == name).cloned()
    }

    /// True iff every suite passed all of its items
    ///
    /// An empty suite passes under [`EmptySuitePolicy::Warn`] and fails under
    /// [`EmptySuitePolicy::Fail`].
    pub fn overall_passed(&self, policy: EmptySuitePolicy) -> bool {
        self.suites.lock().iter().all(|s| {
            if s.is_empty() {
                policy == EmptySuitePolicy::Warn
            } else {
                s.all_passed()
            }
        })
    }

    /// Build the final report
    pub fn finish(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        policy: EmptySuitePolicy,
    ) -> ValidationReport {
        let suites = self.summarize();
        let overall_passed = self.overall_passed(policy);
        let passed = suites.iter().map(SuiteReport::passed_count).sum();
        let total = suites.iter().map(SuiteReport::total_count).sum();
        let warnings: Vec<String> = suites
            .iter()
            .filter(|s| s.is_empty())
            .map(|s| match policy {
                EmptySuitePolicy::Warn => format!(
                    "suite '{}' had nothing to check (reported, not counted as a failure)",
                    s.name
                ),
                EmptySuitePolicy::Fail => {
                    format!("suite '{}' had nothing to check (counted as a failure)", s.name)
                }
            })
            .collect();
        for warning in &warnings {
            warn!("{warning}");
        }

        ValidationReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            verdict: Verdict::from_counts(overall_passed, passed, total),
            suites,
            overall_passed,
            passed,
            total,
            warnings,
        }
    }
}

// =============================================================================
// ValidationReport
// =============================================================================

/// Overall recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every check passed
    AllPassed,
    /// At least 80% of checks passed
    MinorIssues,
    /// Fewer than 80% of checks passed
    NeedsAttention,
}

impl Verdict {
    /// Classify a run
    pub fn from_counts(overall_passed: bool, passed: usize, total: usize) -> Self {
        if overall_passed {
            return Verdict::AllPassed;
        }
        if total > 0 && passed as f64 / total as f64 >= MINOR_ISSUES_THRESHOLD {
            Verdict::MinorIssues
        } else {
            Verdict::NeedsAttention
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Verdict::AllPassed => "all checks passed, the setup is ready",
            Verdict::MinorIssues => "minor issues, most components work",
            Verdict::NeedsAttention => "significant issues, the setup needs attention",
        }
    }
}

/// Final report of a validation run
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Run identifier
    pub run_id: Uuid,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// Suites in execution order
    pub suites: Vec<SuiteReport>,
    /// Gate for the exit code
    pub overall_passed: bool,
    /// Passed items across suites
    pub passed: usize,
    /// Items across suites
    pub total: usize,
    /// Empty-suite warnings
    pub warnings: Vec<String>,
    /// Recommendation
    pub verdict: Verdict,
}

impl ValidationReport {
    /// Suite by name
    pub fn suite(&self, name: &str) -> Option<&SuiteReport> {
        self.suites.iter().find(|s| s.name() == name)
    }

    /// Pretty JSON rendering
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Validation report (run {})", self.run_id)?;
        writeln!(f, "{}", "=".repeat(60))?;
        for suite in &self.suites {
            let mark = if suite.is_empty() {
                "⚠️ "
            } else if suite.all_passed() {
                "✅"
            } else {
                "❌"
            };
            writeln!(
                f,
                "{mark} {}: {}/{} passed",
                suite.name(),
                suite.passed_count(),
                suite.total_count()
            )?;
            for result in suite.results().iter().filter(|r| !r.is_pass()) {
                write!(f, "     - {} [{}]", result.subject(), result.outcome())?;
                match result.message() {
                    Some(message) => writeln!(f, ": {message}")?,
                    None => writeln!(f)?,
                }
            }
        }
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Total: {}/{} checks passed", self.passed, self.total)?;
        for warning in &self.warnings {
            writeln!(f, "⚠️  {warning}")?;
        }
        let icon = if self.overall_passed { "🎉" } else { "❌" };
        write!(f, "{icon} {}", self.verdict.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(id: &str, outcome: ProbeOutcome) -> ProbeResult {
        ProbeResult {
            device_id: id.to_string(),
            outcome,
            value: None,
            message: None,
            state: ConnectionState::Unknown,
            elapsed: Duration::ZERO,
            attempts: 1,
        }
    }

    #[test]
    fn counts_follow_every_record() {
        let agg = ResultAggregator::new();
        agg.record("connectivity", probe("m1", ProbeOutcome::Pass))
            .unwrap();
        agg.record("connectivity", probe("m2", ProbeOutcome::Fail))
            .unwrap();
        agg.record("connectivity", ErrorResult::new("m3", "boom"))
            .unwrap();

        let suite = agg.suite("connectivity").unwrap();
        assert_eq!(suite.passed_count(), 1);
        assert_eq!(suite.total_count(), 3);
        assert_eq!(suite.failed_count(), 2);
        assert!(suite.check_invariant().is_ok());
    }

    #[test]
    fn skipped_plans_count_against_the_suite() {
        let agg = ResultAggregator::new();
        agg.record(
            "operations",
            PlanResult::new("count", "count", PlanOutcome::Skipped, "no detector"),
        )
        .unwrap();
        assert!(!agg.overall_passed(EmptySuitePolicy::Warn));
    }

    #[test]
    fn empty_suite_follows_policy() {
        let agg = ResultAggregator::new();
        agg.begin_suite("connectivity");
        agg.record("connectivity", probe("m1", ProbeOutcome::Pass))
            .unwrap();
        agg.begin_suite("data_collection");

        assert!(agg.overall_passed(EmptySuitePolicy::Warn));
        assert!(!agg.overall_passed(EmptySuitePolicy::Fail));

        let report = agg.finish(Uuid::new_v4(), Utc::now(), EmptySuitePolicy::Warn);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("data_collection"));
        assert_eq!(report.verdict, Verdict::AllPassed);
    }

    #[test]
    fn corrupted_counts_are_detected() {
        let mut suite = SuiteReport::new("connectivity");
        suite.push(probe("m1", ProbeOutcome::Pass).into());
        suite.corrupt_for_test();
        let err = suite.check_invariant().unwrap_err();
        assert!(err.is_engine_fault());
    }

    #[test]
    fn verdict_tiers() {
        assert_eq!(Verdict::from_counts(true, 10, 10), Verdict::AllPassed);
        assert_eq!(Verdict::from_counts(false, 8, 10), Verdict::MinorIssues);
        assert_eq!(Verdict::from_counts(false, 7, 10), Verdict::NeedsAttention);
        assert_eq!(Verdict::from_counts(false, 0, 0), Verdict::NeedsAttention);
    }

    #[test]
    fn report_renders_failures_and_json() {
        let agg = ResultAggregator::new();
        agg.record("connectivity", probe("m1", ProbeOutcome::Pass))
            .unwrap();
        let mut failed = probe("m3", ProbeOutcome::Fail);
        failed.message = Some("read timed out after 2s".into());
        agg.record("connectivity", failed).unwrap();

        let report = agg.finish(Uuid::new_v4(), Utc::now(), EmptySuitePolicy::Warn);
        let text = report.to_string();
        assert!(text.contains("connectivity: 1/2 passed"));
        assert!(text.contains("m3 [fail]: read timed out after 2s"));

        let json: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["overall_passed"], Value::Bool(false));
        assert_eq!(json["suites"][0]["results"][1]["kind"], "probe");
        assert_eq!(json["suites"][0]["total"], 2);
    }
}
