//! Plan system for validation operations
//!
//! Plans are declarative generators that yield commands for the execution engine.
//! A plan never touches hardware itself; it describes what should happen and the
//! engine drives the devices.
//!
//! # Plan Commands
//!
//! Plans yield a sequence of `PlanCommand` values:
//! - `MoveTo` / `MoveRelative` - Move a device
//! - `Read` - Read a value from a device
//! - `Trigger` - Trigger a detector acquisition
//! - `Wait` - Wait for a duration
//! - `Checkpoint` - Mark a safe point (cancellation is honoured between commands)
//! - `EmitEvent` - Record the current readings as one event of the run
//! - `MoveToPeak` - Move an axis to where a detector peaked since the last peak move
//!
//! # Plan Descriptions
//!
//! Callers describe operations with a [`PlanSpec`]. The engine resolves the spec
//! into a concrete generator (`Count`, `LineScan`, `RelativeMove`, `PeakSearch`)
//! once device positions and limits are known.
//!
//! ```rust,ignore
//! let spec = PlanSpec::new("count", PlanKind::Count { num: 1, delay: Duration::ZERO })
//!     .with_detectors(&["scaler1"])
//!     .expect_record();
//!
//! // Resolves to:
//! // Checkpoint
//! // Trigger("scaler1")
//! // Read("scaler1")
//! // EmitEvent
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error_recovery::RetryPolicy;
use crate::hardware::registry::DeviceId;

/// Commands that plans yield for the engine to execute
#[derive(Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Move a device to an absolute position
    MoveTo {
        /// Device ID to move
        device_id: String,
        /// Target position
        position: f64,
    },
    /// Move a device relative to where it is
    MoveRelative {
        /// Device ID to move
        device_id: String,
        /// Signed distance
        delta: f64,
    },
    /// Read a value from a device
    Read {
        /// Device to read
        device_id: String,
    },
    /// Trigger a device (e.g., start an acquisition)
    Trigger {
        /// Device to trigger
        device_id: String,
    },
    /// Wait for a duration in seconds
    Wait {
        /// Duration in seconds
        seconds: f64,
    },
    /// Checkpoint - safe point for cancellation
    Checkpoint {
        /// Checkpoint label
        label: String,
    },
    /// Emit an event with the readings collected since the previous event
    EmitEvent {
        /// Stream name (e.g., "primary")
        stream: String,
    },
    /// Move `device_id` to the position at which `detector_id` read highest
    MoveToPeak {
        /// Axis to move
        device_id: String,
        /// Detector whose readings define the peak
        detector_id: String,
    },
}

/// Plan trait - all plans implement this to generate commands
pub trait Plan: Send + Sync {
    /// Plan type identifier (e.g., "line_scan", "count")
    fn plan_type(&self) -> &str;

    /// Plan arguments for logging
    fn plan_args(&self) -> HashMap<String, String>;

    /// Whether executing the plan opens a run in the catalog
    fn opens_run(&self) -> bool {
        true
    }

    /// Generate the next command, returning None when complete
    fn next_command(&mut self) -> Option<PlanCommand>;
}

fn linspace(start: f64, stop: f64, points: usize, idx: usize) -> f64 {
    if points <= 1 {
        start
    } else {
        let step = (stop - start) / (points - 1) as f64;
        start + step * idx as f64
    }
}

// =============================================================================
// Count
// =============================================================================

/// Count plan - take N readings at the current position
#[derive(Debug, Clone)]
pub struct Count {
    num_points: usize,
    delay: f64,
    detectors: Vec<String>,
    current_point: usize,
    current_step: CountStep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CountStep {
    Checkpoint,
    Trigger { detector_idx: usize },
    Read { detector_idx: usize },
    Emit,
    Wait,
}

impl Count {
    /// Create a new Count plan
    pub fn new(num_points: usize) -> Self {
        Self {
            num_points,
            delay: 0.0,
            detectors: Vec::new(),
            current_point: 0,
            current_step: CountStep::Checkpoint,
        }
    }

    /// Add detectors to the count
    pub fn with_detectors(mut self, detectors: &[String]) -> Self {
        self.detectors.extend(detectors.iter().cloned());
        self
    }

    /// Set delay between points in seconds
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = seconds;
        self
    }
}

impl Plan for Count {
    fn plan_type(&self) -> &str {
        "count"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert("num_points".to_string(), self.num_points.to_string());
        args.insert("delay".to_string(), self.delay.to_string());
        args.insert("detectors".to_string(), self.detectors.join(","));
        args
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        if self.current_point >= self.num_points {
            return None;
        }

        let cmd = match self.current_step {
            CountStep::Checkpoint => {
                self.current_step = CountStep::Trigger { detector_idx: 0 };
                PlanCommand::Checkpoint {
                    label: format!("count_{}", self.current_point),
                }
            }
            CountStep::Trigger { detector_idx } => match self.detectors.get(detector_idx) {
                Some(det) => {
                    self.current_step = CountStep::Trigger {
                        detector_idx: detector_idx + 1,
                    };
                    PlanCommand::Trigger {
                        device_id: det.clone(),
                    }
                }
                None => {
                    self.current_step = CountStep::Read { detector_idx: 0 };
                    return self.next_command();
                }
            },
            CountStep::Read { detector_idx } => match self.detectors.get(detector_idx) {
                Some(det) => {
                    self.current_step = CountStep::Read {
                        detector_idx: detector_idx + 1,
                    };
                    PlanCommand::Read {
                        device_id: det.clone(),
                    }
                }
                None => {
                    self.current_step = CountStep::Emit;
                    return self.next_command();
                }
            },
            CountStep::Emit => {
                self.current_point += 1;
                self.current_step = if self.delay > 0.0 && self.current_point < self.num_points {
                    CountStep::Wait
                } else {
                    CountStep::Checkpoint
                };
                PlanCommand::EmitEvent {
                    stream: "primary".to_string(),
                }
            }
            CountStep::Wait => {
                self.current_step = CountStep::Checkpoint;
                PlanCommand::Wait {
                    seconds: self.delay,
                }
            }
        };

        Some(cmd)
    }
}

// =============================================================================
// LineScan
// =============================================================================

/// Line scan - scan a single axis with one or more detectors
///
/// With [`returning_to`](LineScan::returning_to) the axis is moved back to the
/// given position after the last point (relative scans).
#[derive(Debug, Clone)]
pub struct LineScan {
    axis: String,
    start: f64,
    stop: f64,
    num_points: usize,
    detectors: Vec<String>,
    settle_time: f64,
    return_to: Option<f64>,

    // Execution state
    current_point: usize,
    current_step: LineScanStep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LineScanStep {
    Move,
    Settle,
    Checkpoint,
    Trigger { detector_idx: usize },
    Read { detector_idx: usize },
    EmitEvent,
    Return,
    Done,
}

impl LineScan {
    /// Create a new LineScan
    pub fn new(axis: &str, start: f64, stop: f64, num_points: usize) -> Self {
        Self {
            axis: axis.to_string(),
            start,
            stop,
            num_points,
            detectors: Vec::new(),
            settle_time: 0.0,
            return_to: None,
            current_point: 0,
            current_step: LineScanStep::Move,
        }
    }

    /// Add detectors to the scan
    pub fn with_detectors(mut self, detectors: &[String]) -> Self {
        self.detectors.extend(detectors.iter().cloned());
        self
    }

    /// Set settle time in seconds
    pub fn with_settle_time(mut self, seconds: f64) -> Self {
        self.settle_time = seconds;
        self
    }

    /// Move the axis back to `position` when the scan completes
    pub fn returning_to(mut self, position: f64) -> Self {
        self.return_to = Some(position);
        self
    }

    fn position_at(&self, point: usize) -> f64 {
        linspace(self.start, self.stop, self.num_points, point)
    }
}

impl Plan for LineScan {
    fn plan_type(&self) -> &str {
        "line_scan"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert("axis".to_string(), self.axis.clone());
        args.insert("start".to_string(), self.start.to_string());
        args.insert("stop".to_string(), self.stop.to_string());
        args.insert("num_points".to_string(), self.num_points.to_string());
        args.insert("detectors".to_string(), self.detectors.join(","));
        args
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        if self.current_point >= self.num_points
            && !matches!(self.current_step, LineScanStep::Return)
        {
            return None;
        }

        let cmd = match self.current_step {
            LineScanStep::Move => {
                let pos = self.position_at(self.current_point);
                self.current_step = if self.settle_time > 0.0 {
                    LineScanStep::Settle
                } else {
                    LineScanStep::Checkpoint
                };
                PlanCommand::MoveTo {
                    device_id: self.axis.clone(),
                    position: pos,
                }
            }
            LineScanStep::Settle => {
                self.current_step = LineScanStep::Checkpoint;
                PlanCommand::Wait {
                    seconds: self.settle_time,
                }
            }
            LineScanStep::Checkpoint => {
                self.current_step = LineScanStep::Trigger { detector_idx: 0 };
                PlanCommand::Checkpoint {
                    label: format!("point_{}", self.current_point),
                }
            }
            LineScanStep::Trigger { detector_idx } => match self.detectors.get(detector_idx) {
                Some(det) => {
                    self.current_step = LineScanStep::Trigger {
                        detector_idx: detector_idx + 1,
                    };
                    PlanCommand::Trigger {
                        device_id: det.clone(),
                    }
                }
                None => {
                    self.current_step = LineScanStep::Read { detector_idx: 0 };
                    return self.next_command();
                }
            },
            LineScanStep::Read { detector_idx } => match self.detectors.get(detector_idx) {
                Some(det) => {
                    self.current_step = LineScanStep::Read {
                        detector_idx: detector_idx + 1,
                    };
                    PlanCommand::Read {
                        device_id: det.clone(),
                    }
                }
                None => {
                    self.current_step = LineScanStep::EmitEvent;
                    return self.next_command();
                }
            },
            LineScanStep::EmitEvent => {
                self.current_point += 1;
                self.current_step = if self.current_point < self.num_points {
                    LineScanStep::Move
                } else if self.return_to.is_some() {
                    LineScanStep::Return
                } else {
                    LineScanStep::Done
                };
                PlanCommand::EmitEvent {
                    stream: "primary".to_string(),
                }
            }
            LineScanStep::Return => {
                self.current_step = LineScanStep::Done;
                PlanCommand::MoveTo {
                    device_id: self.axis.clone(),
                    position: self.return_to?,
                }
            }
            LineScanStep::Done => return None,
        };

        Some(cmd)
    }
}

// =============================================================================
// RelativeMove
// =============================================================================

/// Relative move of each mover, optionally undone afterwards (round trip)
///
/// Does not open a run.
#[derive(Debug, Clone)]
pub struct RelativeMove {
    movers: Vec<String>,
    delta: f64,
    round_trip: bool,
    commands: Vec<PlanCommand>,
    cursor: usize,
}

impl RelativeMove {
    /// Move every mover by `delta`
    pub fn new(movers: &[String], delta: f64) -> Self {
        Self::build(movers, delta, false)
    }

    /// Move every mover by `+delta`, read it, then move it by `-delta`
    pub fn round_trip(movers: &[String], delta: f64) -> Self {
        Self::build(movers, delta, true)
    }

    fn build(movers: &[String], delta: f64, round_trip: bool) -> Self {
        let mut commands = Vec::new();
        for mover in movers {
            commands.push(PlanCommand::MoveRelative {
                device_id: mover.clone(),
                delta,
            });
            if round_trip {
                commands.push(PlanCommand::Read {
                    device_id: mover.clone(),
                });
                commands.push(PlanCommand::Checkpoint {
                    label: format!("{mover}_out"),
                });
                commands.push(PlanCommand::MoveRelative {
                    device_id: mover.clone(),
                    delta: -delta,
                });
            }
        }
        Self {
            movers: movers.to_vec(),
            delta,
            round_trip,
            commands,
            cursor: 0,
        }
    }
}

impl Plan for RelativeMove {
    fn plan_type(&self) -> &str {
        if self.round_trip {
            "round_trip"
        } else {
            "move_relative"
        }
    }

    fn plan_args(&self) -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert("movers".to_string(), self.movers.join(","));
        args.insert("delta".to_string(), self.delta.to_string());
        args
    }

    fn opens_run(&self) -> bool {
        false
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        let cmd = self.commands.get(self.cursor).cloned();
        self.cursor += 1;
        cmd
    }
}

// =============================================================================
// PeakSearch
// =============================================================================

/// Peak search - step each axis across a window around where it is, then move
/// it to the detector peak
///
/// Used for detector optimisation (several cycles, halving the window each
/// time) and sample alignment (one cycle per axis). Steps are relative, so the
/// window follows the axis after each peak move. Commands are produced one at
/// a time; nothing is precomputed.
#[derive(Debug, Clone)]
pub struct PeakSearch {
    axes: Vec<String>,
    detector: String,
    initial_range: f64,
    points: usize,
    cycles: usize,

    // Execution state
    axis_idx: usize,
    cycle: usize,
    point: usize,
    range: f64,
    current_step: PeakStep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PeakStep {
    Enter,
    Step,
    Checkpoint,
    Trigger,
    Read,
    Emit,
    Peak,
}

impl PeakSearch {
    /// Create a search over `[-range, +range]` for each axis
    pub fn new(axes: &[String], detector: &str, range: f64, points: usize, cycles: usize) -> Self {
        Self {
            axes: axes.to_vec(),
            detector: detector.to_string(),
            initial_range: range,
            points: points.max(2),
            cycles: cycles.max(1),
            axis_idx: 0,
            cycle: 0,
            point: 0,
            range,
            current_step: PeakStep::Enter,
        }
    }

    /// Move on to the next cycle, or the next axis after the last cycle
    fn finish_cycle(&mut self) {
        self.point = 0;
        self.cycle += 1;
        self.range /= 2.0;
        if self.cycle >= self.cycles {
            self.cycle = 0;
            self.axis_idx += 1;
            self.range = self.initial_range;
        }
        self.current_step = PeakStep::Enter;
    }
}

impl Plan for PeakSearch {
    fn plan_type(&self) -> &str {
        "peak_search"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert("axes".to_string(), self.axes.join(","));
        args.insert("detector".to_string(), self.detector.clone());
        args.insert("initial_range".to_string(), self.initial_range.to_string());
        args.insert("points".to_string(), self.points.to_string());
        args.insert("cycles".to_string(), self.cycles.to_string());
        args
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        let axis = self.axes.get(self.axis_idx)?.clone();

        let cmd = match self.current_step {
            PeakStep::Enter => {
                self.current_step = PeakStep::Checkpoint;
                PlanCommand::MoveRelative {
                    device_id: axis,
                    delta: -self.range,
                }
            }
            PeakStep::Step => {
                self.current_step = PeakStep::Checkpoint;
                PlanCommand::MoveRelative {
                    device_id: axis,
                    delta: 2.0 * self.range / (self.points - 1) as f64,
                }
            }
            PeakStep::Checkpoint => {
                self.current_step = PeakStep::Trigger;
                PlanCommand::Checkpoint {
                    label: format!("{axis}_cycle{}_point{}", self.cycle, self.point),
                }
            }
            PeakStep::Trigger => {
                self.current_step = PeakStep::Read;
                PlanCommand::Trigger {
                    device_id: self.detector.clone(),
                }
            }
            PeakStep::Read => {
                self.current_step = PeakStep::Emit;
                PlanCommand::Read {
                    device_id: self.detector.clone(),
                }
            }
            PeakStep::Emit => {
                self.point += 1;
                self.current_step = if self.point < self.points {
                    PeakStep::Step
                } else {
                    PeakStep::Peak
                };
                PlanCommand::EmitEvent {
                    stream: "primary".to_string(),
                }
            }
            PeakStep::Peak => {
                self.finish_cycle();
                PlanCommand::MoveToPeak {
                    device_id: axis,
                    detector_id: self.detector.clone(),
                }
            }
        };

        Some(cmd)
    }
}

// =============================================================================
// PlanSpec
// =============================================================================

fn default_num() -> usize {
    1
}

fn default_points() -> usize {
    5
}

fn default_plan_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Upper bound on readings or scan points per plan
pub const MAX_PLAN_POINTS: usize = 10_000;

/// Upper bound on detector optimisation refinement cycles
pub const MAX_REFINEMENT_CYCLES: usize = 16;

fn check_points(what: &str, points: usize) -> Result<(), String> {
    if points > MAX_PLAN_POINTS {
        return Err(format!("{what} is {points}, limit is {MAX_PLAN_POINTS}"));
    }
    Ok(())
}

fn check_finite(what: &str, value: f64) -> Result<(), String> {
    if !value.is_finite() {
        return Err(format!("{what} must be finite, got {value}"));
    }
    Ok(())
}

/// Parameterised operation kinds
///
/// Distances are in the movers' engineering units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanKind {
    /// Trigger and read each detector `num` times, `delay` apart. Opens a run.
    Count {
        /// Number of readings
        #[serde(default = "default_num")]
        num: usize,
        /// Pause between readings
        #[serde(default, with = "humantime_serde")]
        delay: Duration,
    },
    /// Move each mover by `delta`. No run.
    MoveRelative {
        /// Signed distance
        delta: f64,
    },
    /// Move each mover by `+delta`, read it, move it back. No run.
    RoundTrip {
        /// Signed distance
        delta: f64,
    },
    /// Absolute line scan of the first mover. Opens a run.
    Scan {
        /// First position
        start: f64,
        /// Last position
        stop: f64,
        /// Number of points
        #[serde(default = "default_points")]
        points: usize,
    },
    /// Line scan relative to the current position, returning there afterwards.
    RelativeScan {
        /// First offset
        start: f64,
        /// Last offset
        stop: f64,
        /// Number of points
        #[serde(default = "default_points")]
        points: usize,
    },
    /// Relative scan over `[-range, +range]`.
    QuickScan {
        /// Half-width of the scan
        range: f64,
        /// Number of points
        #[serde(default = "default_points")]
        points: usize,
    },
    /// Scan `range_fraction` of the limit span, centred on the current position
    /// and clamped to the limits.
    MotorCharacterization {
        /// Fraction of `high - low` to cover
        range_fraction: f64,
        /// Number of points
        #[serde(default = "default_points")]
        points: usize,
    },
    /// Relative scan, move to the detector peak, repeat with half the range.
    DetectorOptimization {
        /// Half-width of the first scan
        initial_range: f64,
        /// Number of scan + peak cycles
        refinement_cycles: usize,
        /// Points per scan
        #[serde(default = "default_points")]
        points: usize,
    },
    /// Scan each mover in turn over `[-scan_range, +scan_range]` and move it to
    /// the detector peak.
    SampleAlignment {
        /// Half-width of each scan
        scan_range: f64,
        /// Distance between points
        step_size: f64,
    },
}

impl PlanKind {
    /// Snake-case type name
    pub fn type_name(&self) -> &'static str {
        match self {
            PlanKind::Count { .. } => "count",
            PlanKind::MoveRelative { .. } => "move_relative",
            PlanKind::RoundTrip { .. } => "round_trip",
            PlanKind::Scan { .. } => "scan",
            PlanKind::RelativeScan { .. } => "relative_scan",
            PlanKind::QuickScan { .. } => "quick_scan",
            PlanKind::MotorCharacterization { .. } => "motor_characterization",
            PlanKind::DetectorOptimization { .. } => "detector_optimization",
            PlanKind::SampleAlignment { .. } => "sample_alignment",
        }
    }

    /// Whether a successful execution appends a record to the catalog
    pub fn opens_run(&self) -> bool {
        !matches!(self, PlanKind::MoveRelative { .. } | PlanKind::RoundTrip { .. })
    }

    /// Minimum number of movers the operation needs
    pub fn required_movers(&self) -> usize {
        match self {
            PlanKind::Count { .. } => 0,
            PlanKind::SampleAlignment { .. } => 2,
            _ => 1,
        }
    }

    /// Reject parameters that would produce an unbounded or degenerate plan
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PlanKind::Count { num, .. } => check_points("num", *num),
            PlanKind::MoveRelative { delta } | PlanKind::RoundTrip { delta } => {
                check_finite("delta", *delta)
            }
            PlanKind::Scan {
                start,
                stop,
                points,
            }
            | PlanKind::RelativeScan {
                start,
                stop,
                points,
            } => {
                check_finite("start", *start)?;
                check_finite("stop", *stop)?;
                check_points("points", *points)
            }
            PlanKind::QuickScan { range, points } => {
                check_finite("range", *range)?;
                check_points("points", *points)
            }
            PlanKind::MotorCharacterization {
                range_fraction,
                points,
            } => {
                check_finite("range_fraction", *range_fraction)?;
                check_points("points", *points)
            }
            PlanKind::DetectorOptimization {
                initial_range,
                refinement_cycles,
                points,
            } => {
                check_finite("initial_range", *initial_range)?;
                check_points("points", *points)?;
                if *refinement_cycles > MAX_REFINEMENT_CYCLES {
                    return Err(format!(
                        "refinement_cycles is {refinement_cycles}, limit is {MAX_REFINEMENT_CYCLES}"
                    ));
                }
                Ok(())
            }
            PlanKind::SampleAlignment {
                scan_range,
                step_size,
            } => alignment_points(*scan_range, *step_size).map(|_| ()),
        }
    }

    /// Minimum number of detectors the operation needs
    pub fn required_detectors(&self) -> usize {
        match self {
            PlanKind::Count { .. }
            | PlanKind::DetectorOptimization { .. }
            | PlanKind::SampleAlignment { .. } => 1,
            _ => 0,
        }
    }
}

/// Points per axis for a sample alignment over `[-scan_range, +scan_range]`
pub fn alignment_points(scan_range: f64, step_size: f64) -> Result<usize, String> {
    if !(step_size.is_finite() && step_size > 0.0) {
        return Err(format!("step_size must be positive, got {step_size}"));
    }
    if !(scan_range.is_finite() && scan_range >= 0.0) {
        return Err(format!("scan_range must be finite and not negative, got {scan_range}"));
    }
    let points = (2.0 * scan_range / step_size).round() + 1.0;
    if !points.is_finite() || points > MAX_PLAN_POINTS as f64 {
        return Err(format!(
            "sample alignment needs {points} points per axis, limit is {MAX_PLAN_POINTS}"
        ));
    }
    Ok(points as usize)
}

/// Description of one plan invocation
///
/// Built by the caller before invoking the runner and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    /// Name shown in reports
    pub name: String,

    /// Operation and its parameters
    pub kind: PlanKind,

    /// Devices that move
    #[serde(default)]
    pub movers: Vec<DeviceId>,

    /// Devices that are read
    #[serde(default)]
    pub detectors: Vec<DeviceId>,

    /// Upper bound for the whole execution
    #[serde(default = "default_plan_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Require a new catalog record with a scan id
    #[serde(default)]
    pub expect_record: bool,

    /// Movers must end within this distance of where they started
    #[serde(default)]
    pub return_tolerance: Option<f64>,

    /// Generate commands without driving hardware or persisting records
    #[serde(default)]
    pub simulate: bool,

    /// Retry policy for unreachable targets
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl PlanSpec {
    /// New spec with a 30s timeout and no targets
    pub fn new(name: impl Into<String>, kind: PlanKind) -> Self {
        Self {
            name: name.into(),
            kind,
            movers: Vec::new(),
            detectors: Vec::new(),
            timeout: default_plan_timeout(),
            expect_record: false,
            return_tolerance: None,
            simulate: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the movers
    pub fn with_movers<S: AsRef<str>>(mut self, movers: &[S]) -> Self {
        self.movers = movers.iter().map(|m| m.as_ref().to_string()).collect();
        self
    }

    /// Set the detectors
    pub fn with_detectors<S: AsRef<str>>(mut self, detectors: &[S]) -> Self {
        self.detectors = detectors.iter().map(|d| d.as_ref().to_string()).collect();
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Require a new catalog record
    pub fn expect_record(mut self) -> Self {
        self.expect_record = true;
        self
    }

    /// Require movers to return within `tolerance`
    pub fn with_return_tolerance(mut self, tolerance: f64) -> Self {
        self.return_tolerance = Some(tolerance);
        self
    }

    /// Run in simulation mode
    pub fn simulated(mut self) -> Self {
        self.simulate = true;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Every target device: movers first, then detectors
    pub fn targets(&self) -> Vec<DeviceId> {
        let mut targets = self.movers.clone();
        for det in &self.detectors {
            if !targets.contains(det) {
                targets.push(det.clone());
            }
        }
        targets
    }

    /// Describe why the spec cannot run, if it cannot
    pub fn missing_targets(&self) -> Option<String> {
        if self.movers.len() < self.kind.required_movers() {
            return Some(format!(
                "{} needs {} mover(s), {} given",
                self.kind.type_name(),
                self.kind.required_movers(),
                self.movers.len()
            ));
        }
        if self.detectors.len() < self.kind.required_detectors() {
            return Some(format!(
                "{} needs {} detector(s), {} given",
                self.kind.type_name(),
                self.kind.required_detectors(),
                self.detectors.len()
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(plan: &mut dyn Plan) -> Vec<PlanCommand> {
        std::iter::from_fn(|| plan.next_command()).collect()
    }

    #[test]
    fn test_count_plan() {
        let mut plan = Count::new(2).with_detectors(&["scaler1".to_string()]);
        let cmds = drain(&mut plan);
        assert_eq!(cmds.len(), 8);
        assert_eq!(
            cmds[1],
            PlanCommand::Trigger {
                device_id: "scaler1".into()
            }
        );
        let events = cmds
            .iter()
            .filter(|c| matches!(c, PlanCommand::EmitEvent { .. }))
            .count();
        assert_eq!(events, 2);
    }

    #[test]
    fn test_count_plan_with_delay_waits_between_points() {
        let mut plan = Count::new(3)
            .with_detectors(&["det".to_string()])
            .with_delay(0.5);
        let waits = drain(&mut plan)
            .into_iter()
            .filter(|c| matches!(c, PlanCommand::Wait { .. }))
            .count();
        assert_eq!(waits, 2);
    }

    #[test]
    fn test_line_scan_positions() {
        let mut plan = LineScan::new("m1", 0.0, 1.0, 3);
        let positions: Vec<f64> = drain(&mut plan)
            .into_iter()
            .filter_map(|c| match c {
                PlanCommand::MoveTo { position, .. } => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_line_scan_returns_to_origin() {
        let mut plan = LineScan::new("m1", 1.5, 2.5, 2)
            .with_detectors(&["det".to_string()])
            .returning_to(2.0);
        let cmds = drain(&mut plan);
        assert_eq!(
            cmds.last(),
            Some(&PlanCommand::MoveTo {
                device_id: "m1".into(),
                position: 2.0
            })
        );
    }

    #[test]
    fn test_round_trip_undoes_moves() {
        let mut plan = RelativeMove::round_trip(&["m1".to_string()], 0.25);
        assert!(!plan.opens_run());
        let net: f64 = drain(&mut plan)
            .into_iter()
            .filter_map(|c| match c {
                PlanCommand::MoveRelative { delta, .. } => Some(delta),
                _ => None,
            })
            .sum();
        assert_eq!(net, 0.0);
    }

    #[test]
    fn test_peak_search_emits_one_peak_move_per_cycle() {
        let mut plan = PeakSearch::new(&["m1".to_string()], "det", 1.0, 5, 3);
        let cmds = drain(&mut plan);
        let peaks = cmds
            .iter()
            .filter(|c| matches!(c, PlanCommand::MoveToPeak { .. }))
            .count();
        assert_eq!(peaks, 3);
        let events = cmds
            .iter()
            .filter(|c| matches!(c, PlanCommand::EmitEvent { .. }))
            .count();
        assert_eq!(events, 15);
    }

    #[test]
    fn test_peak_search_halves_the_window_each_cycle() {
        let mut plan = PeakSearch::new(&["m1".to_string()], "det", 1.0, 3, 2);
        let moves: Vec<f64> = drain(&mut plan)
            .into_iter()
            .filter_map(|c| match c {
                PlanCommand::MoveRelative { delta, .. } => Some(delta),
                _ => None,
            })
            .collect();
        assert_eq!(moves, vec![-1.0, 1.0, 1.0, -0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_peak_search_walks_axes_in_order() {
        let axes = ["m1".to_string(), "m2".to_string()];
        let mut plan = PeakSearch::new(&axes, "det", 0.5, 2, 1);
        let cmds = drain(&mut plan);
        assert_eq!(cmds.len(), 2 * (1 + 2 * 4 + 1 + 1));
        assert_eq!(
            cmds[1],
            PlanCommand::Checkpoint {
                label: "m1_cycle0_point0".into()
            }
        );
        assert_eq!(
            cmds.last(),
            Some(&PlanCommand::MoveToPeak {
                device_id: "m2".into(),
                detector_id: "det".into()
            })
        );
        assert_eq!(plan.next_command(), None);
    }

    #[test]
    fn test_huge_searches_are_generated_lazily() {
        let mut plan = PeakSearch::new(&["m1".to_string()], "det", 1.0, usize::MAX / 8, 1);
        let first: Vec<PlanCommand> = std::iter::from_fn(|| plan.next_command()).take(6).collect();
        assert_eq!(first.len(), 6);
        assert!(matches!(first[5], PlanCommand::MoveRelative { .. }));
    }

    #[test]
    fn test_kind_bounds() {
        assert!(PlanKind::Count {
            num: MAX_PLAN_POINTS,
            delay: Duration::ZERO
        }
        .validate()
        .is_ok());
        let err = PlanKind::Count {
            num: 3_000_000,
            delay: Duration::ZERO,
        }
        .validate()
        .unwrap_err();
        assert!(err.contains("limit is 10000"), "{err}");

        let err = PlanKind::DetectorOptimization {
            initial_range: 1.0,
            refinement_cycles: 1_000,
            points: 5,
        }
        .validate()
        .unwrap_err();
        assert!(err.contains("refinement_cycles"), "{err}");

        assert!(PlanKind::Scan {
            start: f64::NAN,
            stop: 1.0,
            points: 5
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_alignment_points() {
        assert_eq!(alignment_points(1.0, 0.2), Ok(11));
        assert!(alignment_points(1.0, 0.0).unwrap_err().contains("step_size"));
        assert!(alignment_points(1.0, -0.1).is_err());
        assert!(alignment_points(f64::INFINITY, 0.1).is_err());
        assert!(alignment_points(1.0, f64::MIN_POSITIVE)
            .unwrap_err()
            .contains("limit is"));
    }

    #[test]
    fn test_spec_targets_and_requirements() {
        let spec = PlanSpec::new(
            "align",
            PlanKind::SampleAlignment {
                scan_range: 0.5,
                step_size: 0.1,
            },
        )
        .with_movers(&["m1"])
        .with_detectors(&["scaler1", "m1"]);

        assert_eq!(spec.targets(), vec!["m1".to_string(), "scaler1".to_string()]);
        assert!(spec.missing_targets().unwrap().contains("2 mover"));
    }

    #[test]
    fn test_spec_deserializes_from_toml() {
        let spec: PlanSpec = toml::from_str(
            r#"
            name = "wide scan"
            movers = ["m2"]
            detectors = ["scaler1"]
            timeout = "45s"
            expect_record = true

            [kind]
            type = "relative_scan"
            start = -1.0
            stop = 1.0
            points = 11
            "#,
        )
        .unwrap();

        assert_eq!(spec.timeout, Duration::from_secs(45));
        assert_eq!(
            spec.kind,
            PlanKind::RelativeScan {
                start: -1.0,
                stop: 1.0,
                points: 11
            }
        );
        assert!(spec.kind.opens_run());
        assert_eq!(spec.retry, RetryPolicy::default());
    }
}
