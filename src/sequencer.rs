use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::axis_hal::{Axis, AxisHal, HalError, TelemetrySample};
use crate::convergence::{ConvergenceConfig, ConvergenceLoop};
use crate::cutter::{CutterError, CutterOperations};
use crate::drive::{AdvanceOptions, DriveError, DriveOperations, WireStart};

/// Wire fed and cut off before the first piece to square up the wire end.
pub const PRIME_ADVANCE_CM: f64 = 1.0;
/// Pull-back after stripping so the stripped insulation slides off the conductor.
pub const STRIP_EXTRA_RETRACT_CM: f64 = 1.0;
pub const STRIP_RETRACT_KP_SCALE: f64 = 1.0;
pub const OPPOSITE_CUT_SETTLE: Duration = Duration::from_millis(100);
pub const DEBUG_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid run parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Cutter(#[from] CutterError),
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Hal(#[from] HalError),
}

pub type SequencerResult<T> = Result<T, SequencerError>;

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct RunParameters {
    pub length_cm: f64,
    #[serde(default)]
    pub strip_cm: f64,
    #[serde(default)]
    pub cut_cm: f64,
    #[serde(default)]
    pub prime: bool,
    #[serde(default = "RunParameters::default_count")]
    pub count: u32,
    #[serde(default)]
    pub slow: bool,
}

impl RunParameters {
    fn default_count() -> u32 {
        1
    }

    pub fn validate(&self) -> SequencerResult<()> {
        let invalid = |msg: String| Err(SequencerError::InvalidParameters(msg));
        if !self.length_cm.is_finite() || self.length_cm <= 0.0 {
            return invalid(format!("length must be positive, got {}", self.length_cm));
        }
        for (name, value) in [("strip", self.strip_cm), ("cut", self.cut_cm)] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be zero or positive, got {value}"));
            }
        }
        if self.cut_cm >= self.length_cm {
            return invalid(format!("cut {} must be shorter than length {}", self.cut_cm, self.length_cm));
        }
        Ok(())
    }
}

/// A production run read from a job file, optionally with its own loop bounds.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Job {
    #[serde(flatten)]
    pub run: RunParameters,
    #[serde(default)]
    pub convergence: Option<ConvergenceConfig>,
}

/// One bench-test operation, run in place of a production run.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Action {
    Break,
    Stop,
    Strip,
    Release,
    Advance(f64),
    Query,
}

impl FromStr for Action {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || SequencerError::UnknownAction(s.to_owned());
        match s {
            "break" => Ok(Action::Break),
            "stop" => Ok(Action::Stop),
            "strip" => Ok(Action::Strip),
            "release" => Ok(Action::Release),
            "query" => Ok(Action::Query),
            _ => {
                let distance = s.strip_prefix("advance_").ok_or_else(unknown)?;
                distance.parse::<f64>()
                    .ok()
                    .filter(|d| d.is_finite())
                    .map(Action::Advance)
                    .ok_or_else(unknown)
            }
        }
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Step {
    ZeroCalibrate,
    Advance { distance_cm: f64 },
    Break,
    Strip { extra: bool },
    Release,
    Stop,
    Query,
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Progress {
    UnitStarted { unit: u32, count: u32 },
    Step(Step),
    Finished { units: u32 },
}

/// Owns both axes for one process run and drives them through whole production runs or
/// single bench actions.
pub struct WireSequencer {
    hal: Box<dyn AxisHal>,
    cutter: CutterOperations,
    drive: DriveOperations,
    progress: Option<UnboundedSender<Progress>>,
}

impl WireSequencer {
    pub fn new(hal: Box<dyn AxisHal>, config: ConvergenceConfig) -> Self {
        let convergence = ConvergenceLoop::new(config);
        Self {
            hal,
            cutter: CutterOperations::new(convergence),
            drive: DriveOperations::new(convergence),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: UnboundedSender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Produce `params.count` pieces.  Both axes are stopped afterwards whether or not the run
    /// succeeded; a failed run has to start over from zero calibration.
    pub async fn run(&mut self, params: &RunParameters) -> SequencerResult<u32> {
        params.validate()?;
        info!("Starting run: {params:?}");
        let result = self.run_units(params).await;
        self.stop_best_effort().await;
        if let Ok(units) = result {
            self.report(Progress::Finished { units });
        }
        result
    }

    /// Initialize, run exactly one action, stop.  Only `Query` yields a sample.
    pub async fn run_action(&mut self, action: Action) -> SequencerResult<Option<TelemetrySample>> {
        info!("Single action: {action:?}");
        let result = self.run_action_inner(action).await;
        self.stop_best_effort().await;
        result
    }

    async fn run_action_inner(&mut self, action: Action) -> SequencerResult<Option<TelemetrySample>> {
        let wire_start = self.initialize().await?;
        match action {
            Action::Break => self.cut_break().await?,
            Action::Stop => self.stop().await?,
            Action::Strip => self.cut_strip(false).await?,
            Action::Release => self.cut_release().await?,
            Action::Advance(distance_cm) => {
                self.advance(wire_start, distance_cm, AdvanceOptions::default()).await?
            }
            Action::Query => {
                self.step(Step::Query);
                let sample = self.hal.query(Axis::Cutter).await?;
                return Ok(sample);
            }
        }
        Ok(None)
    }

    async fn run_units(&mut self, params: &RunParameters) -> SequencerResult<u32> {
        let wire_start = self.initialize().await?;

        if params.prime {
            self.advance(wire_start, PRIME_ADVANCE_CM, AdvanceOptions::default()).await?;
            self.cut_break().await?;
        }

        for unit in 1..=params.count {
            debug!("unit {unit} of {}", params.count);
            self.report(Progress::UnitStarted { unit, count: params.count });
            let wire_start = self.zero_calibrate().await?;

            if params.strip_cm != 0.0 {
                self.advance(wire_start, params.strip_cm, AdvanceOptions::default()).await?;
                debug_delay(params).await;
                self.cut_strip(false).await?;
                debug_delay(params).await;
                let retract = AdvanceOptions { kp_scale: Some(STRIP_RETRACT_KP_SCALE), ..Default::default() };
                self.advance(wire_start, -STRIP_EXTRA_RETRACT_CM, retract).await?;
                debug_delay(params).await;
                self.cut_release().await?;
                debug_delay(params).await;
            }

            if params.cut_cm != 0.0 {
                self.advance(wire_start, params.length_cm - params.cut_cm, AdvanceOptions::default()).await?;
                debug_delay(params).await;
                self.cut_strip(true).await?;
                tokio::time::sleep(OPPOSITE_CUT_SETTLE).await;
                self.cut_release().await?;
                debug_delay(params).await;
            }

            self.advance(wire_start, params.length_cm, AdvanceOptions::default()).await?;
            debug_delay(params).await;
            self.cut_break().await?;
        }
        Ok(params.count)
    }

    async fn initialize(&mut self) -> SequencerResult<WireStart> {
        self.stop().await?;
        self.zero_calibrate().await
    }

    async fn stop(&mut self) -> SequencerResult<()> {
        self.step(Step::Stop);
        for axis in Axis::ALL {
            self.hal.stop(axis).await?;
        }
        Ok(())
    }

    async fn stop_best_effort(&mut self) {
        for axis in Axis::ALL {
            if let Err(e) = self.hal.stop(axis).await {
                warn!("Failed to stop {axis}: {e}");
            }
        }
    }

    async fn zero_calibrate(&mut self) -> SequencerResult<WireStart> {
        self.step(Step::ZeroCalibrate);
        Ok(self.drive.zero_calibrate(self.hal.as_mut()).await?)
    }

    async fn advance(&mut self, wire_start: WireStart, distance_cm: f64, options: AdvanceOptions) -> SequencerResult<()> {
        self.step(Step::Advance { distance_cm });
        self.drive.advance(self.hal.as_mut(), wire_start, distance_cm, options).await?;
        Ok(())
    }

    async fn cut_break(&mut self) -> SequencerResult<()> {
        self.step(Step::Break);
        Ok(self.cutter.cut_break(self.hal.as_mut()).await?)
    }

    async fn cut_strip(&mut self, extra: bool) -> SequencerResult<()> {
        self.step(Step::Strip { extra });
        Ok(self.cutter.cut_strip(self.hal.as_mut(), extra).await?)
    }

    async fn cut_release(&mut self) -> SequencerResult<()> {
        self.step(Step::Release);
        Ok(self.cutter.cut_release(self.hal.as_mut()).await?)
    }

    fn step(&self, step: Step) {
        self.report(Progress::Step(step));
    }

    fn report(&self, progress: Progress) {
        if let Some(tx) = &self.progress {
            // The receiver going away only means nobody is watching anymore.
            let _ = tx.send(progress);
        }
    }
}

async fn debug_delay(params: &RunParameters) {
    if params.slow {
        tokio::time::sleep(DEBUG_DELAY).await;
    }
}
