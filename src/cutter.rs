use std::fmt;
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use crate::axis_hal::{Axis, AxisHal, PositionCommand, Watchdog};
use crate::convergence::{ConvergenceError, ConvergenceLoop};

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CutterState {
    Idle,
    Pressing,
    Holding,
    Released,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CutterOperation {
    Break,
    Strip,
    StripExtra,
    Release,
}

impl fmt::Display for CutterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CutterOperation::Break => "break",
            CutterOperation::Strip => "strip",
            CutterOperation::StripExtra => "strip (extra)",
            CutterOperation::Release => "release",
        };
        f.write_str(name)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CutterPhase {
    Pressing,
    Holding,
    Releasing,
    Locking,
}

impl CutterPhase {
    fn state(self) -> Option<CutterState> {
        match self {
            CutterPhase::Pressing => Some(CutterState::Pressing),
            CutterPhase::Holding => Some(CutterState::Holding),
            CutterPhase::Releasing | CutterPhase::Locking => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum CutterError {
    #[error("cutter {operation} failed while {phase:?}")]
    OperationFailed {
        operation: CutterOperation,
        phase: CutterPhase,
        #[source]
        source: ConvergenceError,
    },
    #[error("cutter {requested} refused while {state:?}, release first")]
    OutOfOrder {
        requested: CutterOperation,
        state: CutterState,
    },
}

pub type CutterResult<T> = Result<T, CutterError>;

#[derive(Debug, PartialEq, Copy, Clone)]
enum Threshold {
    /// Break counts landing exactly on its closed threshold.
    AtOrBelow(f64),
    Below(f64),
    Above(f64),
}

impl Threshold {
    fn reached(self, position: f64) -> bool {
        match self {
            Threshold::AtOrBelow(limit) => position <= limit,
            Threshold::Below(limit) => position < limit,
            Threshold::Above(limit) => position > limit,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct Phase {
    kind: CutterPhase,
    command: PositionCommand,
    threshold: Threshold,
    settle: Duration,
}

/// Break, strip and release maneuvers on the cutter axis.
///
/// Every maneuver is a short table of phases.  Each phase resends one fixed command until the
/// blade position crosses that phase's threshold, then waits out its settling delay.
pub struct CutterOperations {
    convergence: ConvergenceLoop,
    state: CutterState,
}

impl CutterOperations {
    pub const FULLY_CLOSED_STOP: f64 = 0.0;
    pub const FULLY_OPEN_STOP: f64 = 0.12;
    pub const OPEN_THRESHOLD: f64 = 0.11;
    pub const OPEN_VELOCITY: f64 = 4.0;
    pub const OPEN_MAX_TORQUE: f64 = 1.0;

    pub const BREAK_PRESS_VELOCITY: f64 = 2.0;
    pub const BREAK_PRESS_MAX_TORQUE: f64 = 2.0;
    pub const BREAK_PRESS_FEEDFORWARD: f64 = -1.0;
    pub const BREAK_CLOSED_THRESHOLD: f64 = 0.006;
    /// Time for the blade to finish severing the core.
    pub const BREAK_SETTLE: Duration = Duration::from_millis(50);
    pub const LOCK_MAX_TORQUE: f64 = 1.0;

    pub const STRIP_PRESS_VELOCITY: f64 = 2.0;
    pub const STRIP_PRESS_MAX_TORQUE: f64 = 2.0;
    pub const STRIP_STOP: f64 = 0.008;
    pub const STRIP_EXTRA_STOP: f64 = 0.006;
    pub const STRIP_PRESS_FEEDFORWARD: f64 = -0.1;
    pub const STRIP_ENGAGED_THRESHOLD: f64 = 0.016;
    /// Time for the insulation to deform without cutting the conductor.
    pub const STRIP_DEFORM_SETTLE: Duration = Duration::from_millis(100);
    pub const STRIP_BACKOFF_STOP: f64 = 0.014;
    pub const STRIP_BACKOFF_FEEDFORWARD: f64 = -0.05;
    pub const STRIP_BACKOFF_THRESHOLD: f64 = 0.008;
    pub const STRIP_BACKOFF_SETTLE: Duration = Duration::from_millis(50);

    pub fn new(convergence: ConvergenceLoop) -> Self {
        Self { convergence, state: CutterState::Idle }
    }

    pub fn state(&self) -> CutterState {
        self.state
    }

    /// Close all the way through the wire, then open all the way and lock open with no
    /// watchdog so the blade stays parked between cycles.
    pub async fn cut_break(&mut self, hal: &mut dyn AxisHal) -> CutterResult<()> {
        let operation = CutterOperation::Break;
        self.ensure_released(operation)?;
        info!("cutter: {operation}");

        let phases = [
            Phase {
                kind: CutterPhase::Pressing,
                command: PositionCommand::unconstrained(Self::BREAK_PRESS_VELOCITY, Self::BREAK_PRESS_MAX_TORQUE)
                    .stop_at(Self::FULLY_CLOSED_STOP)
                    .feedforward(Self::BREAK_PRESS_FEEDFORWARD),
                threshold: Threshold::AtOrBelow(Self::BREAK_CLOSED_THRESHOLD),
                settle: Self::BREAK_SETTLE,
            },
            Phase {
                kind: CutterPhase::Holding,
                command: PositionCommand::unconstrained(Self::OPEN_VELOCITY, Self::OPEN_MAX_TORQUE)
                    .stop_at(Self::FULLY_OPEN_STOP),
                threshold: Threshold::Above(Self::OPEN_THRESHOLD),
                settle: Duration::ZERO,
            },
        ];
        self.run_phases(hal, operation, &phases).await?;

        hal.set_position(Axis::Cutter, Self::lock_open_command())
            .await
            .map_err(|e| CutterError::OperationFailed {
                operation,
                phase: CutterPhase::Locking,
                source: e.into(),
            })?;
        self.state = CutterState::Released;
        Ok(())
    }

    /// Bite into the insulation without severing the conductor and leave the blade there.
    /// `extra` bites slightly deeper, for the opposite-side cut.
    pub async fn cut_strip(&mut self, hal: &mut dyn AxisHal, extra: bool) -> CutterResult<()> {
        let (operation, stop) = if extra {
            (CutterOperation::StripExtra, Self::STRIP_EXTRA_STOP)
        } else {
            (CutterOperation::Strip, Self::STRIP_STOP)
        };
        self.ensure_released(operation)?;
        info!("cutter: {operation}");

        let phases = [
            Phase {
                kind: CutterPhase::Pressing,
                command: PositionCommand::unconstrained(Self::STRIP_PRESS_VELOCITY, Self::STRIP_PRESS_MAX_TORQUE)
                    .stop_at(stop)
                    .feedforward(Self::STRIP_PRESS_FEEDFORWARD)
                    .watchdog(Watchdog::Disabled),
                threshold: Threshold::Below(Self::STRIP_ENGAGED_THRESHOLD),
                settle: Self::STRIP_DEFORM_SETTLE,
            },
            Phase {
                kind: CutterPhase::Holding,
                command: PositionCommand::unconstrained(Self::OPEN_VELOCITY, Self::OPEN_MAX_TORQUE)
                    .stop_at(Self::STRIP_BACKOFF_STOP)
                    .feedforward(Self::STRIP_BACKOFF_FEEDFORWARD)
                    .watchdog(Watchdog::Disabled),
                threshold: Threshold::Above(Self::STRIP_BACKOFF_THRESHOLD),
                settle: Self::STRIP_BACKOFF_SETTLE,
            },
        ];
        self.run_phases(hal, operation, &phases).await
    }

    /// Open the blade fully, usually from the strip position.
    pub async fn cut_release(&mut self, hal: &mut dyn AxisHal) -> CutterResult<()> {
        let operation = CutterOperation::Release;
        info!("cutter: {operation}");

        let phase = Phase {
            kind: CutterPhase::Releasing,
            command: PositionCommand::unconstrained(Self::OPEN_VELOCITY, Self::OPEN_MAX_TORQUE)
                .stop_at(Self::FULLY_OPEN_STOP)
                .watchdog(Watchdog::Disabled),
            threshold: Threshold::Above(Self::OPEN_THRESHOLD),
            settle: Duration::ZERO,
        };
        self.run_phases(hal, operation, &[phase]).await?;
        self.state = CutterState::Released;
        Ok(())
    }

    fn lock_open_command() -> PositionCommand {
        PositionCommand::unconstrained(0.0, Self::LOCK_MAX_TORQUE).watchdog(Watchdog::Disabled)
    }

    fn ensure_released(&self, requested: CutterOperation) -> CutterResult<()> {
        match self.state {
            CutterState::Idle | CutterState::Released => Ok(()),
            state => Err(CutterError::OutOfOrder { requested, state }),
        }
    }

    async fn run_phases(
        &mut self,
        hal: &mut dyn AxisHal,
        operation: CutterOperation,
        phases: &[Phase],
    ) -> CutterResult<()> {
        for phase in phases {
            if let Some(state) = phase.kind.state() {
                self.state = state;
            }
            debug!("cutter: {operation} {:?} until {:?}", phase.kind, phase.threshold);

            let threshold = phase.threshold;
            let sample = self.convergence
                .run(hal, Axis::Cutter, phase.command, |s| threshold.reached(s.position))
                .await
                .map_err(|source| CutterError::OperationFailed {
                    operation,
                    phase: phase.kind,
                    source,
                })?;
            debug!("cutter: {operation} {:?} reached {:.4}", phase.kind, sample.position);

            if !phase.settle.is_zero() {
                tokio::time::sleep(phase.settle).await;
            }
        }
        Ok(())
    }
}
