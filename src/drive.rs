use std::f64::consts::PI;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::axis_hal::{Axis, AxisHal, HalError, PositionCommand, TelemetrySample, Watchdog};
use crate::convergence::{ConvergenceError, ConvergenceLoop};

/// Wire dispensed by one full revolution of the drive wheel.
pub const DRIVE_SCALE_CM: f64 = 6.5 * PI;

/// Drive position taken as the start of the current piece of wire.
///
/// Only [`DriveOperations::zero_calibrate`] produces one, so an advance can never be issued
/// against a reference frame that was not established.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct WireStart(f64);

impl WireStart {
    pub fn position(self) -> f64 {
        self.0
    }

    /// Absolute drive position `distance_cm` of wire past this start.
    pub fn target_for(self, distance_cm: f64) -> f64 {
        self.0 + distance_cm / DRIVE_SCALE_CM
    }
}

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("drive advance to {target:.4} failed (last error {last_error_cm:?} cm)")]
    AdvanceFailed {
        target: f64,
        last_error_cm: Option<f64>,
        #[source]
        source: ConvergenceError,
    },
    #[error("drive rezero never landed near zero after {attempts} attempts (last position {last_position:.4})")]
    ZeroCalibrationFailed {
        attempts: u32,
        last_position: f64,
    },
    #[error("drive telemetry lost during zero calibration")]
    Telemetry(#[from] ConvergenceError),
    #[error(transparent)]
    Hal(#[from] HalError),
}

pub type DriveResult<T> = Result<T, DriveError>;

#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct AdvanceOptions {
    pub kp_scale: Option<f64>,
    pub feedforward_torque: Option<f64>,
}

pub struct DriveOperations {
    convergence: ConvergenceLoop,
}

impl DriveOperations {
    /// Coarse sanity bound on a fresh rezero, not a precision requirement.
    pub const REZERO_TOLERANCE: f64 = 0.5;
    pub const POSITION_TOLERANCE_CM: f64 = 0.2;
    pub const MAXIMUM_TORQUE: f64 = 2.0;
    pub const VELOCITY_LIMIT: f64 = 3.0;
    pub const ACCEL_LIMIT: f64 = 15.0;
    /// Mechanical ring-down after a move.
    pub const SETTLE: Duration = Duration::from_millis(200);

    pub fn new(convergence: ConvergenceLoop) -> Self {
        Self { convergence }
    }

    /// Rezero the drive until the controller reports a position close to zero, and use that
    /// reading as the start of the next piece.
    ///
    /// The rezero reply can still carry the position from before the rezero, so the reading
    /// always comes from a fresh query.
    pub async fn zero_calibrate(&self, hal: &mut dyn AxisHal) -> DriveResult<WireStart> {
        let limit = self.convergence.config().rezero_attempt_limit.max(1);
        let mut last_position = f64::NAN;
        for attempt in 1..=limit {
            hal.set_rezero(Axis::Drive, 0.0).await?;
            let sample = self.convergence.poll(hal, Axis::Drive).await?;
            last_position = sample.position;
            if sample.position.abs() <= Self::REZERO_TOLERANCE {
                debug!("drive: wire start {:.4} after {attempt} rezero(s)", sample.position);
                return Ok(WireStart(sample.position));
            }
            warn!("drive: rezero landed at {:.4}, retrying", sample.position);
        }
        Err(DriveError::ZeroCalibrationFailed { attempts: limit, last_position })
    }

    /// Feed the wire so the drive sits `distance_cm` past `wire_start`, then let it settle.
    pub async fn advance(
        &self,
        hal: &mut dyn AxisHal,
        wire_start: WireStart,
        distance_cm: f64,
        options: AdvanceOptions,
    ) -> DriveResult<TelemetrySample> {
        let target = wire_start.target_for(distance_cm);
        info!("drive: advance {distance_cm} cm (target {target:.4})");

        let command = Self::advance_command(target, options);
        let sample = self.convergence
            .run(hal, Axis::Drive, command, |s| Self::arrived(s, target))
            .await
            .map_err(|source| {
                let last_error_cm = match &source {
                    ConvergenceError::Timeout { last_sample, .. } => {
                        last_sample.map(|s| error_cm(s.position, target))
                    }
                    ConvergenceError::Hal(_) => None,
                };
                DriveError::AdvanceFailed { target, last_error_cm, source }
            })?;

        tokio::time::sleep(Self::SETTLE).await;
        Ok(sample)
    }

    fn advance_command(target: f64, options: AdvanceOptions) -> PositionCommand {
        PositionCommand {
            target: Some(target),
            velocity: 0.0,
            maximum_torque: Self::MAXIMUM_TORQUE,
            velocity_limit: Some(Self::VELOCITY_LIMIT),
            accel_limit: Some(Self::ACCEL_LIMIT),
            feedforward_torque: options.feedforward_torque,
            kp_scale: options.kp_scale,
            watchdog: Watchdog::Disabled,
            ..Default::default()
        }
    }

    /// Passing through the target mid-trajectory does not count.
    fn arrived(sample: &TelemetrySample, target: f64) -> bool {
        error_cm(sample.position, target).abs() < Self::POSITION_TOLERANCE_CM && sample.trajectory_complete
    }
}

fn error_cm(position: f64, target: f64) -> f64 {
    (position - target) * DRIVE_SCALE_CM
}
