use std::fmt;

use derive_new::new;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, PartialEq, Clone, Debug)]
pub enum HalError {
    #[error("{0}")]
    DeviceNotConnected(String),
    #[error("{0}")]
    InternalError(String),
}

pub type HalResult<T> = Result<T, HalError>;

/// Abstract motor controller link shared by both axes.
///
/// `None` from a telemetry-bearing call means the round trip was missed.  That is normal
/// transport jitter and callers are expected to simply resend; only `Err` is a real failure.
pub trait AxisHal: Send {
    fn stop(&mut self, axis: Axis) -> BoxFuture<'_, HalResult<()>>;

    /// Redefine the axis's current physical position as `reference`.
    fn set_rezero(&mut self, axis: Axis, reference: f64) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>>;

    /// Always `Ok(None)` when `command.query` is false.
    fn set_position(&mut self, axis: Axis, command: PositionCommand) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>>;

    fn query(&mut self, axis: Axis) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>>;
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Axis {
    Drive,
    Cutter,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::Drive, Axis::Cutter];

    /// Bus address of the controller driving this axis.
    pub fn controller_id(self) -> u8 {
        match self {
            Axis::Drive => 1,
            Axis::Cutter => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Drive => write!(f, "drive (id {})", self.controller_id()),
            Axis::Cutter => write!(f, "cutter (id {})", self.controller_id()),
        }
    }
}

#[derive(new, Debug, PartialEq, Copy, Clone, Serialize)]
pub struct TelemetrySample {
    pub position: f64,
    pub velocity: f64,
    pub torque: f64,
    pub trajectory_complete: bool,
}

impl TelemetrySample {
    pub fn at(position: f64) -> Self {
        Self::new(position, 0.0, 0.0, false)
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Watchdog {
    ControllerDefault,
    /// Hold the command indefinitely with no automatic safety stop.
    Disabled,
    TimeoutSecs(f64),
}

impl Default for Watchdog {
    fn default() -> Self {
        Watchdog::ControllerDefault
    }
}

/// One position-mode command.  `target == None` leaves the position unconstrained so the
/// motion is shaped only by velocity, stop position and feedforward.
#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct PositionCommand {
    pub target: Option<f64>,
    pub velocity: f64,
    pub maximum_torque: f64,
    pub velocity_limit: Option<f64>,
    pub accel_limit: Option<f64>,
    pub stop_position: Option<f64>,
    pub feedforward_torque: Option<f64>,
    pub kp_scale: Option<f64>,
    pub watchdog: Watchdog,
    pub query: bool,
}

impl PositionCommand {
    pub const fn unconstrained(velocity: f64, maximum_torque: f64) -> Self {
        Self {
            target: None,
            velocity,
            maximum_torque,
            velocity_limit: None,
            accel_limit: None,
            stop_position: None,
            feedforward_torque: None,
            kp_scale: None,
            watchdog: Watchdog::ControllerDefault,
            query: false,
        }
    }

    pub fn stop_at(mut self, stop_position: f64) -> Self {
        self.stop_position = Some(stop_position);
        self
    }

    pub fn feedforward(mut self, torque: f64) -> Self {
        self.feedforward_torque = Some(torque);
        self
    }

    pub fn watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_query(mut self) -> Self {
        self.query = true;
        self
    }
}
