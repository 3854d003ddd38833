use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use log::{trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::axis_hal::{Axis, AxisHal, HalError, HalResult, PositionCommand, TelemetrySample};

/// Model time covered by one round trip, also spent as real (or virtual) time per call.
const STEP: Duration = Duration::from_millis(5);
const DEFAULT_VELOCITY_LIMIT: f64 = 1.0;
const CUTTER_PARKED_POSITION: f64 = 0.12;

/// Kinematic stand-in for the two motor controllers.
///
/// Positions move toward the commanded target (or stop position when unconstrained) at the
/// commanded speed, without any dynamics.  Replies are dropped at random to exercise the
/// missed-round-trip paths.  Non-finite setpoints are refused the way a controller rejects a
/// malformed frame.
pub struct SimulatedAxisHal {
  drive: SimulatedAxis,
  cutter: SimulatedAxis,
  miss_probability: f64,
  rng: StdRng,
  last_command: Option<(Axis, PositionCommand)>,
}

#[derive(Debug, Default, Copy, Clone)]
struct SimulatedAxis {
  position: f64,
  velocity: f64,
  torque: f64,
  trajectory_complete: bool,
}

impl SimulatedAxis {
  fn sample(&self) -> TelemetrySample {
    TelemetrySample::new(self.position, self.velocity, self.torque, self.trajectory_complete)
  }

  fn apply(&mut self, command: &PositionCommand) {
    let goal = match (command.target, command.stop_position) {
      (Some(target), _) => Some((target, command.velocity_limit.unwrap_or(DEFAULT_VELOCITY_LIMIT))),
      (None, Some(stop)) => Some((stop, command.velocity.abs())),
      (None, None) => None,
    };
    self.torque = command.feedforward_torque.unwrap_or(0.0);

    let (goal, speed) = match goal {
      Some(goal) => goal,
      None => {
        self.velocity = 0.0;
        self.trajectory_complete = true;
        return;
      }
    };
    let max_delta = speed * STEP.as_secs_f64();
    let remaining = goal - self.position;
    let delta = if remaining.abs() <= max_delta {
      self.trajectory_complete = true;
      remaining
    } else {
      self.trajectory_complete = false;
      remaining.signum() * max_delta
    };
    self.position = if self.trajectory_complete { goal } else { self.position + delta };
    self.velocity = delta / STEP.as_secs_f64();
  }

  fn stop(&mut self) {
    self.velocity = 0.0;
    self.torque = 0.0;
    self.trajectory_complete = true;
  }
}

impl SimulatedAxisHal {
  pub fn new(miss_probability: f64, seed: u64) -> Self {
    let miss_probability = if miss_probability.is_nan() {
      warn!("sim: miss probability is NaN, never dropping replies");
      0.0
    } else {
      miss_probability.clamp(0.0, 1.0)
    };
    Self {
      drive: SimulatedAxis::default(),
      cutter: SimulatedAxis { position: CUTTER_PARKED_POSITION, ..Default::default() },
      miss_probability,
      rng: StdRng::seed_from_u64(seed),
      last_command: None,
    }
  }

  pub fn last_command(&self) -> Option<(Axis, PositionCommand)> {
    self.last_command
  }

  fn axis_mut(&mut self, axis: Axis) -> &mut SimulatedAxis {
    match axis {
      Axis::Drive => &mut self.drive,
      Axis::Cutter => &mut self.cutter,
    }
  }

  fn reply(&mut self, axis: Axis) -> Option<TelemetrySample> {
    if self.rng.gen_bool(self.miss_probability) {
      trace!("sim: dropping {axis} reply");
      return None;
    }
    Some(self.axis_mut(axis).sample())
  }
}

fn round_trip<T: Send + 'static>(result: T) -> BoxFuture<'static, HalResult<T>> {
  async move {
    tokio::time::sleep(STEP).await;
    Ok(result)
  }.boxed()
}

fn rejected<T: Send + 'static>(axis: Axis, what: &str, value: f64) -> BoxFuture<'static, HalResult<T>> {
  future::ready(Err(HalError::InternalError(format!("{axis}: rejected {what} {value}")))).boxed()
}

fn non_finite(command: &PositionCommand) -> Option<(&'static str, f64)> {
  [
    ("target", command.target),
    ("stop position", command.stop_position),
    ("velocity", Some(command.velocity)),
    ("velocity limit", command.velocity_limit),
  ]
  .into_iter()
  .find_map(|(what, value)| value.filter(|v| !v.is_finite()).map(|v| (what, v)))
}

impl AxisHal for SimulatedAxisHal {
  fn stop(&mut self, axis: Axis) -> BoxFuture<'_, HalResult<()>> {
    self.axis_mut(axis).stop();
    round_trip(())
  }

  fn set_rezero(&mut self, axis: Axis, reference: f64) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>> {
    if !reference.is_finite() {
      return rejected(axis, "rezero reference", reference);
    }
    let sim = self.axis_mut(axis);
    sim.position = reference;
    sim.stop();
    round_trip(self.reply(axis))
  }

  fn set_position(&mut self, axis: Axis, command: PositionCommand) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>> {
    if let Some((what, value)) = non_finite(&command) {
      return rejected(axis, what, value);
    }
    self.last_command = Some((axis, command));
    self.axis_mut(axis).apply(&command);
    let reply = if command.query { self.reply(axis) } else { None };
    round_trip(reply)
  }

  fn query(&mut self, axis: Axis) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>> {
    round_trip(self.reply(axis))
  }
}
