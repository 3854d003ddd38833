use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::time::Instant;

use crate::axis_hal::{Axis, AxisHal, HalError, HalResult, PositionCommand, TelemetrySample};

/// Replays per-axis telemetry scripts and records every call it receives.
///
/// Each telemetry-bearing call (rezero, queried set_position, query) consumes the next scripted
/// entry for its axis; an exhausted script answers with missed round trips forever.
#[derive(Default)]
pub struct ScriptedAxisHal {
    scripts: HashMap<Axis, VecDeque<Option<TelemetrySample>>>,
    failures: HashMap<Axis, HalError>,
    stop_failures: HashMap<(Axis, usize), HalError>,
    calls: CallLog,
}

/// Shared view of the calls a [`ScriptedAxisHal`] received, usable after the HAL is boxed.
#[derive(Default, Clone)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Stop { axis: Axis, at: Instant },
    Rezero { axis: Axis, reference: f64, at: Instant },
    SetPosition { axis: Axis, command: PositionCommand, at: Instant },
    Query { axis: Axis, at: Instant },
}

impl Call {
    pub fn axis(&self) -> Axis {
        match self {
            Call::Stop { axis, .. }
            | Call::Rezero { axis, .. }
            | Call::SetPosition { axis, .. }
            | Call::Query { axis, .. } => *axis,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Call::Stop { .. })
    }
}

impl ScriptedAxisHal {
    /// Script plain positions; trajectory_complete is reported false.
    pub fn script(&mut self, axis: Axis, positions: impl IntoIterator<Item = Option<f64>>) {
        self.script_samples(axis, positions.into_iter().map(|p| p.map(TelemetrySample::at)));
    }

    pub fn script_samples(&mut self, axis: Axis, samples: impl IntoIterator<Item = Option<TelemetrySample>>) {
        self.scripts.entry(axis).or_default().extend(samples);
    }

    /// The next call of any kind on `axis` fails with `error`.
    pub fn fail_next(&mut self, axis: Axis, error: HalError) {
        self.failures.insert(axis, error);
    }

    /// The `nth` (1-based) stop sent to `axis` fails with `error`.
    pub fn fail_stop(&mut self, axis: Axis, nth: usize, error: HalError) {
        self.stop_failures.insert((axis, nth), error);
    }

    pub fn log(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.calls()
    }

    pub fn calls_for(&self, axis: Axis) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.axis() == axis).collect()
    }

    pub fn set_position_count(&self, axis: Axis) -> usize {
        self.count(axis, |c| matches!(c, Call::SetPosition { .. }))
    }

    pub fn query_count(&self, axis: Axis) -> usize {
        self.count(axis, |c| matches!(c, Call::Query { .. }))
    }

    pub fn rezero_count(&self, axis: Axis) -> usize {
        self.count(axis, |c| matches!(c, Call::Rezero { .. }))
    }

    fn count(&self, axis: Axis, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| c.axis() == axis && pred(c)).count()
    }

    fn take_failure(&mut self, axis: Axis) -> HalResult<()> {
        match self.failures.remove(&axis) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_sample(&mut self, axis: Axis) -> HalResult<Option<TelemetrySample>> {
        self.take_failure(axis)?;
        Ok(self.scripts.get_mut(&axis).and_then(|s| s.pop_front()).flatten())
    }
}

impl AxisHal for ScriptedAxisHal {
    fn stop(&mut self, axis: Axis) -> BoxFuture<'_, HalResult<()>> {
        self.calls.push(Call::Stop { axis, at: Instant::now() });
        let nth = self.count(axis, Call::is_stop);
        let result = match self.stop_failures.remove(&(axis, nth)) {
            Some(err) => Err(err),
            None => self.take_failure(axis),
        };
        future::ready(result).boxed()
    }

    fn set_rezero(&mut self, axis: Axis, reference: f64) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>> {
        self.calls.push(Call::Rezero { axis, reference, at: Instant::now() });
        future::ready(self.next_sample(axis)).boxed()
    }

    fn set_position(&mut self, axis: Axis, command: PositionCommand) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>> {
        self.calls.push(Call::SetPosition { axis, command, at: Instant::now() });
        let result = if command.query {
            self.next_sample(axis)
        } else {
            self.take_failure(axis).map(|_| None)
        };
        future::ready(result).boxed()
    }

    fn query(&mut self, axis: Axis) -> BoxFuture<'_, HalResult<Option<TelemetrySample>>> {
        self.calls.push(Call::Query { axis, at: Instant::now() });
        future::ready(self.next_sample(axis)).boxed()
    }
}
