use derive_new::new;
use log::{trace, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::axis_hal::{Axis, AxisHal, HalError, PositionCommand, TelemetrySample};

/// Bounds applied to every closed loop against a controller.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Consecutive missed round trips tolerated before giving up.
    pub miss_limit: u32,

    /// Total round trips allowed for one loop, `None` for no limit.
    pub iteration_limit: Option<u32>,

    /// How many times zero calibration may rezero before giving up.
    pub rezero_attempt_limit: u32,
}

impl ConvergenceConfig {
    pub const DEFAULT_MISS_LIMIT: u32 = 300;
    pub const DEFAULT_REZERO_ATTEMPT_LIMIT: u32 = 20;
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            miss_limit: Self::DEFAULT_MISS_LIMIT,
            iteration_limit: None,
            rezero_attempt_limit: Self::DEFAULT_REZERO_ATTEMPT_LIMIT,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConvergenceError {
    #[error("{axis} did not converge after {iterations} round trips (last sample: {last_sample:?})")]
    Timeout {
        axis: Axis,
        /// `None` when the loop was only polling telemetry.
        command: Option<PositionCommand>,
        iterations: u32,
        last_sample: Option<TelemetrySample>,
    },
    #[error(transparent)]
    Hal(#[from] HalError),
}

pub type ConvergenceResult<T> = Result<T, ConvergenceError>;

/// Resends a command until the returned telemetry satisfies a predicate.
#[derive(new, Debug, Copy, Clone, Default)]
pub struct ConvergenceLoop {
    config: ConvergenceConfig,
}

impl ConvergenceLoop {
    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    pub async fn run<P>(
        &self,
        hal: &mut dyn AxisHal,
        axis: Axis,
        command: PositionCommand,
        converged: P,
    ) -> ConvergenceResult<TelemetrySample>
    where
        P: FnMut(&TelemetrySample) -> bool,
    {
        self.run_with(hal, axis, command, |_| {}, converged).await
    }

    /// Like [`run`](Self::run), but `mutate` may adjust the command before every send.
    pub async fn run_with<M, P>(
        &self,
        hal: &mut dyn AxisHal,
        axis: Axis,
        template: PositionCommand,
        mut mutate: M,
        mut converged: P,
    ) -> ConvergenceResult<TelemetrySample>
    where
        M: FnMut(&mut PositionCommand),
        P: FnMut(&TelemetrySample) -> bool,
    {
        let mut tracker = Tracker::new(self.config);
        loop {
            let mut command = template;
            mutate(&mut command);
            command.query = true;

            let result = hal.set_position(axis, command).await?;
            match tracker.observe(result) {
                Some(sample) if converged(&sample) => {
                    trace!("{axis}: converged at {:.4} after {} round trips", sample.position, tracker.iterations);
                    return Ok(sample);
                }
                _ => (),
            }
            if tracker.exhausted() {
                warn!("{axis}: giving up after {} round trips ({} missed in a row)", tracker.iterations, tracker.misses);
                return Err(ConvergenceError::Timeout {
                    axis,
                    command: Some(command),
                    iterations: tracker.iterations,
                    last_sample: tracker.last_sample,
                });
            }
        }
    }

    /// Query telemetry until one round trip actually comes back.
    pub async fn poll(&self, hal: &mut dyn AxisHal, axis: Axis) -> ConvergenceResult<TelemetrySample> {
        let mut tracker = Tracker::new(self.config);
        loop {
            let result = hal.query(axis).await?;
            if let Some(sample) = tracker.observe(result) {
                return Ok(sample);
            }
            if tracker.exhausted() {
                warn!("{axis}: no telemetry after {} queries", tracker.iterations);
                return Err(ConvergenceError::Timeout {
                    axis,
                    command: None,
                    iterations: tracker.iterations,
                    last_sample: None,
                });
            }
        }
    }
}

struct Tracker {
    config: ConvergenceConfig,
    iterations: u32,
    misses: u32,
    last_sample: Option<TelemetrySample>,
}

impl Tracker {
    fn new(config: ConvergenceConfig) -> Self {
        Self { config, iterations: 0, misses: 0, last_sample: None }
    }

    fn observe(&mut self, result: Option<TelemetrySample>) -> Option<TelemetrySample> {
        self.iterations = self.iterations.saturating_add(1);
        match result {
            Some(sample) => {
                self.misses = 0;
                self.last_sample = Some(sample);
            }
            None => self.misses += 1,
        }
        result
    }

    fn exhausted(&self) -> bool {
        self.misses >= self.config.miss_limit.max(1)
            || self.config.iteration_limit.map_or(false, |limit| self.iterations >= limit)
    }
}

#[cfg(test)]
mod tests {
    use crate::axis_hal_script::{Call, ScriptedAxisHal};

    use super::*;

    fn config(miss_limit: u32) -> ConvergenceConfig {
        ConvergenceConfig { miss_limit, ..Default::default() }
    }

    fn below(threshold: f64) -> impl FnMut(&TelemetrySample) -> bool {
        move |sample| sample.position < threshold
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_missed_round_trips_then_converges() {
        let mut hal = ScriptedAxisHal::default();
        hal.script(Axis::Cutter, [None, None, Some(0.5), None, Some(0.01)]);

        let sample = ConvergenceLoop::new(config(10))
            .run(&mut hal, Axis::Cutter, PositionCommand::unconstrained(1.0, 1.0), below(0.1))
            .await
            .unwrap();

        assert_eq!(sample.position, 0.01);
        assert_eq!(hal.set_position_count(Axis::Cutter), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_stops_on_sample_failing_predicate() {
        let mut hal = ScriptedAxisHal::default();
        hal.script(Axis::Cutter, [Some(0.3), Some(0.2), Some(0.1), Some(0.05), Some(0.04)]);

        let sample = ConvergenceLoop::new(config(10))
            .run(&mut hal, Axis::Cutter, PositionCommand::unconstrained(1.0, 1.0), below(0.1))
            .await
            .unwrap();

        assert_eq!(sample.position, 0.05);
        assert_eq!(hal.set_position_count(Axis::Cutter), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_missed_round_trips_times_out() {
        let mut hal = ScriptedAxisHal::default();

        let err = ConvergenceLoop::new(config(25))
            .run(&mut hal, Axis::Drive, PositionCommand::unconstrained(1.0, 1.0), |_| true)
            .await
            .unwrap_err();

        match err {
            ConvergenceError::Timeout { axis, command, iterations, last_sample } => {
                assert_eq!(axis, Axis::Drive);
                assert!(command.unwrap().query);
                assert_eq!(iterations, 25);
                assert_eq!(last_sample, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hal.set_position_count(Axis::Drive), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_sample_resets_miss_streak() {
        let mut hal = ScriptedAxisHal::default();
        hal.script(Axis::Cutter, [None, None, Some(1.0), None, None, Some(1.0), None, None, Some(0.0)]);

        let sample = ConvergenceLoop::new(config(3))
            .run(&mut hal, Axis::Cutter, PositionCommand::unconstrained(1.0, 1.0), below(0.5))
            .await
            .unwrap();

        assert_eq!(sample.position, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_limit_bounds_non_converging_loop() {
        let mut hal = ScriptedAxisHal::default();
        hal.script(Axis::Cutter, std::iter::repeat(Some(1.0)).take(100));

        let loop_ = ConvergenceLoop::new(ConvergenceConfig { iteration_limit: Some(7), ..config(50) });
        let err = loop_
            .run(&mut hal, Axis::Cutter, PositionCommand::unconstrained(1.0, 1.0), below(0.5))
            .await
            .unwrap_err();

        match err {
            ConvergenceError::Timeout { iterations, last_sample, .. } => {
                assert_eq!(iterations, 7);
                assert_eq!(last_sample.map(|s| s.position), Some(1.0));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutator_applies_to_every_send_and_query_is_forced() {
        let mut hal = ScriptedAxisHal::default();
        hal.script(Axis::Cutter, [None, Some(0.0)]);

        ConvergenceLoop::new(config(10))
            .run_with(
                &mut hal,
                Axis::Cutter,
                PositionCommand::unconstrained(1.0, 1.0),
                |command| command.kp_scale = Some(0.5),
                below(0.5))
            .await
            .unwrap();

        let commands: Vec<_> = hal.calls().iter().filter_map(|call| match call {
            Call::SetPosition { command, .. } => Some(*command),
            _ => None,
        }).collect();
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.query && c.kp_scale == Some(0.5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hal_error_propagates_immediately() {
        let mut hal = ScriptedAxisHal::default();
        hal.fail_next(Axis::Cutter, HalError::InternalError("bus off".into()));

        let err = ConvergenceLoop::new(config(10))
            .run(&mut hal, Axis::Cutter, PositionCommand::unconstrained(1.0, 1.0), |_| true)
            .await
            .unwrap_err();

        assert!(matches!(err, ConvergenceError::Hal(HalError::InternalError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_for_first_sample() {
        let mut hal = ScriptedAxisHal::default();
        hal.script(Axis::Drive, [None, None, Some(0.25)]);

        let sample = ConvergenceLoop::new(config(5)).poll(&mut hal, Axis::Drive).await.unwrap();

        assert_eq!(sample.position, 0.25);
        assert_eq!(hal.query_count(Axis::Drive), 3);
    }

    #[test]
    fn test_config_defaults_fill_missing_json_fields() {
        let config: ConvergenceConfig = serde_json::from_str(r#"{"miss_limit": 12}"#).unwrap();
        assert_eq!(config.miss_limit, 12);
        assert_eq!(config.iteration_limit, None);
        assert_eq!(config.rezero_attempt_limit, ConvergenceConfig::DEFAULT_REZERO_ATTEMPT_LIMIT);
    }
}
