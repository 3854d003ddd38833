use crate::axis_hal::{AxisHal, HalError, HalResult};
use crate::axis_hal_sim::SimulatedAxisHal;

#[derive(Default)]
pub struct AxisHalFactory {
    force_mock: bool,
    miss_probability: f64,
    seed: Option<u64>,
}

impl AxisHalFactory {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn new_maybe_mock(force_mock: bool) -> Self {
        Self { force_mock, ..Default::default() }
    }

    /// Fraction of simulated round trips that come back empty.
    pub fn with_miss_probability(mut self, miss_probability: f64) -> Self {
        self.miss_probability = miss_probability;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn create_hal(&self) -> HalResult<Box<dyn AxisHal>> {
        if !self.force_mock {
            return Err(HalError::DeviceNotConnected(
                "no motor controller transport is built in, run with --fake-hw".to_owned()));
        }
        let seed = self.seed.unwrap_or_else(rand::random);
        Ok(Box::new(SimulatedAxisHal::new(self.miss_probability, seed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_hardware_is_not_available() {
        let result = AxisHalFactory::new().create_hal();
        assert!(matches!(result, Err(HalError::DeviceNotConnected(_))));
    }

    #[test]
    fn test_mock_is_created_on_request() {
        let factory = AxisHalFactory::new_maybe_mock(true).with_miss_probability(0.1).with_seed(Some(3));
        assert!(factory.create_hal().is_ok());
    }
}
