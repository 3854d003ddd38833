pub mod axis_hal;
pub mod axis_hal_factory;
pub mod axis_hal_sim;
pub mod convergence;
pub mod cutter;
pub mod drive;
pub mod sequencer;

#[cfg(test)]
mod axis_hal_script;
