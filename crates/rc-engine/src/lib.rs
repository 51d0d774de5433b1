// Rover soil calibration engine
// Drives the simulator over sampled soil parameters and scores each run
// against recorded telemetry.

pub mod accelerator;
pub mod driver;
pub mod executor;
pub mod scorer;

pub use accelerator::{AcceleratorProbe, NvidiaSmiProbe, StaticProbe};
pub use driver::{soil_point, soil_search_space, Driver};
pub use executor::{
    SimulatorCommand, SubTrialOutcome, SubTrialRunner, SubTrialState, TrialExecutor, DEFAULT_SIMULATOR,
};
pub use scorer::{score, score_file};

#[cfg(test)]
mod test_support;
