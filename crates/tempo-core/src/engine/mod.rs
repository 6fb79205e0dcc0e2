//! The run engine: ramp scheduling, paced virtual users, metrics
//! aggregation, circuit breaking, and the run supervisor that composes
//! them (C3–C7).
pub mod aggregator;
pub mod circuit;
pub mod ramp;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod test_support;
pub mod virtual_user;

pub use aggregator::{Aggregator, AggregatorSnapshot, TimeSeriesPoint};
pub use circuit::CircuitFlag;
pub use supervisor::{start_run, stop_run, RunHandle};
