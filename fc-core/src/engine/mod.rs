//! Control engine modules
//!
//! Ramp controller and tachometer for fan nodes, mapping tables for the coordinator.

mod mapping;
mod ramp;
mod tachometer;

pub use mapping::{DutyMappingTable, MappingEntry};
pub use ramp::{RampController, RampStep, TargetChange};
pub use tachometer::Tachometer;
