//! fanctl Core Library
//!
//! Closed-loop fan control for a multi-chassis storage server.
//!
//! # Features
//!
//! - **Ramp controller**: fixed one-percent-per-tick duty transitions on fan nodes
//! - **Tachometer**: windowed RPM estimate reset on every ramp completion
//! - **Mapping tables**: stepped temperature to duty lookup per zone
//! - **Health monitor**: CPU fan sanity checks with soft and hard BMC recovery
//! - **Links**: self-healing outbound TCP with bounded or unbounded retry
//!
//! # Module Structure
//!
//! - `engine/` - Ramp, tachometer and mapping table
//! - `monitor/` - CPU fan health and recovery
//! - `hw/` - Primitive traits and their sysfs/CLI implementations
//!
//! # Example
//!
//! ```
//! use fc_core::engine::DutyMappingTable;
//!
//! let cpu = DutyMappingTable::default_cpu();
//! assert_eq!(cpu.lookup(42), 74);
//! ```

// Grouped modules
pub mod engine;
pub mod hw;
pub mod monitor;

// Standalone modules
pub mod constants;
pub mod link;
pub mod logging;
pub mod settings;
pub mod shutdown;

pub use fc_error::{ErrorKind, FanctlError, Result};

pub use engine::{DutyMappingTable, MappingEntry, RampController, RampStep, Tachometer, TargetChange};
pub use hw::FanReading;
pub use link::{spawn_link, ConnectionHandle, LinkHandle, LinkOptions, LinkState, RetryPolicy};
pub use monitor::{CpuFanSupervisor, HardResetCause, HealthAction, HealthConfig, HealthMonitor, HealthState};
pub use settings::{
    load_coordinator_settings, load_node_settings, CoordinatorSettings, DriveSlot,
    EnclosureSettings, NodeSettings, TemperatureUnit,
};
