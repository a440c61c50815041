//! CPU fan health monitoring and firmware recovery

mod health;
mod supervisor;

pub use health::{HardResetCause, HealthAction, HealthConfig, HealthMonitor, HealthState};
pub use supervisor::CpuFanSupervisor;
