//! Hardware primitives
//!
//! Every sensor, actuator and management command sits behind a small trait so
//! the control loops can be driven by mocks in tests. The concrete types in the
//! submodules wrap Linux sysfs classes and the usual storage-server CLIs.
//!
//! All primitives are blocking. Async callers run them through
//! `tokio::task::spawn_blocking`.

mod bmc;
mod command;
mod counter;
mod cpu;
mod drives;
mod probe;
mod pwm;

pub use bmc::IpmiTool;
pub use command::{run_command, run_command_accepting};
pub use counter::SysfsCounter;
pub use cpu::{HwmonCpuSensors, SysctlCpuSensors};
pub use drives::SmartctlDrives;
pub use probe::{celsius_to_fahrenheit, W1Probe};
pub use pwm::SysfsPwm;

use fc_error::Result;

/// A BMC fan sensor sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanReading {
    /// Measured speed
    Rpm(u32),
    /// Sensor reported nothing, or output could not be parsed
    NoReading,
    /// Sensor reported as disabled
    Disabled,
}

impl FanReading {
    /// Speed if the sensor produced one
    pub fn rpm(self) -> Option<u32> {
        match self {
            FanReading::Rpm(rpm) => Some(rpm),
            FanReading::NoReading | FanReading::Disabled => None,
        }
    }
}

/// PWM fan output
#[cfg_attr(test, mockall::automock)]
pub trait PwmOutput: Send {
    /// Apply a duty cycle in percent
    fn set_duty(&mut self, percent: u8) -> Result<()>;

    /// Leave the output in its safe state and give up the channel
    fn release(&mut self) -> Result<()>;
}

/// Hardware tachometer pulse counter
#[cfg_attr(test, mockall::automock)]
pub trait PulseCounter: Send + Sync {
    /// Pulses since the last reset
    fn tally(&self) -> Result<u64>;

    fn reset_tally(&self) -> Result<()>;
}

/// Single temperature probe, in °C
#[cfg_attr(test, mockall::automock)]
pub trait TemperatureProbe: Send + Sync {
    fn read(&self) -> Result<f32>;
}

/// Per-core CPU temperatures and overall load
#[cfg_attr(test, mockall::automock)]
pub trait CpuSensors: Send {
    /// One temperature per core in °C
    fn core_temperatures(&mut self) -> Result<Vec<f32>>;

    /// Overall CPU utilization in percent
    fn load_percent(&mut self) -> f32;
}

/// Drive temperature source
#[cfg_attr(test, mockall::automock)]
pub trait DriveSensors: Send + Sync {
    /// Current temperature of `device` in °C
    fn drive_temperature(&self, device: &str) -> Result<i32>;
}

/// Out-of-band management controller owning the CPU fans
#[cfg_attr(test, mockall::automock)]
pub trait ManagementController: Send {
    /// Put the fan controller in full/manual mode so duty writes stick
    fn set_full_manual_mode(&mut self) -> Result<()>;

    /// Cold reset the controller firmware
    fn cold_reset(&mut self) -> Result<()>;

    /// Apply a CPU zone duty cycle in percent
    fn set_cpu_duty(&mut self, percent: u8) -> Result<()>;

    /// Read one fan sensor by header name
    fn read_fan(&mut self, header: &str) -> Result<FanReading>;
}
