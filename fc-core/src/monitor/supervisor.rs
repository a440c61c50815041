//! Executes [`HealthAction`]s against the management controller

use std::time::Instant;

use fc_error::Result;
use tracing::{debug, error, warn};

use super::{HealthAction, HealthMonitor, HealthState};
use crate::hw::{FanReading, ManagementController};

/// Reads the CPU fan sensor and carries out soft/hard recovery
#[derive(Debug)]
pub struct CpuFanSupervisor {
    header: String,
    monitor: HealthMonitor,
}

impl CpuFanSupervisor {
    pub fn new(header: impl Into<String>, monitor: HealthMonitor) -> Self {
        Self {
            header: header.into(),
            monitor,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn state(&self) -> HealthState {
        self.monitor.state()
    }

    /// Sample the fan sensor; a failed query counts as no reading
    pub fn read(&self, bmc: &mut dyn ManagementController) -> FanReading {
        match bmc.read_fan(&self.header) {
            Ok(reading) => reading,
            Err(e) => {
                debug!(header = %self.header, error = %e, "Fan sensor query failed");
                FanReading::NoReading
            }
        }
    }

    /// Feed `reading` to the monitor and carry out the resulting action
    ///
    /// `last_duty` is reapplied on soft recovery. Errors from the controller are
    /// returned after logging; the monitor state has already advanced.
    pub fn handle(
        &mut self,
        bmc: &mut dyn ManagementController,
        reading: FanReading,
        last_duty: Option<u8>,
        now: Instant,
    ) -> Result<HealthAction> {
        let action = self.monitor.observe(reading, now);

        match action {
            HealthAction::None => {}
            HealthAction::AwaitingFirmware => {
                warn!(header = %self.header, "CPU fan sensor unreadable, waiting for BMC");
            }
            HealthAction::SoftRecovery { count } => {
                warn!(
                    header = %self.header,
                    reading = ?reading,
                    count = count,
                    "CPU fan speed out of bounds, re-asserting fan mode"
                );
                self.execute(bmc.set_full_manual_mode())?;
                if let Some(duty) = last_duty {
                    self.execute(bmc.set_cpu_duty(duty))?;
                }
            }
            HealthAction::HardReset { cause } => {
                error!(header = %self.header, cause = ?cause, "Resetting BMC");
                self.execute(bmc.set_full_manual_mode())?;
                self.execute(bmc.cold_reset())?;
            }
        }

        Ok(action)
    }

    fn execute(&self, result: Result<()>) -> Result<()> {
        result.map_err(|e| {
            error!(header = %self.header, error = %e, kind = %e.kind(), "Recovery step failed");
            e
        })
    }
}
