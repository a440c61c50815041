//! Drive temperatures via smartmontools
//!
//! Parses the `Temperature_Celsius` attribute of `smartctl -A`. The raw value
//! is the tenth column:
//!
//! ```text
//! 194 Temperature_Celsius     0x0022   114   100   000    Old_age   Always       -       36
//! ```
//!
//! smartctl's exit status is a bit mask. Bits 0 and 1 mean the command line
//! was bad or the device could not be opened. The higher bits report disk
//! health or logged errors, and the attribute table is still printed.

use fc_error::{FanctlError, Result};

use super::{run_command_accepting, DriveSensors};

const RAW_VALUE_COLUMN: usize = 9;

/// Exit status bits after which smartctl printed nothing usable
const FATAL_EXIT_BITS: i32 = 0b11;

#[derive(Debug, Clone)]
pub struct SmartctlDrives {
    program: String,
}

impl SmartctlDrives {
    pub fn new() -> Self {
        Self::with_program("smartctl")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SmartctlDrives {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw temperature from `smartctl -A` output
pub fn parse_smart_temperature(output: &str) -> Option<i32> {
    output
        .lines()
        .find(|line| line.contains("Temperature_Celsius"))
        .and_then(|line| line.split_whitespace().nth(RAW_VALUE_COLUMN))
        .and_then(|raw| raw.parse().ok())
}

impl DriveSensors for SmartctlDrives {
    fn drive_temperature(&self, device: &str) -> Result<i32> {
        let output = run_command_accepting(&self.program, &["-A", device], |code| {
            code & FATAL_EXIT_BITS == 0
        })
        .map_err(|e| FanctlError::temperature(device, e))?;
        parse_smart_temperature(&output)
            .ok_or_else(|| FanctlError::temperature(device, "no Temperature_Celsius attribute"))
    }
}
