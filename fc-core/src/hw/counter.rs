//! Linux counter subsystem pulse tally
//!
//! The count file of a counter device (for example
//! `/sys/bus/counter/devices/counter0/count0/count`) is read for the running
//! tally and written with `0` to reset it.

use std::fs;
use std::path::{Path, PathBuf};

use fc_error::{FanctlError, Result};

use super::PulseCounter;

#[derive(Debug, Clone)]
pub struct SysfsCounter {
    path: PathBuf,
}

impl SysfsCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, reason: impl Into<String>) -> FanctlError {
        FanctlError::CounterRead {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl PulseCounter for SysfsCounter {
    fn tally(&self) -> Result<u64> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| self.error(format!("Failed to read: {}", e)))?;
        content
            .trim()
            .parse::<u64>()
            .map_err(|e| self.error(format!("Failed to parse '{}': {}", content.trim(), e)))
    }

    fn reset_tally(&self) -> Result<()> {
        fs::write(&self.path, "0").map_err(|e| self.error(format!("Failed to reset: {}", e)))
    }
}
