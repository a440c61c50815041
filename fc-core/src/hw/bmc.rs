//! Supermicro BMC fan control through ipmitool
//!
//! Raw commands:
//!
//! | action | command |
//! |--------|---------|
//! | full fan mode | `raw 0x30 0x45 0x01 0x01` |
//! | CPU zone duty | `raw 0x30 0x70 0x66 0x01 0x00 <duty>` |
//! | firmware reset | `bmc reset cold` |
//!
//! The fan sensor value is the second `|` separated column of `ipmitool sdr`.

use std::thread;
use std::time::Duration;

use fc_error::Result;
use tracing::{debug, info};

use super::{run_command, FanReading, ManagementController};

const FULL_MODE: &[&str] = &["raw", "0x30", "0x45", "0x01", "0x01"];
const CPU_ZONE_DUTY: &[&str] = &["raw", "0x30", "0x70", "0x66", "0x01", "0x00"];
const COLD_RESET: &[&str] = &["bmc", "reset", "cold"];

/// `ipmitool` against the local BMC
#[derive(Debug, Clone)]
pub struct IpmiTool {
    program: String,
    settle: Duration,
}

impl IpmiTool {
    /// `settle` is slept after every mode change and reset
    pub fn new(settle: Duration) -> Self {
        Self {
            program: "ipmitool".to_string(),
            settle,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        run_command(&self.program, args)
    }

    fn settle(&self) {
        if !self.settle.is_zero() {
            debug!(secs = self.settle.as_secs(), "Waiting for BMC to settle");
            thread::sleep(self.settle);
        }
    }
}

/// Fan reading for `header` from `ipmitool sdr` output
///
/// ```text
/// FAN1             | 1200 RPM          | ok
/// FAN2             | no reading        | ns
/// FAN3             | disabled          | ns
/// ```
pub fn parse_sdr_fan(output: &str, header: &str) -> FanReading {
    let line = output.lines().find(|line| {
        line.split('|')
            .next()
            .map(|name| name.trim() == header)
            .unwrap_or(false)
    });

    let value = match line.and_then(|l| l.split('|').nth(1)) {
        Some(value) => value.trim(),
        None => return FanReading::NoReading,
    };

    let first = value.split_whitespace().next().unwrap_or_default();
    match first {
        "disabled" => FanReading::Disabled,
        "no" => FanReading::NoReading,
        other => other
            .parse::<f64>()
            .ok()
            .filter(|rpm| *rpm >= 0.0)
            .map(|rpm| FanReading::Rpm(rpm as u32))
            .unwrap_or(FanReading::NoReading),
    }
}

impl ManagementController for IpmiTool {
    fn set_full_manual_mode(&mut self) -> Result<()> {
        self.run(FULL_MODE)?;
        info!("BMC fan mode set to full");
        self.settle();
        Ok(())
    }

    fn cold_reset(&mut self) -> Result<()> {
        self.run(COLD_RESET)?;
        info!("BMC cold reset issued");
        self.settle();
        Ok(())
    }

    fn set_cpu_duty(&mut self, percent: u8) -> Result<()> {
        let duty = percent.to_string();
        let mut args: Vec<&str> = CPU_ZONE_DUTY.to_vec();
        args.push(duty.as_str());
        self.run(&args)?;
        Ok(())
    }

    fn read_fan(&mut self, header: &str) -> Result<FanReading> {
        let output = self.run(&["sdr"])?;
        Ok(parse_sdr_fan(&output, header))
    }
}
