//! Linux PWM class output
//!
//! Drives `/sys/class/pwm/pwmchipN/pwmM`. Period and duty are written in
//! nanoseconds, so the percent duty is scaled against the configured period.

use std::fs;
use std::path::{Path, PathBuf};

use fc_error::{FanctlError, Result};
use tracing::{debug, info};

use super::PwmOutput;
use crate::constants::{duty, pwm};

/// One PWM channel of a sysfs pwmchip
#[derive(Debug)]
pub struct SysfsPwm {
    channel_dir: PathBuf,
    period_ns: u64,
    released: bool,
}

impl SysfsPwm {
    /// Export (if needed) and enable `channel` of `chip_dir` at `frequency_hz`,
    /// starting at `initial` percent
    pub fn open(chip_dir: &Path, channel: u32, frequency_hz: u32, initial: u8) -> Result<Self> {
        if frequency_hz == 0 {
            return Err(FanctlError::invalid_config("pwm_frequency_hz", "must be non-zero"));
        }

        let channel_dir = chip_dir.join(format!("pwm{}", channel));
        if !channel_dir.exists() {
            write_attr(&chip_dir.join("export"), &channel.to_string())?;
            debug!(channel = channel, chip = %chip_dir.display(), "Exported PWM channel");
        }

        let mut out = Self {
            channel_dir,
            period_ns: pwm::NANOS_PER_SECOND / frequency_hz as u64,
            released: false,
        };

        // duty_cycle must never exceed period, so drop it before shrinking the period
        write_attr(&out.attr("duty_cycle"), "0")?;
        write_attr(&out.attr("period"), &out.period_ns.to_string())?;
        out.set_duty(initial)?;
        write_attr(&out.attr("enable"), "1")?;

        info!(
            path = %out.channel_dir.display(),
            frequency_hz = frequency_hz,
            duty = initial,
            "PWM output enabled"
        );
        Ok(out)
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.channel_dir.join(name)
    }

    /// Duty cycle file value in nanoseconds for a percent duty
    pub fn duty_ns(&self, percent: u8) -> u64 {
        self.period_ns * percent.min(duty::MAX) as u64 / duty::MAX as u64
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| FanctlError::PwmWrite {
        path: path.to_path_buf(),
        reason: format!("Failed to write {}: {}", value, e),
    })
}

impl PwmOutput for SysfsPwm {
    fn set_duty(&mut self, percent: u8) -> Result<()> {
        let ns = self.duty_ns(percent);
        write_attr(&self.attr("duty_cycle"), &ns.to_string())
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        // The channel stays enabled so the fans keep spinning after exit
        self.set_duty(duty::SAFE)?;
        self.released = true;
        info!(path = %self.channel_dir.display(), "PWM output released at full duty");
        Ok(())
    }
}
