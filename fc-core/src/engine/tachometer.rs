//! Windowed tachometer RPM estimate
//!
//! Pulses accumulate from the last window reset. The estimate is the average
//! speed over the whole window, so it settles the longer a duty is held.

use std::time::Instant;

use fc_error::{FanctlError, Result};

const SECONDS_PER_MINUTE: f64 = 60.0;

/// Averaging RPM sampler over a resettable window
#[derive(Debug, Clone)]
pub struct Tachometer {
    pulses_per_revolution: u32,
    window_start: Instant,
    pulses: u64,
    last_rpm: u32,
}

impl Tachometer {
    /// Create a sampler whose window opens at `now`
    pub fn new(pulses_per_revolution: u32, now: Instant) -> Result<Self> {
        if pulses_per_revolution == 0 {
            return Err(FanctlError::invalid_config(
                "pulses_per_revolution",
                "must be non-zero",
            ));
        }
        Ok(Self {
            pulses_per_revolution,
            window_start: now,
            pulses: 0,
            last_rpm: 0,
        })
    }

    /// Last computed estimate
    pub fn rpm(&self) -> u32 {
        self.last_rpm
    }

    /// Pulses counted in the current window
    pub fn pulses(&self) -> u64 {
        self.pulses
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Record the running pulse tally for the current window and refresh the estimate
    ///
    /// `pulses` is the total since the window opened, not a delta. A window with
    /// no elapsed time keeps the prior estimate.
    pub fn sample(&mut self, pulses: u64, now: Instant) -> u32 {
        self.pulses = pulses;
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        if elapsed <= 0.0 {
            return self.last_rpm;
        }

        let rpm = pulses as f64 / elapsed / self.pulses_per_revolution as f64 * SECONDS_PER_MINUTE;
        self.last_rpm = rpm.min(u32::MAX as f64) as u32;
        self.last_rpm
    }

    /// Open a fresh window at `now`
    pub fn reset(&mut self, now: Instant) {
        self.pulses = 0;
        self.window_start = now;
    }
}
