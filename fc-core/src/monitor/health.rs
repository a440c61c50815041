//! CPU fan health tracking
//!
//! Two independent tracks watch the BMC's CPU fan sensor:
//!
//! - **Unreadable**: the sensor reports nothing. This is normal for a while
//!   after a BMC reset, so only a gap longer than the grace period forces
//!   another reset.
//! - **Suspect**: the sensor reports a speed of 0 or one well above the fan's
//!   rating. A short run of these is answered by re-asserting the fan mode and
//!   duty; a longer run forces a reset.

use std::time::{Duration, Instant};

use crate::constants::health;
use crate::hw::FanReading;

/// Thresholds for [`HealthMonitor`]
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub max_rated_rpm: u32,
    pub margin: f32,
    pub fail_threshold: u32,
    pub grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_rated_rpm: health::DEFAULT_MAX_RATED_RPM,
            margin: health::DEFAULT_RPM_MARGIN,
            fail_threshold: health::DEFAULT_FAIL_THRESHOLD,
            grace: Duration::from_secs(health::DEFAULT_GRACE_SECS),
        }
    }
}

impl HealthConfig {
    /// Highest speed still considered plausible
    pub fn rpm_ceiling(&self) -> f32 {
        self.max_rated_rpm as f32 * self.margin
    }
}

/// Why a hard reset was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardResetCause {
    Unreadable,
    OutOfBounds,
}

/// What the caller should do after a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    /// Sensor just went silent; wait for the firmware to come back
    AwaitingFirmware,
    /// Re-assert fan mode and the last commanded duty
    SoftRecovery { count: u32 },
    /// Cold reset the BMC
    HardReset { cause: HardResetCause },
}

/// Current health for logging and telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unreadable { since: Instant },
    Suspect(u32),
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    consecutive_failures: u32,
    unreadable_since: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            unreadable_since: None,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn unreadable_since(&self) -> Option<Instant> {
        self.unreadable_since
    }

    pub fn state(&self) -> HealthState {
        match (self.unreadable_since, self.consecutive_failures) {
            (Some(since), _) => HealthState::Unreadable { since },
            (None, 0) => HealthState::Healthy,
            (None, n) => HealthState::Suspect(n),
        }
    }

    /// Feed one sample
    pub fn observe(&mut self, reading: FanReading, now: Instant) -> HealthAction {
        match reading.rpm() {
            None => self.observe_unreadable(now),
            Some(rpm) => {
                self.unreadable_since = None;
                self.observe_rpm(rpm)
            }
        }
    }

    fn observe_unreadable(&mut self, now: Instant) -> HealthAction {
        match self.unreadable_since {
            None => {
                self.unreadable_since = Some(now);
                HealthAction::AwaitingFirmware
            }
            Some(since) if now.saturating_duration_since(since) > self.config.grace => {
                self.unreadable_since = None;
                HealthAction::HardReset {
                    cause: HardResetCause::Unreadable,
                }
            }
            Some(_) => HealthAction::None,
        }
    }

    fn observe_rpm(&mut self, rpm: u32) -> HealthAction {
        let suspect = rpm == 0 || rpm as f32 > self.config.rpm_ceiling();
        if !suspect {
            self.consecutive_failures = 0;
            return HealthAction::None;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures > self.config.fail_threshold {
            self.consecutive_failures = 0;
            HealthAction::HardReset {
                cause: HardResetCause::OutOfBounds,
            }
        } else {
            HealthAction::SoftRecovery {
                count: self.consecutive_failures,
            }
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_five_bad_readings_are_soft() {
        let mut monitor = HealthMonitor::default();
        let now = Instant::now();
        for i in 1..=5 {
            assert_eq!(
                monitor.observe(FanReading::Rpm(0), now),
                HealthAction::SoftRecovery { count: i }
            );
        }
        assert_eq!(monitor.state(), HealthState::Suspect(5));
    }

    #[test]
    fn test_sixth_bad_reading_is_hard() {
        let mut monitor = HealthMonitor::default();
        let now = Instant::now();
        for _ in 0..5 {
            monitor.observe(FanReading::Rpm(5000), now);
        }
        assert_eq!(
            monitor.observe(FanReading::Rpm(5000), now),
            HealthAction::HardReset {
                cause: HardResetCause::OutOfBounds
            }
        );
        assert_eq!(monitor.consecutive_failures(), 0);
        assert_eq!(monitor.state(), HealthState::Healthy);
    }

    #[test]
    fn test_good_reading_resets_counter() {
        let mut monitor = HealthMonitor::default();
        let now = Instant::now();
        monitor.observe(FanReading::Rpm(0), now);
        monitor.observe(FanReading::Rpm(0), now);
        assert_eq!(monitor.observe(FanReading::Rpm(1200), now), HealthAction::None);
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[test]
    fn test_margin_boundary() {
        let mut monitor = HealthMonitor::default();
        let now = Instant::now();
        // 1800 * 1.2 = 2160
        assert_eq!(monitor.observe(FanReading::Rpm(2160), now), HealthAction::None);
        assert_eq!(
            monitor.observe(FanReading::Rpm(2161), now),
            HealthAction::SoftRecovery { count: 1 }
        );
    }

    #[test]
    fn test_unreadable_recovers_before_grace() {
        let mut monitor = HealthMonitor::default();
        let start = Instant::now();
        assert_eq!(
            monitor.observe(FanReading::NoReading, start),
            HealthAction::AwaitingFirmware
        );
        assert_eq!(
            monitor.observe(FanReading::Disabled, start + secs(100)),
            HealthAction::None
        );
        assert_eq!(
            monitor.observe(FanReading::Rpm(1100), start + secs(200)),
            HealthAction::None
        );
        assert!(monitor.unreadable_since().is_none());
    }

    #[test]
    fn test_unreadable_past_grace_resets_once() {
        let mut monitor = HealthMonitor::default();
        let start = Instant::now();
        monitor.observe(FanReading::NoReading, start);
        assert_eq!(
            monitor.observe(FanReading::NoReading, start + secs(240)),
            HealthAction::None
        );
        assert_eq!(
            monitor.observe(FanReading::NoReading, start + secs(241)),
            HealthAction::HardReset {
                cause: HardResetCause::Unreadable
            }
        );
        // A new outage window opens on the next silent sample
        assert_eq!(
            monitor.observe(FanReading::NoReading, start + secs(242)),
            HealthAction::AwaitingFirmware
        );
    }

    #[test]
    fn test_tracks_are_independent() {
        let mut monitor = HealthMonitor::default();
        let now = Instant::now();
        monitor.observe(FanReading::Rpm(0), now);
        monitor.observe(FanReading::Rpm(0), now);
        monitor.observe(FanReading::NoReading, now);
        assert_eq!(monitor.consecutive_failures(), 2);
        assert_eq!(
            monitor.observe(FanReading::Rpm(0), now),
            HealthAction::SoftRecovery { count: 3 }
        );
    }
}
