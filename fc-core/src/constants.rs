//! Constants and configuration defaults for fanctl
//!
//! Every default that appears in the settings structs lives here so the node,
//! the coordinator and the tests agree on one value.

use std::time::Duration;

/// Filesystem locations
pub mod paths {
    /// Configuration directory
    pub const CONFIG_DIR: &str = "/etc/fanctl";

    /// Node agent settings file
    pub const NODE_CONFIG_FILE: &str = "node.json";

    /// Coordinator settings file
    pub const COORDINATOR_CONFIG_FILE: &str = "coordinator.json";

    /// Marker socket whose presence means journald is available
    pub const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";

    /// Linux PWM class root
    pub const PWM_CLASS: &str = "/sys/class/pwm";

    /// Linux counter subsystem root
    pub const COUNTER_BUS: &str = "/sys/bus/counter/devices";

    /// 1-Wire device root
    pub const W1_DEVICES: &str = "/sys/bus/w1/devices";

    /// Linux hwmon root
    pub const HWMON_BASE: &str = "/sys/class/hwmon";
}

/// Environment variables
pub mod env {
    /// tracing filter directive
    pub const LOG_FILTER: &str = "FANCTL_LOG";

    /// Settings file path used when no `-c` flag is given
    pub const CONFIG_PATH: &str = "FANCTL_CONFIG";
}

/// Duty cycle limits
pub mod duty {
    /// Lowest duty cycle in percent
    pub const MIN: u8 = 0;

    /// Highest duty cycle in percent
    pub const MAX: u8 = 100;

    /// Duty applied at startup and on shutdown
    pub const SAFE: u8 = 100;
}

/// PWM output parameters
pub mod pwm {
    /// Default PWM carrier frequency in Hz
    pub const DEFAULT_FREQUENCY_HZ: u32 = 25_000;

    /// Nanoseconds per second, for the sysfs period/duty_cycle files
    pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
}

/// Tachometer defaults
pub mod tach {
    /// Pulses per fan revolution for standard 4-pin fans
    pub const DEFAULT_PULSES_PER_REVOLUTION: u32 = 2;
}

/// Temperature conversion
pub mod temperature {
    /// 1-Wire and hwmon report millidegrees
    pub const MILLIDEGREE_DIVISOR: f32 = 1000.0;

    /// Default CPU override threshold in °C
    pub const DEFAULT_CPU_OVERRIDE_C: i32 = 70;

    /// Attempts to get a CRC-valid 1-Wire frame before giving up
    pub const W1_READ_ATTEMPTS: u32 = 3;
}

/// CPU fan health monitor defaults
pub mod health {
    /// Rated maximum CPU fan speed
    pub const DEFAULT_MAX_RATED_RPM: u32 = 1800;

    /// Tolerance above the rated maximum before a reading is suspect
    pub const DEFAULT_RPM_MARGIN: f32 = 1.2;

    /// Consecutive suspect readings tolerated before a hard reset
    pub const DEFAULT_FAIL_THRESHOLD: u32 = 5;

    /// Unreadable period tolerated before a hard reset
    pub const DEFAULT_GRACE_SECS: u64 = 240;

    /// BMC sensor name of the CPU fan
    pub const DEFAULT_FAN_HEADER: &str = "FAN1";
}

/// Network defaults
pub mod network {
    /// Default address of the telemetry display
    pub const DEFAULT_DISPLAY_ADDR: &str = "10.0.10.100:10000";

    /// Inbound command connections accepted at once
    pub const MAX_CONNECTIONS: usize = 4;

    /// Messages buffered per outbound link before new ones are dropped
    pub const LINK_QUEUE_DEPTH: usize = 32;

    /// Reconnect attempts per outage on a bounded link
    pub const DISPLAY_RETRY_BUDGET: u32 = 5;
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Ramp step cadence
    pub const RAMP_INTERVAL_MS: u64 = 1000;

    /// Tachometer sample cadence
    pub const TACH_INTERVAL_MS: u64 = 1000;

    /// Ambient probe cadence
    pub const AMBIENT_INTERVAL_SECS: u64 = 10;

    /// Status publisher cadence
    pub const STATUS_INTERVAL_MS: u64 = 1000;

    /// Coordinator CPU task cadence
    pub const CONTROL_INTERVAL_MS: u64 = 1000;

    /// Coordinator HDD task cadence
    pub const HDD_POLL_INTERVAL_SECS: u64 = 60;

    /// Delay between reconnect attempts on a down link
    pub const RECONNECT_INTERVAL_SECS: u64 = 5;

    /// Bound on a single outbound connect
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Bound on a single outbound write
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Pause after a BMC fan mode change or reset
    pub const BMC_SETTLE_SECS: u64 = 5;

    /// Log only every Nth consecutive error in a control loop
    pub const ERROR_LOG_EVERY: u32 = 10;
}
