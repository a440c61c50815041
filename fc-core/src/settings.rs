//! Node and coordinator settings
//!
//! Settings are JSON files. Every field has a default, so a missing file or a
//! partial file is valid; only values that fail [`validate`](NodeSettings::validate)
//! stop a process at startup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use fc_error::{FanctlError, Result};
use fc_protocol::DEFAULT_PORT;

use crate::constants::{duty, health, network, paths, pwm, tach, temperature, timing};
use crate::engine::DutyMappingTable;
use crate::monitor::HealthConfig;

// ============================================================================
// Shared
// ============================================================================

/// Unit used for displayed ambient temperatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Convert a Celsius reading to this unit, rounded to whole degrees
    pub fn from_celsius(self, celsius: f32) -> i32 {
        match self {
            TemperatureUnit::Celsius => celsius.round() as i32,
            TemperatureUnit::Fahrenheit => crate::hw::celsius_to_fahrenheit(celsius).round() as i32,
        }
    }
}

fn default_display_addr() -> String {
    network::DEFAULT_DISPLAY_ADDR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    timing::RECONNECT_INTERVAL_SECS
}

fn check_addr(field: &str, addr: &str) -> Result<()> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(FanctlError::invalid_config(
            field,
            format!("{:?} is not a host:port address", addr),
        )),
    }
}

fn check_nonzero(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(FanctlError::invalid_config(field, "must be non-zero"));
    }
    Ok(())
}

// ============================================================================
// Fan Node
// ============================================================================

/// PWM output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwmSettings {
    #[serde(default = "default_pwm_chip")]
    pub chip: PathBuf,

    #[serde(default)]
    pub channel: u32,

    #[serde(default = "default_pwm_frequency")]
    pub frequency_hz: u32,
}

fn default_pwm_chip() -> PathBuf {
    Path::new(paths::PWM_CLASS).join("pwmchip0")
}

fn default_pwm_frequency() -> u32 {
    pwm::DEFAULT_FREQUENCY_HZ
}

impl Default for PwmSettings {
    fn default() -> Self {
        Self {
            chip: default_pwm_chip(),
            channel: 0,
            frequency_hz: default_pwm_frequency(),
        }
    }
}

/// Tachometer input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TachometerSettings {
    #[serde(default = "default_counter_path")]
    pub counter_path: PathBuf,

    #[serde(default = "default_pulses_per_revolution")]
    pub pulses_per_revolution: u32,

    #[serde(default = "default_tach_interval")]
    pub sample_interval_ms: u64,
}

fn default_counter_path() -> PathBuf {
    Path::new(paths::COUNTER_BUS).join("counter0/count0/count")
}

fn default_pulses_per_revolution() -> u32 {
    tach::DEFAULT_PULSES_PER_REVOLUTION
}

fn default_tach_interval() -> u64 {
    timing::TACH_INTERVAL_MS
}

impl Default for TachometerSettings {
    fn default() -> Self {
        Self {
            counter_path: default_counter_path(),
            pulses_per_revolution: default_pulses_per_revolution(),
            sample_interval_ms: default_tach_interval(),
        }
    }
}

/// Ambient probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbientSettings {
    /// Explicit `w1_slave` path; the first DS18B20 on the bus when unset
    #[serde(default)]
    pub w1_slave: Option<PathBuf>,

    #[serde(default = "default_ambient_unit")]
    pub unit: TemperatureUnit,

    #[serde(default = "default_ambient_interval")]
    pub interval_secs: u64,
}

fn default_ambient_unit() -> TemperatureUnit {
    TemperatureUnit::Fahrenheit
}

fn default_ambient_interval() -> u64 {
    timing::AMBIENT_INTERVAL_SECS
}

impl Default for AmbientSettings {
    fn default() -> Self {
        Self {
            w1_slave: None,
            unit: default_ambient_unit(),
            interval_secs: default_ambient_interval(),
        }
    }
}

/// Fan node agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Address the command acceptor binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_display_addr")]
    pub display_addr: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Duty applied before the first command arrives
    #[serde(default = "default_initial_duty")]
    pub initial_duty: u8,

    #[serde(default = "default_ramp_interval")]
    pub ramp_interval_ms: u64,

    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    #[serde(default)]
    pub pwm: PwmSettings,

    #[serde(default)]
    pub tachometer: TachometerSettings,

    #[serde(default)]
    pub ambient: AmbientSettings,
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

fn default_max_connections() -> usize {
    network::MAX_CONNECTIONS
}

fn default_initial_duty() -> u8 {
    duty::SAFE
}

fn default_ramp_interval() -> u64 {
    timing::RAMP_INTERVAL_MS
}

fn default_status_interval() -> u64 {
    timing::STATUS_INTERVAL_MS
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            display_addr: default_display_addr(),
            max_connections: default_max_connections(),
            initial_duty: default_initial_duty(),
            ramp_interval_ms: default_ramp_interval(),
            status_interval_ms: default_status_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
            pwm: PwmSettings::default(),
            tachometer: TachometerSettings::default(),
            ambient: AmbientSettings::default(),
        }
    }
}

impl NodeSettings {
    pub fn validate(&self) -> Result<()> {
        check_addr("listen_addr", &self.listen_addr)?;
        check_addr("display_addr", &self.display_addr)?;
        check_nonzero("max_connections", self.max_connections as u64)?;
        if self.initial_duty > duty::MAX {
            return Err(FanctlError::invalid_config(
                "initial_duty",
                format!("{} is above {}", self.initial_duty, duty::MAX),
            ));
        }
        check_nonzero("ramp_interval_ms", self.ramp_interval_ms)?;
        check_nonzero("status_interval_ms", self.status_interval_ms)?;
        check_nonzero("reconnect_interval_secs", self.reconnect_interval_secs)?;
        check_nonzero("pwm.frequency_hz", self.pwm.frequency_hz as u64)?;
        check_nonzero(
            "tachometer.pulses_per_revolution",
            self.tachometer.pulses_per_revolution as u64,
        )?;
        check_nonzero("tachometer.sample_interval_ms", self.tachometer.sample_interval_ms)?;
        check_nonzero("ambient.interval_secs", self.ambient.interval_secs)?;
        Ok(())
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Where CPU core temperatures come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum CpuSensorSource {
    /// `sysctl dev.cpu.N.temperature`; core count detected when unset
    Sysctl {
        #[serde(default)]
        cores: Option<usize>,
    },
    /// coretemp/k10temp hwmon chip
    Hwmon,
}

impl Default for CpuSensorSource {
    fn default() -> Self {
        CpuSensorSource::Sysctl { cores: None }
    }
}

/// CPU fan health thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_fan_header")]
    pub fan_header: String,

    #[serde(default = "default_max_rated_rpm")]
    pub max_rated_rpm: u32,

    #[serde(default = "default_rpm_margin")]
    pub rpm_margin: f32,

    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

fn default_fan_header() -> String {
    health::DEFAULT_FAN_HEADER.to_string()
}

fn default_max_rated_rpm() -> u32 {
    health::DEFAULT_MAX_RATED_RPM
}

fn default_rpm_margin() -> f32 {
    health::DEFAULT_RPM_MARGIN
}

fn default_fail_threshold() -> u32 {
    health::DEFAULT_FAIL_THRESHOLD
}

fn default_grace_secs() -> u64 {
    health::DEFAULT_GRACE_SECS
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            fan_header: default_fan_header(),
            max_rated_rpm: default_max_rated_rpm(),
            rpm_margin: default_rpm_margin(),
            fail_threshold: default_fail_threshold(),
            grace_secs: default_grace_secs(),
        }
    }
}

impl HealthSettings {
    pub fn to_config(&self) -> HealthConfig {
        HealthConfig {
            max_rated_rpm: self.max_rated_rpm,
            margin: self.rpm_margin,
            fail_threshold: self.fail_threshold,
            grace: std::time::Duration::from_secs(self.grace_secs),
        }
    }
}

/// One drive bay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveSlot {
    /// Device node, e.g. `/dev/da3`
    pub device: String,

    /// Bay number; telemetry is ordered by it
    #[serde(default)]
    pub position: u32,
}

/// One enclosure: its fan node and its drive bays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclosureSettings {
    pub name: String,

    /// `host:port` of the enclosure's fan node
    pub node_addr: String,

    #[serde(default)]
    pub drives: Vec<DriveSlot>,

    #[serde(default = "DutyMappingTable::default_hdd")]
    pub hdd_table: DutyMappingTable,

    /// Run at full duty while the CPU override is active
    #[serde(default = "default_true")]
    pub follow_cpu_override: bool,
}

impl EnclosureSettings {
    pub fn new(name: impl Into<String>, node_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_addr: node_addr.into(),
            drives: Vec::new(),
            hdd_table: DutyMappingTable::default_hdd(),
            follow_cpu_override: true,
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default = "default_display_addr")]
    pub display_addr: String,

    #[serde(default = "default_display_retry_budget")]
    pub display_retry_budget: u32,

    #[serde(default = "default_control_interval")]
    pub control_interval_ms: u64,

    #[serde(default = "default_hdd_poll_interval")]
    pub hdd_poll_interval_secs: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_cpu_override")]
    pub cpu_override_temp_c: i32,

    #[serde(default = "DutyMappingTable::default_cpu")]
    pub cpu_table: DutyMappingTable,

    #[serde(default)]
    pub cpu_sensors: CpuSensorSource,

    #[serde(default)]
    pub health: HealthSettings,

    /// Pause after BMC mode changes and resets
    #[serde(default = "default_bmc_settle")]
    pub bmc_settle_secs: u64,

    #[serde(default = "default_enclosures")]
    pub enclosures: Vec<EnclosureSettings>,
}

fn default_display_retry_budget() -> u32 {
    network::DISPLAY_RETRY_BUDGET
}

fn default_control_interval() -> u64 {
    timing::CONTROL_INTERVAL_MS
}

fn default_hdd_poll_interval() -> u64 {
    timing::HDD_POLL_INTERVAL_SECS
}

fn default_cpu_override() -> i32 {
    temperature::DEFAULT_CPU_OVERRIDE_C
}

fn default_bmc_settle() -> u64 {
    timing::BMC_SETTLE_SECS
}

/// Head unit plus one shelf, nodes at `10.0.10.<index>`
fn default_enclosures() -> Vec<EnclosureSettings> {
    (0..2)
        .map(|i| EnclosureSettings::new(format!("shelf{}", i), format!("10.0.10.{}:{}", i, DEFAULT_PORT)))
        .collect()
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            display_addr: default_display_addr(),
            display_retry_budget: default_display_retry_budget(),
            control_interval_ms: default_control_interval(),
            hdd_poll_interval_secs: default_hdd_poll_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
            cpu_override_temp_c: default_cpu_override(),
            cpu_table: DutyMappingTable::default_cpu(),
            cpu_sensors: CpuSensorSource::default(),
            health: HealthSettings::default(),
            bmc_settle_secs: default_bmc_settle(),
            enclosures: default_enclosures(),
        }
    }
}

impl CoordinatorSettings {
    pub fn validate(&self) -> Result<()> {
        check_addr("display_addr", &self.display_addr)?;
        check_nonzero("display_retry_budget", self.display_retry_budget as u64)?;
        check_nonzero("control_interval_ms", self.control_interval_ms)?;
        check_nonzero("hdd_poll_interval_secs", self.hdd_poll_interval_secs)?;
        check_nonzero("reconnect_interval_secs", self.reconnect_interval_secs)?;
        check_nonzero("health.max_rated_rpm", self.health.max_rated_rpm as u64)?;
        if !(self.health.rpm_margin.is_finite() && self.health.rpm_margin >= 1.0) {
            return Err(FanctlError::invalid_config(
                "health.rpm_margin",
                "must be a finite value of at least 1.0",
            ));
        }
        if self.health.fan_header.trim().is_empty() {
            return Err(FanctlError::invalid_config("health.fan_header", "must not be empty"));
        }
        if let CpuSensorSource::Sysctl { cores: Some(0) } = self.cpu_sensors {
            return Err(FanctlError::invalid_config("cpu_sensors.cores", "must be non-zero"));
        }

        if self.enclosures.is_empty() {
            return Err(FanctlError::invalid_config(
                "enclosures",
                "at least one enclosure is required",
            ));
        }
        for (i, enclosure) in self.enclosures.iter().enumerate() {
            if enclosure.name.trim().is_empty() {
                return Err(FanctlError::invalid_config(
                    format!("enclosures[{}].name", i),
                    "must not be empty",
                ));
            }
            check_addr(&format!("enclosures[{}].node_addr", i), &enclosure.node_addr)?;
        }
        Ok(())
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Default node settings path
pub fn default_node_settings_path() -> PathBuf {
    Path::new(paths::CONFIG_DIR).join(paths::NODE_CONFIG_FILE)
}

/// Default coordinator settings path
pub fn default_coordinator_settings_path() -> PathBuf {
    Path::new(paths::CONFIG_DIR).join(paths::COORDINATOR_CONFIG_FILE)
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let content = fs::read_to_string(path).map_err(|e| FanctlError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| {
        FanctlError::config(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Load and validate node settings; a missing file yields defaults
pub fn load_node_settings(path: &Path) -> Result<NodeSettings> {
    let settings: NodeSettings = load_json(path)?;
    settings.validate()?;
    Ok(settings)
}

/// Load and validate coordinator settings; a missing file yields defaults
pub fn load_coordinator_settings(path: &Path) -> Result<CoordinatorSettings> {
    let settings: CoordinatorSettings = load_json(path)?;
    settings.validate()?;
    Ok(settings)
}
