//! CPU temperature and load sources
//!
//! FreeBSD exposes per-core temperatures through `sysctl dev.cpu.N.temperature`
//! (coretemp/amdtemp loaded). Linux exposes them through the coretemp or
//! k10temp hwmon chip. Load comes from sysinfo on both.

use std::fs;
use std::path::{Path, PathBuf};

use fc_error::{FanctlError, Result};
use regex::Regex;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::debug;

use super::{run_command, CpuSensors};
use crate::constants::{paths, temperature};

/// hwmon drivers that report CPU package/core temperatures
const CPU_HWMON_DRIVERS: &[&str] = &["coretemp", "k10temp", "zenpower"];

/// Global CPU load from sysinfo
///
/// The first refresh after construction has no baseline and reports 0.
struct LoadMeter {
    system: System,
}

impl LoadMeter {
    fn new() -> Self {
        let mut system =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
        system.refresh_cpu();
        Self { system }
    }

    fn sample(&mut self) -> f32 {
        self.system.refresh_cpu();
        self.system.global_cpu_info().cpu_usage()
    }
}

/// Keep the cores that could be read; fail only when none could
fn readable_cores(source: &str, readings: impl Iterator<Item = Result<f32>>) -> Result<Vec<f32>> {
    let mut temps = Vec::new();
    let mut failed = 0;
    for reading in readings {
        match reading {
            Ok(value) => temps.push(value),
            Err(e) => {
                failed += 1;
                debug!(source = source, "Core temperature unavailable: {}", e);
            }
        }
    }

    if temps.is_empty() {
        return Err(FanctlError::NoReadings(format!("{} ({} cores failed)", source, failed)));
    }
    Ok(temps)
}

// ============================================================================
// sysctl (FreeBSD)
// ============================================================================

/// Per-core temperatures from `sysctl dev.cpu.N.temperature`
pub struct SysctlCpuSensors {
    cores: usize,
    value: Regex,
    load: LoadMeter,
}

impl SysctlCpuSensors {
    pub fn new(cores: usize) -> Result<Self> {
        Self::with_load(cores, LoadMeter::new())
    }

    /// Number of cores from sysinfo
    pub fn detect() -> Result<Self> {
        let load = LoadMeter::new();
        let cores = load.system.cpus().len();
        Self::with_load(cores, load)
    }

    fn with_load(cores: usize, load: LoadMeter) -> Result<Self> {
        if cores == 0 {
            return Err(FanctlError::invalid_config("cpu_cores", "must be non-zero"));
        }
        Ok(Self {
            cores,
            value: Regex::new(r"^\s*(-?[0-9]+(?:\.[0-9]+)?)C?\s*$")
                .map_err(|e| FanctlError::config(e.to_string()))?,
            load,
        })
    }

    /// Parse `45.0C` style sysctl output
    fn parse(&self, output: &str) -> Option<f32> {
        self.value
            .captures(output)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl CpuSensors for SysctlCpuSensors {
    fn core_temperatures(&mut self) -> Result<Vec<f32>> {
        let readings = (0..self.cores).map(|core| {
            let key = format!("dev.cpu.{}.temperature", core);
            let output = run_command("sysctl", &["-n", &key])
                .map_err(|e| FanctlError::temperature(&key, e))?;
            self.parse(&output)
                .ok_or_else(|| FanctlError::temperature(&key, format!("unparsable {:?}", output.trim())))
        });
        readable_cores("sysctl", readings)
    }

    fn load_percent(&mut self) -> f32 {
        self.load.sample()
    }
}

// ============================================================================
// hwmon (Linux)
// ============================================================================

/// CPU temperatures from a coretemp/k10temp hwmon chip
pub struct HwmonCpuSensors {
    inputs: Vec<PathBuf>,
    load: LoadMeter,
}

impl HwmonCpuSensors {
    pub fn new(inputs: Vec<PathBuf>) -> Result<Self> {
        if inputs.is_empty() {
            return Err(FanctlError::NoReadings("CPU hwmon".into()));
        }
        Ok(Self {
            inputs,
            load: LoadMeter::new(),
        })
    }

    /// Find the first CPU hwmon chip and collect its core inputs
    pub fn discover() -> Result<Self> {
        Self::new(discover_inputs(Path::new(paths::HWMON_BASE))?)
    }
}

/// Core inputs of the first CPU chip under `base`
///
/// On coretemp only `Core N` labelled inputs are kept so the package sensor
/// does not count as a core. Other drivers keep every input.
fn discover_inputs(base: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(base).map_err(|e| FanctlError::FileRead {
        path: base.to_path_buf(),
        source: e,
    })?;

    let mut chips: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    chips.sort();

    for chip in chips {
        let name = fs::read_to_string(chip.join("name")).unwrap_or_default();
        let name = name.trim();
        if !CPU_HWMON_DRIVERS.contains(&name) {
            continue;
        }

        let mut inputs: Vec<(u32, PathBuf)> = fs::read_dir(&chip)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|e| {
                let file = e.file_name().to_string_lossy().into_owned();
                let index = file.strip_prefix("temp")?.strip_suffix("_input")?.parse().ok()?;
                Some((index, e.path()))
            })
            .filter(|(index, _)| {
                if name != "coretemp" {
                    return true;
                }
                fs::read_to_string(chip.join(format!("temp{}_label", index)))
                    .map(|label| label.trim().starts_with("Core"))
                    .unwrap_or(false)
            })
            .collect();
        inputs.sort();

        if !inputs.is_empty() {
            return Ok(inputs.into_iter().map(|(_, p)| p).collect());
        }
    }

    Err(FanctlError::NoReadings(format!("CPU hwmon under {}", base.display())))
}

impl CpuSensors for HwmonCpuSensors {
    fn core_temperatures(&mut self) -> Result<Vec<f32>> {
        let readings = self.inputs.iter().map(|path| {
            let content = fs::read_to_string(path)
                .map_err(|e| FanctlError::temperature(path.display().to_string(), e))?;
            content
                .trim()
                .parse::<i32>()
                .map(|milli| milli as f32 / temperature::MILLIDEGREE_DIVISOR)
                .map_err(|e| FanctlError::temperature(path.display().to_string(), e))
        });
        readable_cores("CPU hwmon", readings)
    }

    fn load_percent(&mut self) -> f32 {
        self.load.sample()
    }
}
