//! 1-Wire DS18B20 ambient probe
//!
//! The `w1_slave` file holds two lines:
//!
//! ```text
//! 4b 01 4b 46 7f ff 05 10 e1 : crc=e1 YES
//! 4b 01 4b 46 7f ff 05 10 e1 t=20687
//! ```
//!
//! The first line ends in `YES` when the CRC matched. The second carries the
//! temperature in millidegrees Celsius.

use std::fs;
use std::path::{Path, PathBuf};

use fc_error::{FanctlError, Result};

use super::TemperatureProbe;
use crate::constants::{paths, temperature};

#[derive(Debug, Clone)]
pub struct W1Probe {
    path: PathBuf,
}

impl W1Probe {
    /// Probe reading an explicit `w1_slave` path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Probe for the first `28-*` device under the 1-Wire bus
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new(paths::W1_DEVICES))
    }

    pub fn discover_in(bus: &Path) -> Result<Self> {
        let entries = fs::read_dir(bus).map_err(|e| FanctlError::FileRead {
            path: bus.to_path_buf(),
            source: e,
        })?;

        let mut devices: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("28-"))
            .map(|e| e.path().join("w1_slave"))
            .collect();
        devices.sort();

        devices
            .into_iter()
            .next()
            .map(Self::new)
            .ok_or_else(|| FanctlError::NoReadings(format!("1-Wire bus {}", bus.display())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn source_name(&self) -> String {
        self.path.display().to_string()
    }
}

enum Frame {
    CrcFailed,
    Malformed,
    Millidegrees(i32),
}

fn parse_frame(content: &str) -> Frame {
    let mut lines = content.lines();
    let crc_ok = lines.next().map(|l| l.trim_end().ends_with("YES")).unwrap_or(false);
    if !crc_ok {
        return Frame::CrcFailed;
    }

    lines
        .next()
        .and_then(|l| l.split_once("t="))
        .and_then(|(_, t)| t.trim().parse::<i32>().ok())
        .map(Frame::Millidegrees)
        .unwrap_or(Frame::Malformed)
}

impl TemperatureProbe for W1Probe {
    fn read(&self) -> Result<f32> {
        for _ in 0..temperature::W1_READ_ATTEMPTS {
            let content = fs::read_to_string(&self.path)
                .map_err(|e| FanctlError::temperature(self.source_name(), e))?;
            match parse_frame(&content) {
                Frame::CrcFailed => continue,
                Frame::Malformed => {
                    return Err(FanctlError::temperature(self.source_name(), "missing t= field"))
                }
                Frame::Millidegrees(milli) => {
                    return Ok(milli as f32 / temperature::MILLIDEGREE_DIVISOR)
                }
            }
        }
        Err(FanctlError::temperature(
            self.source_name(),
            format!("CRC check failed {} times", temperature::W1_READ_ATTEMPTS),
        ))
    }
}

pub fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GOOD: &str = "4b 01 4b 46 7f ff 05 10 e1 : crc=e1 YES\n4b 01 4b 46 7f ff 05 10 e1 t=20687\n";
    const BAD_CRC: &str = "4b 01 4b 46 7f ff 05 10 e1 : crc=e1 NO\n4b 01 4b 46 7f ff 05 10 e1 t=20687\n";

    #[test]
    fn test_read_good_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w1_slave");
        fs::write(&path, GOOD).unwrap();

        let celsius = W1Probe::new(&path).read().unwrap();
        assert!((celsius - 20.687).abs() < 0.001);
    }

    #[test]
    fn test_bad_crc_is_transient_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w1_slave");
        fs::write(&path, BAD_CRC).unwrap();

        let err = W1Probe::new(&path).read().unwrap_err();
        assert_eq!(err.kind(), fc_error::ErrorKind::TransientSensor);
    }

    #[test]
    fn test_discover_first_ds18b20() {
        let dir = TempDir::new().unwrap();
        for name in ["w1_bus_master1", "28-0000075a2b1c", "28-00000001aaaa"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        let probe = W1Probe::discover_in(dir.path()).unwrap();
        assert!(probe.path.ends_with("28-00000001aaaa/w1_slave"));

        let empty = TempDir::new().unwrap();
        assert!(W1Probe::discover_in(empty.path()).is_err());
    }

    #[test]
    fn test_fahrenheit() {
        assert_eq!(celsius_to_fahrenheit(0.0), 32.0);
        assert_eq!(celsius_to_fahrenheit(100.0), 212.0);
    }
}
