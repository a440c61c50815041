//! Stepped temperature to duty tables
//!
//! Unlike an interpolating fan curve, a mapping table holds each duty until the
//! temperature passes the next breakpoint. Anything hotter than the last
//! breakpoint gets the table's highest duty.

use serde::{Deserialize, Serialize};

use fc_error::{FanctlError, Result};

use crate::constants::duty;

/// One `(threshold, duty)` breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Highest temperature, in whole °C, served by this entry
    pub threshold_c: i32,
    /// Duty cycle for temperatures at or below the threshold
    pub duty_percent: u8,
}

impl MappingEntry {
    pub const fn new(threshold_c: i32, duty_percent: u8) -> Self {
        Self {
            threshold_c,
            duty_percent,
        }
    }
}

/// Validated, strictly increasing mapping table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DutyMappingTable {
    entries: Vec<MappingEntry>,
}

impl DutyMappingTable {
    /// Build a table, rejecting empty, unsorted, duplicate or out-of-range entries
    pub fn new(entries: Vec<MappingEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(FanctlError::invalid_config(
                "mapping table",
                "at least one entry is required",
            ));
        }

        for entry in &entries {
            if entry.duty_percent > duty::MAX {
                return Err(FanctlError::invalid_config(
                    "mapping table",
                    format!(
                        "duty {}% at {}°C is above {}%",
                        entry.duty_percent,
                        entry.threshold_c,
                        duty::MAX
                    ),
                ));
            }
        }

        for pair in entries.windows(2) {
            if pair[1].threshold_c <= pair[0].threshold_c {
                return Err(FanctlError::invalid_config(
                    "mapping table",
                    format!(
                        "thresholds must strictly increase ({}°C then {}°C)",
                        pair[0].threshold_c, pair[1].threshold_c
                    ),
                ));
            }
        }

        Ok(Self { entries })
    }

    /// Build from `(threshold, duty)` pairs
    pub fn from_pairs(pairs: &[(i32, u8)]) -> Result<Self> {
        Self::new(
            pairs
                .iter()
                .map(|&(threshold, duty)| MappingEntry::new(threshold, duty))
                .collect(),
        )
    }

    /// CPU table: 30..=55 °C onto 50..=100 % in 2 % steps
    pub fn default_cpu() -> Self {
        Self {
            entries: (0..=25)
                .map(|i| MappingEntry::new(30 + i, 50 + 2 * i as u8))
                .collect(),
        }
    }

    /// Drive bay table
    pub fn default_hdd() -> Self {
        Self {
            entries: [(36, 25), (37, 30), (38, 40), (39, 50), (40, 75), (41, 100)]
                .iter()
                .map(|&(t, d)| MappingEntry::new(t, d))
                .collect(),
        }
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    /// Highest duty in the table
    pub fn max_duty(&self) -> u8 {
        self.entries
            .iter()
            .map(|e| e.duty_percent)
            .max()
            .unwrap_or(duty::SAFE)
    }

    /// Duty for a whole-degree temperature
    pub fn lookup(&self, temperature_c: i32) -> u8 {
        self.entries
            .iter()
            .find(|e| e.threshold_c >= temperature_c)
            .map(|e| e.duty_percent)
            .unwrap_or_else(|| self.max_duty())
    }
}

impl<'de> Deserialize<'de> for DutyMappingTable {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let entries = Vec::<MappingEntry>::deserialize(deserializer)?;
        DutyMappingTable::new(entries).map_err(serde::de::Error::custom)
    }
}
