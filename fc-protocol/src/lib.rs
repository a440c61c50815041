//! Plain-text wire formats for fanctl
//!
//! Two channels exist:
//!
//! - **Command channel** (coordinator → fan node): the desired duty cycle as a
//!   decimal ASCII integer with no delimiter.
//! - **Telemetry channel** (coordinator and nodes → display): one UTF-8
//!   `<label>;<payload>` string per message. Shelf status strings carry no
//!   label; the display tells them apart by the peer address.

use std::fmt;

use fc_error::{FanctlError, Result};

/// Maximum bytes read from a socket per message
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Default TCP port for both channels
pub const DEFAULT_PORT: u16 = 10000;

/// Lowest accepted duty cycle
pub const DUTY_MIN: u8 = 0;

/// Highest accepted duty cycle
pub const DUTY_MAX: u8 = 100;

/// Display sentinel for a value that could not be read
pub const MISSING_VALUE: &str = "--";

// ============================================================================
// Command Channel
// ============================================================================

/// Encode a duty-cycle command for the wire
pub fn encode_duty_command(duty: u8) -> String {
    duty.min(DUTY_MAX).to_string()
}

/// Parse a single duty-cycle token
///
/// Out-of-range values are clamped to `DUTY_MIN..=DUTY_MAX`, including values
/// too large to fit in an integer. Anything non-numeric is rejected.
pub fn parse_duty_token(token: &str) -> Result<u8> {
    let token = token.trim();
    let (negative, digits) = match token.as_bytes().first() {
        Some(b'-') => (true, &token[1..]),
        Some(b'+') => (false, &token[1..]),
        _ => (false, token),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FanctlError::MalformedCommand(token.to_string()));
    }

    if negative {
        return Ok(DUTY_MIN);
    }

    let value = digits.parse::<u64>().unwrap_or(u64::MAX);
    Ok(value.min(DUTY_MAX as u64) as u8)
}

/// Parse every duty-cycle token in one received chunk, in order
///
/// A chunk normally holds one bare integer. Whitespace-separated tokens are
/// also accepted so newline-terminated senders and coalesced reads still apply
/// each command in receipt order.
pub fn parse_duty_commands(chunk: &[u8]) -> Vec<Result<u8>> {
    String::from_utf8_lossy(chunk)
        .split_whitespace()
        .map(parse_duty_token)
        .collect()
}

// ============================================================================
// Telemetry Channel
// ============================================================================

/// CPU fan status published by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct CpuFanStatus {
    pub duty: u8,
    pub rpm: Option<u32>,
    pub load_percent: f32,
}

/// Enclosure fan status published by a fan node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShelfStatus {
    /// A ramp is in flight from `from` to `to`, currently applying `applied`
    Ramping {
        applied: u8,
        from: u8,
        to: u8,
        ambient: Option<i32>,
    },
    /// Duty cycle settled, with the averaged tachometer reading
    Steady {
        duty: u8,
        rpm: u32,
        ambient: Option<i32>,
    },
}

/// One telemetry message
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMessage {
    /// Per-core CPU temperatures
    CpuTemps(Vec<i32>),
    /// Per-drive temperatures; `None` is rendered as the `--` sentinel
    HddTemps(Vec<Option<i32>>),
    /// CPU fan duty, speed and overall CPU load
    CpuFans(CpuFanStatus),
    /// Unlabeled shelf status string
    Shelf(ShelfStatus),
}

impl TelemetryMessage {
    /// Wire label, or `None` for unlabeled shelf messages
    pub fn label(&self) -> Option<&'static str> {
        match self {
            TelemetryMessage::CpuTemps(_) => Some("cpu"),
            TelemetryMessage::HddTemps(_) => Some("hdd"),
            TelemetryMessage::CpuFans(_) => Some("cpu_fans"),
            TelemetryMessage::Shelf(_) => None,
        }
    }

    /// Encode for the wire
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse a message received from the wire
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let malformed = || FanctlError::MalformedTelemetry(text.to_string());

        if text.starts_with("Fans ") {
            return parse_shelf(text).map(TelemetryMessage::Shelf).ok_or_else(malformed);
        }

        let (label, payload) = text.split_once(';').ok_or_else(malformed)?;
        match label {
            "cpu" => payload
                .split_whitespace()
                .map(|t| t.parse::<i32>().map_err(|_| malformed()))
                .collect::<Result<Vec<_>>>()
                .map(TelemetryMessage::CpuTemps),
            "hdd" => payload
                .split_whitespace()
                .map(|t| match t {
                    MISSING_VALUE => Ok(None),
                    t => t.parse::<i32>().map(Some).map_err(|_| malformed()),
                })
                .collect::<Result<Vec<_>>>()
                .map(TelemetryMessage::HddTemps),
            "cpu_fans" => parse_cpu_fans(payload)
                .map(TelemetryMessage::CpuFans)
                .ok_or_else(malformed),
            _ => Err(malformed()),
        }
    }
}

fn join_values<T: fmt::Display>(values: impl Iterator<Item = Option<T>>) -> String {
    values
        .map(|v| v.map(|v| v.to_string()).unwrap_or_else(|| MISSING_VALUE.to_string()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn optional<T: fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| MISSING_VALUE.to_string())
}

impl fmt::Display for ShelfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ShelfStatus::Ramping { applied, from, to, ambient } => write!(
                f,
                "Fans {}% ({}% -> {}%);{}",
                applied,
                from,
                to,
                optional(ambient)
            ),
            ShelfStatus::Steady { duty, rpm, ambient } => {
                write!(f, "Fans {}% @ {} RPM;{}", duty, rpm, optional(ambient))
            }
        }
    }
}

impl fmt::Display for TelemetryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryMessage::CpuTemps(temps) => {
                write!(f, "cpu;{}", join_values(temps.iter().map(Some)))
            }
            TelemetryMessage::HddTemps(temps) => {
                write!(f, "hdd;{}", join_values(temps.iter().copied()))
            }
            TelemetryMessage::CpuFans(status) => write!(
                f,
                "cpu_fans;Fans {}% @ {} RPM;{:.1}",
                status.duty,
                optional(status.rpm),
                status.load_percent
            ),
            TelemetryMessage::Shelf(status) => write!(f, "{}", status),
        }
    }
}

fn parse_percent(text: &str) -> Option<u8> {
    text.strip_suffix('%')?.parse().ok()
}

fn parse_ambient(text: &str) -> Option<Option<i32>> {
    match text {
        MISSING_VALUE => Some(None),
        t => t.parse().ok().map(Some),
    }
}

/// `Fans 62% (50% -> 75%);74` or `Fans 75% @ 1800 RPM;74`
fn parse_shelf(text: &str) -> Option<ShelfStatus> {
    let (status, ambient) = text.rsplit_once(';')?;
    let ambient = parse_ambient(ambient)?;
    let mut words = status.strip_prefix("Fans ")?.split_whitespace();
    let first = parse_percent(words.next()?)?;

    match words.next()? {
        "@" => {
            let rpm = words.next()?.parse().ok()?;
            (words.next()? == "RPM").then_some(ShelfStatus::Steady {
                duty: first,
                rpm,
                ambient,
            })
        }
        from => {
            let from = parse_percent(from.strip_prefix('(')?)?;
            (words.next()? == "->").then_some(())?;
            let to = parse_percent(words.next()?.strip_suffix(')')?)?;
            Some(ShelfStatus::Ramping {
                applied: first,
                from,
                to,
                ambient,
            })
        }
    }
}

/// `Fans 60% @ 1200 RPM;12.5`
fn parse_cpu_fans(payload: &str) -> Option<CpuFanStatus> {
    let (status, load) = payload.rsplit_once(';')?;
    let mut words = status.strip_prefix("Fans ")?.split_whitespace();
    let duty = parse_percent(words.next()?)?;
    (words.next()? == "@").then_some(())?;
    let rpm = match words.next()? {
        MISSING_VALUE => None,
        t => Some(t.parse().ok()?),
    };
    (words.next()? == "RPM").then_some(())?;
    Some(CpuFanStatus {
        duty,
        rpm,
        load_percent: load.parse().ok()?,
    })
}
