//! Unified error handling for fanctl
//!
//! A single error type shared by the node agent, the coordinator and the core
//! library. Every variant maps onto one [`ErrorKind`] so the control loops can
//! decide between retrying, ignoring and escalating without matching on
//! individual variants.

use std::io;
use std::path::PathBuf;

/// Result type alias using FanctlError
pub type Result<T> = std::result::Result<T, FanctlError>;

/// Coarse failure classes the control loops act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A single bad or missing sensor reading; retried on the next cadence
    TransientSensor,
    /// Peer socket closed, unreachable or timed out; reconnect later
    Connectivity,
    /// PWM output or management firmware misbehaving
    ActuatorFault,
    /// Unparseable command input; ignored
    MalformedInput,
    /// Invalid settings; only fatal at startup
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransientSensor => "transient sensor",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::ActuatorFault => "actuator fault",
            ErrorKind::MalformedInput => "malformed input",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Unified error type for all fanctl operations
#[derive(thiserror::Error, Debug)]
pub enum FanctlError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Sensor Errors
    // ============================================================================
    #[error("Failed to read temperature from {source_name}: {reason}")]
    TemperatureRead {
        source_name: String,
        reason: String,
    },

    #[error("Failed to read pulse counter {path}: {reason}")]
    CounterRead {
        path: PathBuf,
        reason: String,
    },

    #[error("No temperature readings available from {0}")]
    NoReadings(String),

    // ============================================================================
    // Actuator and Firmware Errors
    // ============================================================================
    #[error("Failed to write PWM to {path}: {reason}")]
    PwmWrite {
        path: PathBuf,
        reason: String,
    },

    #[error("Management command `{command}` failed: {reason}")]
    Firmware {
        command: String,
        reason: String,
    },

    // ============================================================================
    // Transport Errors
    // ============================================================================
    #[error("Connection to {peer} failed: {reason}")]
    Connection {
        peer: String,
        reason: String,
    },

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ============================================================================
    // Input and Configuration Errors
    // ============================================================================
    #[error("Malformed command payload: {0:?}")]
    MalformedCommand(String),

    #[error("Malformed telemetry message: {0:?}")]
    MalformedTelemetry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },
}

impl FanctlError {
    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid configuration error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection error for a peer
    pub fn connection(peer: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a management firmware error
    pub fn firmware(command: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Firmware {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a temperature read error
    pub fn temperature(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TemperatureRead {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Classify this error for retry/ignore/escalate decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            FanctlError::TemperatureRead { .. }
            | FanctlError::CounterRead { .. }
            | FanctlError::NoReadings(_)
            | FanctlError::FileRead { .. } => ErrorKind::TransientSensor,

            FanctlError::Connection { .. }
            | FanctlError::NotConnected(_)
            | FanctlError::Timeout(_) => ErrorKind::Connectivity,

            FanctlError::PwmWrite { .. } | FanctlError::Firmware { .. } => ErrorKind::ActuatorFault,

            FanctlError::MalformedCommand(_) | FanctlError::MalformedTelemetry(_) => {
                ErrorKind::MalformedInput
            }

            FanctlError::Config(_) | FanctlError::InvalidConfig { .. } => ErrorKind::Configuration,
        }
    }
}

impl From<String> for FanctlError {
    fn from(s: String) -> Self {
        Self::Config(s)
    }
}
