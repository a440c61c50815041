//! tracing subscriber setup shared by both binaries
//!
//! Logs go to the systemd journal when its socket exists, otherwise to stdout.
//! The filter comes from `FANCTL_LOG` (default `info`).

use std::fmt;
use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::constants::{env, paths};

const DEFAULT_FILTER: &str = "info";

/// Where log output ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    Journald,
    Stdout,
}

impl fmt::Display for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSink::Journald => f.write_str("systemd journal"),
            LogSink::Stdout => f.write_str("stdout"),
        }
    }
}

/// Filter directive from the environment
pub fn filter_directive() -> String {
    std::env::var(env::LOG_FILTER).unwrap_or_else(|_| DEFAULT_FILTER.to_string())
}

fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|e| {
        eprintln!("Invalid {} filter {:?}: {}, using {}", env::LOG_FILTER, directive, e, DEFAULT_FILTER);
        EnvFilter::new(DEFAULT_FILTER)
    })
}

fn init_stdout(directive: &str) {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(env_filter(directive))
        .init();
}

/// Install the global subscriber; call once at startup
pub fn init() -> LogSink {
    let directive = filter_directive();

    if !Path::new(paths::JOURNALD_SOCKET).exists() {
        init_stdout(&directive);
        return LogSink::Stdout;
    }

    match tracing_journald::layer() {
        Ok(journald) => {
            tracing_subscriber::registry()
                .with(journald)
                .with(env_filter(&directive))
                .init();
            LogSink::Journald
        }
        Err(e) => {
            eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            init_stdout(&directive);
            LogSink::Stdout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_falls_back() {
        let filter = env_filter("fanctl=loud");
        assert_eq!(filter.to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
    }

    #[test]
    fn test_sink_names() {
        assert_eq!(LogSink::Journald.to_string(), "systemd journal");
        assert_eq!(LogSink::Stdout.to_string(), "stdout");
    }
}
