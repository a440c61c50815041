/*
 * Integration tests for environment-driven settings
 *
 * These mutate process environment variables, so they run serially.
 */

use std::fs;

use fc_core::logging::filter_directive;
use fc_core::settings::{load_node_settings, TemperatureUnit};
use serial_test::serial;
use tempfile::TempDir;

#[test]
#[serial]
fn test_log_filter_from_environment() {
    std::env::set_var("FANCTL_LOG", "fc_core=debug");
    assert_eq!(filter_directive(), "fc_core=debug");

    std::env::remove_var("FANCTL_LOG");
    assert_eq!(filter_directive(), "info");
}

#[test]
#[serial]
fn test_node_settings_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("node.json");
    fs::write(
        &path,
        r#"{
            "listen_addr": "0.0.0.0:10000",
            "display_addr": "10.0.10.100:10000",
            "initial_duty": 80,
            "tachometer": { "pulses_per_revolution": 4 },
            "ambient": { "unit": "celsius", "w1_slave": "/sys/bus/w1/devices/28-01/w1_slave" }
        }"#,
    )
    .unwrap();

    let settings = load_node_settings(&path).unwrap();
    assert_eq!(settings.initial_duty, 80);
    assert_eq!(settings.tachometer.pulses_per_revolution, 4);
    assert_eq!(settings.tachometer.sample_interval_ms, 1000);
    assert_eq!(settings.ambient.unit, TemperatureUnit::Celsius);
    assert!(settings.ambient.w1_slave.is_some());
    assert_eq!(settings.max_connections, 4);
}

#[test]
#[serial]
fn test_malformed_json_is_configuration_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("node.json");
    fs::write(&path, "{ not json").unwrap();

    let err = load_node_settings(&path).unwrap_err();
    assert_eq!(err.kind(), fc_core::ErrorKind::Configuration);
}
