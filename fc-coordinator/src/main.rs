//! fanctl coordinator daemon (fanctld)
//!
//! Runs on the head unit. Owns the CPU fan zone through the BMC and tells
//! every shelf's fan node which duty to run at.
//!
//! # Tasks
//! - **CPU**: core temperatures to BMC duty, CPU fan health and recovery
//! - **HDD**: drive temperatures to per-enclosure node duty
//! - **Links**: one command link per node, one telemetry link to the display
//!
//! A CPU over-temperature overrides the drive tables and forces an
//! immediate drive poll.

mod cpu_control;
mod drive_control;
mod override_signal;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use fc_core::constants::env;
use fc_core::hw::{CpuSensors, HwmonCpuSensors, IpmiTool, SmartctlDrives, SysctlCpuSensors};
use fc_core::link::{spawn_link, LinkOptions, RetryPolicy};
use fc_core::settings::{
    default_coordinator_settings_path, load_coordinator_settings, CoordinatorSettings, CpuSensorSource,
};
use fc_core::{CpuFanSupervisor, HealthMonitor};

use cpu_control::CpuController;
use drive_control::DriveController;
use override_signal::OverrideSignal;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// CLI
// ============================================================================

fn print_help() {
    eprintln!("fanctld {} - Storage server fan coordinator", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    fanctld [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!(
        "    -c, --config PATH   Settings file (default {})",
        default_coordinator_settings_path().display()
    );
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    FANCTL_CONFIG       Settings file, overridden by --config");
    eprintln!("    FANCTL_LOG          Log filter (trace, debug, info, warn, error)");
}

fn print_version() {
    println!("fanctld {}", VERSION);
}

/// Settings path from the command line, or None if the process should exit
fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = std::env::var_os(env::CONFIG_PATH).map(PathBuf::from);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                print_version();
                return None;
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
                config = Some(PathBuf::from(&args[i]));
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    Some(config.unwrap_or_else(default_coordinator_settings_path))
}

// ============================================================================
// Hardware
// ============================================================================

fn open_cpu_sensors(source: &CpuSensorSource) -> Result<Box<dyn CpuSensors>> {
    let sensors: Box<dyn CpuSensors> = match source {
        CpuSensorSource::Sysctl { cores: Some(cores) } => Box::new(SysctlCpuSensors::new(*cores)?),
        CpuSensorSource::Sysctl { cores: None } => Box::new(SysctlCpuSensors::detect()?),
        CpuSensorSource::Hwmon => Box::new(HwmonCpuSensors::discover()?),
    };
    Ok(sensors)
}

fn build_cpu_controller(settings: &CoordinatorSettings) -> Result<CpuController> {
    let sensors = open_cpu_sensors(&settings.cpu_sensors).context("opening CPU temperature sensors")?;
    let bmc = IpmiTool::new(Duration::from_secs(settings.bmc_settle_secs));
    let supervisor = CpuFanSupervisor::new(
        settings.health.fan_header.clone(),
        HealthMonitor::new(settings.health.to_config()),
    );

    Ok(CpuController::new(
        sensors,
        Box::new(bmc),
        settings.cpu_table.clone(),
        supervisor,
        settings.cpu_override_temp_c,
    ))
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // PHASE 0: Panics are logged before unwinding
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {}: {}", location, panic_info);
    }));

    // PHASE 1: Arguments
    let config_path = match parse_args() {
        Some(path) => path,
        None => return Ok(()),
    };

    // PHASE 2: Logging
    let sink = fc_core::logging::init();
    info!("STARTUP: fanctld {} starting", VERSION);
    info!("STARTUP: Logging to {}", sink);

    // PHASE 3: Settings
    let settings = load_coordinator_settings(&config_path)
        .with_context(|| format!("loading settings from {}", config_path.display()))?;
    info!(
        "STARTUP: Settings from {} ({} enclosures)",
        config_path.display(),
        settings.enclosures.len()
    );

    // PHASE 4: Controllers; fans go to full before the first decision
    let mut cpu = build_cpu_controller(&settings)?;
    let cpu = tokio::task::spawn_blocking(move || {
        match cpu.assert_manual_mode() {
            Ok(()) => info!("STARTUP: BMC in full manual mode"),
            Err(e) => warn!("STARTUP: Could not set BMC fan mode: {}", e),
        }
        cpu
    })
    .await
    .context("BMC startup task")?;
    let cpu = Arc::new(Mutex::new(cpu));

    let drives = Arc::new(Mutex::new(DriveController::new(
        Box::new(SmartctlDrives::new()),
        settings.enclosures.clone(),
    )));
    let hdd_period = Duration::from_secs(settings.hdd_poll_interval_secs);
    let override_signal = Arc::new(OverrideSignal::new(hdd_period));

    // PHASE 5: Signals
    let (shutdown_tx, shutdown_rx) = fc_core::shutdown::channel();
    fc_core::shutdown::spawn_signal_task(shutdown_tx);

    // PHASE 6: Links
    let reconnect = Duration::from_secs(settings.reconnect_interval_secs);
    let mut link_tasks = Vec::with_capacity(settings.enclosures.len() + 1);

    let (display, display_task) = spawn_link(
        "display",
        settings.display_addr.clone(),
        LinkOptions::telemetry(RetryPolicy::Bounded(settings.display_retry_budget))
            .with_reconnect_interval(reconnect),
        shutdown_rx.clone(),
    );
    link_tasks.push(display_task);
    info!("STARTUP: Reporting to {}", settings.display_addr);

    let mut nodes = Vec::with_capacity(settings.enclosures.len());
    for enclosure in &settings.enclosures {
        let (node, task) = spawn_link(
            enclosure.name.clone(),
            enclosure.node_addr.clone(),
            LinkOptions::command().with_reconnect_interval(reconnect),
            shutdown_rx.clone(),
        );
        info!(
            "STARTUP: Enclosure {} at {} ({} drives)",
            enclosure.name,
            enclosure.node_addr,
            enclosure.drives.len()
        );
        nodes.push(node);
        link_tasks.push(task);
    }

    // PHASE 7: Control loops
    let cpu_task = tokio::spawn(tasks::run_cpu_task(
        Duration::from_millis(settings.control_interval_ms),
        cpu.clone(),
        override_signal.clone(),
        display.clone(),
        shutdown_rx.clone(),
    ));
    let hdd_task = tokio::spawn(tasks::run_hdd_task(
        hdd_period,
        drives,
        override_signal,
        nodes,
        display,
        shutdown_rx.clone(),
    ));

    // PHASE 8: Shutdown
    let mut shutdown = shutdown_rx;
    fc_core::shutdown::requested(&mut shutdown).await;
    info!("SHUTDOWN: Stopping control loops");

    for task in [cpu_task, hdd_task].into_iter().chain(link_tasks) {
        if let Err(e) = task.await {
            error!("Task did not stop cleanly: {}", e);
        }
    }

    match tokio::task::spawn_blocking(move || cpu.lock().release()).await {
        Ok(Ok(())) => info!("SHUTDOWN: CPU fans left at full speed"),
        Ok(Err(e)) => error!("SHUTDOWN: Failed to set CPU fans to full: {}", e),
        Err(e) => error!("SHUTDOWN: Release task panicked: {}", e),
    }

    Ok(())
}
