//! fanctl fan node agent (fanctl-node)
//!
//! Runs on each storage shelf controller. Drives the shelf fan bank through a
//! hardware PWM channel and reports its state to the display.
//!
//! # Tasks
//! - **Ramp**: moves the applied duty one percent per tick toward the target
//! - **Tachometer**: windowed RPM estimate from the pulse counter
//! - **Ambient**: 1-Wire intake temperature
//! - **Status**: publishes the shelf status line whenever it changes
//! - **Commands**: accepts duty commands from the coordinator
//!
//! On shutdown the fans are left at full speed.

mod agent;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use fc_core::constants::env;
use fc_core::hw::{PulseCounter, SysfsCounter, SysfsPwm, TemperatureProbe, W1Probe};
use fc_core::link::{spawn_link, LinkOptions, RetryPolicy};
use fc_core::settings::{default_node_settings_path, load_node_settings, NodeSettings};

use agent::{NodeAgent, NodeControl, NodeHardware};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// CLI
// ============================================================================

fn print_help() {
    eprintln!("fanctl-node {} - Storage shelf fan node agent", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    fanctl-node [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Settings file (default {})", default_node_settings_path().display());
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    FANCTL_CONFIG       Settings file, overridden by --config");
    eprintln!("    FANCTL_LOG          Log filter (trace, debug, info, warn, error)");
}

fn print_version() {
    println!("fanctl-node {}", VERSION);
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

    Some(config.unwrap_or_else(default_node_settings_path))
}

// ============================================================================
// Hardware
// ============================================================================

fn open_probe(settings: &NodeSettings) -> Option<Arc<dyn TemperatureProbe>> {
    let probe = match &settings.ambient.w1_slave {
        Some(path) => Ok(W1Probe::new(path)),
        None => W1Probe::discover(),
    };

    match probe {
        Ok(probe) => {
            info!("STARTUP: Ambient probe {}", probe.path().display());
            Some(Arc::new(probe))
        }
        Err(e) => {
            warn!("STARTUP: No ambient probe ({}), ambient will read --", e);
            None
        }
    }
}

fn open_hardware(settings: &NodeSettings) -> Result<NodeHardware> {
    let pwm = SysfsPwm::open(
        &settings.pwm.chip,
        settings.pwm.channel,
        settings.pwm.frequency_hz,
        settings.initial_duty,
    )
    .with_context(|| format!("opening PWM channel {} on {}", settings.pwm.channel, settings.pwm.chip.display()))?;
    info!(
        "STARTUP: PWM {} channel {} at {} Hz",
        settings.pwm.chip.display(),
        settings.pwm.channel,
        settings.pwm.frequency_hz
    );

    let counter = SysfsCounter::new(&settings.tachometer.counter_path);
    counter
        .reset_tally()
        .with_context(|| format!("resetting pulse counter {}", counter.path().display()))?;

    Ok(NodeHardware {
        pwm: Box::new(pwm),
        counter: Arc::new(counter),
        probe: open_probe(settings),
    })
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
    info!("STARTUP: fanctl-node {} starting", VERSION);
    info!("STARTUP: Logging to {}", sink);

    // PHASE 3: Settings
    let settings = load_node_settings(&config_path)
        .with_context(|| format!("loading settings from {}", config_path.display()))?;
    info!("STARTUP: Settings from {}", config_path.display());

    // PHASE 4: Command socket and hardware
    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.listen_addr))?;
    let hardware = open_hardware(&settings)?;
    let control = NodeControl::new(
        settings.initial_duty,
        settings.tachometer.pulses_per_revolution,
        Instant::now(),
    )?;
    let agent = Arc::new(NodeAgent::new(control, hardware, settings.ambient.unit));

    // PHASE 5: Signals
    let (shutdown_tx, shutdown_rx) = fc_core::shutdown::channel();
    fc_core::shutdown::spawn_signal_task(shutdown_tx);

    // PHASE 6: Display link and periodic tasks
    let reconnect = Duration::from_secs(settings.reconnect_interval_secs);
    let (display, display_task) = spawn_link(
        "display",
        settings.display_addr.clone(),
        LinkOptions::telemetry(RetryPolicy::Unbounded).with_reconnect_interval(reconnect),
        shutdown_rx.clone(),
    );
    info!("STARTUP: Reporting to {}", settings.display_addr);

    let mut tasks = vec![
        display_task,
        tokio::spawn(agent::run_periodic(
            "ramp",
            Duration::from_millis(settings.ramp_interval_ms),
            agent.clone(),
            agent::ramp_job,
            shutdown_rx.clone(),
        )),
        tokio::spawn(agent::run_periodic(
            "tachometer",
            Duration::from_millis(settings.tachometer.sample_interval_ms),
            agent.clone(),
            agent::tachometer_job,
            shutdown_rx.clone(),
        )),
        tokio::spawn(agent::run_status_publisher(
            Duration::from_millis(settings.status_interval_ms),
            agent.clone(),
            display,
            shutdown_rx.clone(),
        )),
    ];
    if agent.has_probe() {
        tasks.push(tokio::spawn(agent::run_periodic(
            "ambient",
            Duration::from_secs(settings.ambient.interval_secs),
            agent.clone(),
            agent::ambient_job,
            shutdown_rx.clone(),
        )));
    }

    // PHASE 7: Command server
    server::run_server(listener, agent.clone(), settings.max_connections, shutdown_rx).await;

    // PHASE 8: Shutdown
    for task in tasks {
        if let Err(e) = task.await {
            error!("Task did not stop cleanly: {}", e);
        }
    }

    let releasing = agent.clone();
    match tokio::task::spawn_blocking(move || releasing.release()).await {
        Ok(Ok(())) => info!("SHUTDOWN: Fans left at full speed"),
        Ok(Err(e)) => error!("SHUTDOWN: Failed to release PWM: {}", e),
        Err(e) => error!("SHUTDOWN: Release task panicked: {}", e),
    }

    Ok(())
}
