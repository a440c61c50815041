//! Scheduling for the CPU and HDD controllers

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fc_core::link::LinkHandle;
use fc_core::shutdown::ShutdownReceiver;
use fc_core::HealthAction;
use fc_protocol::encode_duty_command;

use crate::cpu_control::CpuController;
use crate::drive_control::DriveController;
use crate::override_signal::OverrideSignal;

fn interval(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Read CPU temperatures, command the BMC and watch the CPU fan
pub async fn run_cpu_task(
    period: Duration,
    controller: Arc<Mutex<CpuController>>,
    override_signal: Arc<OverrideSignal>,
    display: LinkHandle,
    mut shutdown: ShutdownReceiver,
) {
    info!(period_ms = period.as_millis() as u64, "CPU control loop started");
    let mut ticker = interval(period);

    loop {
        tokio::select! {
            _ = fc_core::shutdown::requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let cpu = controller.clone();
        let cycle = match tokio::task::spawn_blocking(move || cpu.lock().run_cycle(Instant::now())).await {
            Ok(cycle) => cycle,
            Err(e) => {
                error!("CPU cycle panicked: {}", e);
                continue;
            }
        };

        if override_signal.update(cycle.override_active, Instant::now()) {
            warn!(temps = ?cycle.temps, "CPU over temperature, forcing drive poll");
        }

        if let HealthAction::HardReset { cause } = cycle.action {
            warn!(cause = ?cause, "BMC reset issued");
        }

        for message in cycle.telemetry() {
            display.publish(message.encode());
        }
    }

    info!("CPU control loop stopped");
}

/// Poll drive temperatures and command the fan nodes
///
/// Runs on its own cadence, or immediately when the override arms.
pub async fn run_hdd_task(
    period: Duration,
    controller: Arc<Mutex<DriveController>>,
    override_signal: Arc<OverrideSignal>,
    nodes: Vec<LinkHandle>,
    display: LinkHandle,
    mut shutdown: ShutdownReceiver,
) {
    info!(period_secs = period.as_secs(), enclosures = nodes.len(), "HDD control loop started");
    let mut ticker = interval(period);

    loop {
        tokio::select! {
            _ = fc_core::shutdown::requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
            _ = override_signal.armed() => {
                debug!("Override armed, polling drives now");
                ticker.reset();
            }
        }

        let override_active = override_signal.is_active();
        let drives = controller.clone();
        let cycle = match tokio::task::spawn_blocking(move || drives.lock().run_cycle(override_active)).await {
            Ok(cycle) => cycle,
            Err(e) => {
                error!("HDD cycle panicked: {}", e);
                continue;
            }
        };

        for decision in cycle.decisions.iter().filter(|d| d.send) {
            let Some(node) = nodes.get(decision.index) else {
                continue;
            };
            if node.publish(encode_duty_command(decision.duty)) {
                debug!(
                    enclosure = %node.name(),
                    hottest = decision.hottest,
                    duty = decision.duty,
                    override_active = override_active,
                    "Duty queued"
                );
                controller.lock().mark_sent(decision.index, decision.duty);
            }
        }

        display.publish(cycle.telemetry().encode());
    }

    info!("HDD control loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fc_core::hw::DriveSensors;
    use fc_core::link::{spawn_link, LinkOptions, LinkState, RetryPolicy};
    use fc_core::{DriveSlot, EnclosureSettings};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);
    const HOUR: Duration = Duration::from_secs(3600);

    struct CountingDrives {
        polls: Arc<AtomicUsize>,
    }

    impl DriveSensors for CountingDrives {
        fn drive_temperature(&self, _device: &str) -> fc_core::Result<i32> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(37)
        }
    }

    fn drives(polls: Arc<AtomicUsize>) -> Arc<Mutex<DriveController>> {
        let mut enclosure = EnclosureSettings::new("shelf0", "127.0.0.1:1");
        enclosure.drives = vec![DriveSlot {
            device: "/dev/da0".into(),
            position: 0,
        }];
        Arc::new(Mutex::new(DriveController::new(
            Box::new(CountingDrives { polls }),
            vec![enclosure],
        )))
    }

    /// Display link with its accepted peer, already connected
    async fn display(shutdown: ShutdownReceiver) -> (LinkHandle, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (link, _task) = spawn_link("display", addr, LinkOptions::telemetry(RetryPolicy::Unbounded), shutdown);
        let (peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut state = link.subscribe();
        timeout(WAIT, state.wait_for(|s| *s == LinkState::Up))
            .await
            .unwrap()
            .unwrap();
        (link, peer)
    }

    /// Read until `count` drive telemetry messages have arrived in total
    async fn wait_for_hdd_reports(peer: &mut TcpStream, seen: &mut String, count: usize) {
        let mut buf = [0u8; 256];
        while seen.matches("hdd;").count() < count {
            let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap();
            assert!(n > 0, "display peer closed");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Node link whose task has already stopped, so every publish is refused
    async fn closed_node(shutdown: ShutdownReceiver) -> LinkHandle {
        let (link, task) = spawn_link("shelf0", "127.0.0.1:1", LinkOptions::command(), shutdown);
        task.abort();
        let _ = task.await;
        link
    }

    #[tokio::test]
    async fn test_override_arming_polls_drives_immediately() {
        let (_shutdown_tx, shutdown_rx) = fc_core::shutdown::channel();
        let (display, mut peer) = display(shutdown_rx.clone()).await;
        let (node, _node_task) = spawn_link("shelf0", "127.0.0.1:1", LinkOptions::command(), shutdown_rx.clone());

        let polls = Arc::new(AtomicUsize::new(0));
        let override_signal = Arc::new(OverrideSignal::new(HOUR));
        tokio::spawn(run_hdd_task(
            HOUR,
            drives(polls.clone()),
            override_signal.clone(),
            vec![node],
            display,
            shutdown_rx,
        ));

        let mut seen = String::new();
        wait_for_hdd_reports(&mut peer, &mut seen, 1).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        // The next regular poll is an hour away
        assert!(override_signal.update(true, Instant::now()));
        wait_for_hdd_reports(&mut peer, &mut seen, 2).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refused_command_is_not_marked_sent() {
        let (_shutdown_tx, shutdown_rx) = fc_core::shutdown::channel();
        let (display, mut peer) = display(shutdown_rx.clone()).await;
        let node = closed_node(shutdown_rx.clone()).await;
        assert!(!node.publish("60"));

        let controller = drives(Arc::new(AtomicUsize::new(0)));
        tokio::spawn(run_hdd_task(
            HOUR,
            controller.clone(),
            Arc::new(OverrideSignal::new(HOUR)),
            vec![node],
            display,
            shutdown_rx,
        ));

        let mut seen = String::new();
        wait_for_hdd_reports(&mut peer, &mut seen, 1).await;
        let cycle = controller.lock().run_cycle(false);
        assert!(cycle.decisions[0].send);
    }

    #[tokio::test]
    async fn test_queued_command_is_marked_sent() {
        let (_shutdown_tx, shutdown_rx) = fc_core::shutdown::channel();
        let (display, mut peer) = display(shutdown_rx.clone()).await;
        let (node, _node_task) = spawn_link("shelf0", "127.0.0.1:1", LinkOptions::command(), shutdown_rx.clone());

        let controller = drives(Arc::new(AtomicUsize::new(0)));
        tokio::spawn(run_hdd_task(
            HOUR,
            controller.clone(),
            Arc::new(OverrideSignal::new(HOUR)),
            vec![node],
            display,
            shutdown_rx,
        ));

        let mut seen = String::new();
        wait_for_hdd_reports(&mut peer, &mut seen, 1).await;
        assert!(seen.contains("hdd;37"));
        let cycle = controller.lock().run_cycle(false);
        assert!(!cycle.decisions[0].send);
    }
}
