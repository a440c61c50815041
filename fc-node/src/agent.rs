//! Fan node control state and its periodic jobs
//!
//! Ramp and tachometer state live together behind one mutex. Every job that
//! touches them, including the PWM write or the counter reset that goes with a
//! state change, runs inside that lock, so a tick never sees a command that is
//! only half applied.
//!
//! All methods on [`NodeAgent`] block. The async runners below call them
//! through `spawn_blocking`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fc_core::constants::timing;
use fc_core::hw::{PulseCounter, PwmOutput, TemperatureProbe};
use fc_core::link::{LinkHandle, LinkState};
use fc_core::shutdown::ShutdownReceiver;
use fc_core::{RampController, RampStep, Result, Tachometer, TargetChange, TemperatureUnit};
use fc_protocol::{ShelfStatus, TelemetryMessage};

// ============================================================================
// Control State
// ============================================================================

/// Duty cycle and tachometer state of one node
///
/// Ramp steps are previewed, written to the hardware, and only then committed.
/// A ramp that reaches its target leaves the tachometer window pending until
/// the pulse counter has actually been cleared.
#[derive(Debug, Clone)]
pub struct NodeControl {
    ramp: RampController,
    tach: Tachometer,
    ambient: Option<i32>,
    window_pending: bool,
    reassert_pending: bool,
}

impl NodeControl {
    pub fn new(initial_duty: u8, pulses_per_revolution: u32, now: Instant) -> Result<Self> {
        Ok(Self {
            ramp: RampController::new(initial_duty),
            tach: Tachometer::new(pulses_per_revolution, now)?,
            ambient: None,
            window_pending: false,
            reassert_pending: false,
        })
    }

    pub fn ramp(&self) -> &RampController {
        &self.ramp
    }

    pub fn tachometer(&self) -> &Tachometer {
        &self.tach
    }

    /// Whether the tachometer window still has to be reopened
    pub fn window_pending(&self) -> bool {
        self.window_pending
    }

    /// Accept a command; landing on the target marks the window for reopening
    pub fn command(&mut self, duty: u8) -> TargetChange {
        let change = self.ramp.set_target(duty as i64);
        self.window_pending = change.at_target();
        if change == TargetChange::Unchanged {
            self.reassert_pending = true;
        }
        change
    }

    /// Next ramp state and the step that leads to it, without applying either
    pub fn preview_tick(&self) -> (RampController, RampStep) {
        let mut next = self.ramp.clone();
        let step = next.tick();
        (next, step)
    }

    /// Duty that must be written before the previewed step can be committed
    pub fn pending_write(&self, step: RampStep) -> Option<u8> {
        step.duty().or_else(|| self.reassert_pending.then_some(self.ramp.current()))
    }

    /// Adopt a previewed step once its duty is on the hardware
    pub fn commit_tick(&mut self, next: RampController, step: RampStep) {
        self.ramp = next;
        self.reassert_pending = false;
        if let RampStep::Completed { .. } = step {
            self.window_pending = true;
        }
    }

    /// The held duty was written outside a ramp step
    pub fn reasserted(&mut self) {
        self.reassert_pending = false;
    }

    /// Start a fresh tachometer window; call after the counter tally is cleared
    pub fn reopen_window(&mut self, now: Instant) {
        self.tach.reset(now);
        self.window_pending = false;
    }

    pub fn record_pulses(&mut self, pulses: u64, now: Instant) -> u32 {
        self.tach.sample(pulses, now)
    }

    pub fn set_ambient(&mut self, ambient: i32) {
        self.ambient = Some(ambient);
    }

    pub fn status(&self) -> ShelfStatus {
        if self.ramp.is_ramping() {
            ShelfStatus::Ramping {
                applied: self.ramp.current(),
                from: self.ramp.previous_target(),
                to: self.ramp.desired_target(),
                ambient: self.ambient,
            }
        } else {
            ShelfStatus::Steady {
                duty: self.ramp.current(),
                rpm: self.tach.rpm(),
                ambient: self.ambient,
            }
        }
    }
}

// ============================================================================
// Agent
// ============================================================================

/// Hardware a node drives
pub struct NodeHardware {
    pub pwm: Box<dyn PwmOutput>,
    pub counter: Arc<dyn PulseCounter>,
    pub probe: Option<Arc<dyn TemperatureProbe>>,
}

/// Control state plus the hardware it is applied to
pub struct NodeAgent {
    control: Mutex<NodeControl>,
    pwm: Mutex<Box<dyn PwmOutput>>,
    counter: Arc<dyn PulseCounter>,
    probe: Option<Arc<dyn TemperatureProbe>>,
    unit: TemperatureUnit,
}

impl NodeAgent {
    pub fn new(control: NodeControl, hardware: NodeHardware, unit: TemperatureUnit) -> Self {
        Self {
            control: Mutex::new(control),
            pwm: Mutex::new(hardware.pwm),
            counter: hardware.counter,
            probe: hardware.probe,
            unit,
        }
    }

    pub fn has_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Snapshot of the control state
    pub fn control(&self) -> NodeControl {
        self.control.lock().clone()
    }

    pub fn status(&self) -> ShelfStatus {
        self.control.lock().status()
    }

    /// Apply one duty command from the coordinator
    ///
    /// Hardware failures leave the work pending; the next ramp tick retries it.
    pub fn apply_command(&self, duty: u8) -> Result<TargetChange> {
        let mut control = self.control.lock();
        let change = control.command(duty);

        if change == TargetChange::Unchanged {
            // Re-assert the held duty in case the output was disturbed
            self.pwm.lock().set_duty(control.ramp().current())?;
            control.reasserted();
        }
        if control.window_pending() {
            self.reopen_window(&mut control)?;
        }

        debug!(
            duty = duty,
            change = ?change,
            applied = control.ramp().current(),
            "Command applied"
        );
        Ok(change)
    }

    /// Advance the ramp by one step once it is on the PWM output
    ///
    /// A failed write leaves the ramp where it was, so the same step is
    /// attempted again on the next tick.
    pub fn ramp_tick(&self) -> Result<RampStep> {
        let mut control = self.control.lock();
        let (next, step) = control.preview_tick();

        if let Some(duty) = control.pending_write(step) {
            self.pwm.lock().set_duty(duty)?;
        }
        control.commit_tick(next, step);

        if let RampStep::Completed { duty } = step {
            info!(duty = duty, "Ramp complete");
        }
        if control.window_pending() {
            self.reopen_window(&mut control)?;
        }
        Ok(step)
    }

    /// Clear the hardware tally, then the software window
    fn reopen_window(&self, control: &mut NodeControl) -> Result<()> {
        self.counter.reset_tally()?;
        control.reopen_window(Instant::now());
        Ok(())
    }

    /// Read the pulse tally into the tachometer window
    pub fn sample_tachometer(&self) -> Result<u32> {
        let mut control = self.control.lock();
        let pulses = self.counter.tally()?;
        Ok(control.record_pulses(pulses, Instant::now()))
    }

    /// Refresh the ambient reading in the configured unit
    pub fn sample_ambient(&self) -> Result<Option<i32>> {
        let probe = match &self.probe {
            Some(probe) => probe,
            None => return Ok(None),
        };
        let ambient = self.unit.from_celsius(probe.read()?);
        self.control.lock().set_ambient(ambient);
        Ok(Some(ambient))
    }

    /// Put the output in its safe state
    pub fn release(&self) -> Result<()> {
        self.pwm.lock().release()
    }
}

// ============================================================================
// Periodic Runners
// ============================================================================

type Job = fn(&NodeAgent) -> Result<()>;

pub fn ramp_job(agent: &NodeAgent) -> Result<()> {
    agent.ramp_tick().map(|_| ())
}

pub fn tachometer_job(agent: &NodeAgent) -> Result<()> {
    agent.sample_tachometer().map(|_| ())
}

pub fn ambient_job(agent: &NodeAgent) -> Result<()> {
    agent.sample_ambient().map(|_| ())
}

fn interval(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Run `job` on the blocking pool every `period` until shutdown
pub async fn run_periodic(
    name: &'static str,
    period: Duration,
    agent: Arc<NodeAgent>,
    job: Job,
    mut shutdown: ShutdownReceiver,
) {
    debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task starting");
    let mut ticker = interval(period);
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            _ = fc_core::shutdown::requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let agent = agent.clone();
        match tokio::task::spawn_blocking(move || job(&agent)).await {
            Ok(Ok(())) => {
                if consecutive_errors > 0 {
                    debug!(task = name, "Recovered after {} errors", consecutive_errors);
                    consecutive_errors = 0;
                }
            }
            Ok(Err(e)) => {
                consecutive_errors += 1;
                if consecutive_errors == 1 || consecutive_errors % timing::ERROR_LOG_EVERY == 0 {
                    warn!(
                        task = name,
                        count = consecutive_errors,
                        kind = %e.kind(),
                        "{}",
                        e
                    );
                }
            }
            Err(e) => error!(task = name, "Task panicked: {}", e),
        }
    }

    debug!(task = name, "Periodic task stopped");
}

/// Publish the status string whenever it changes
///
/// A status that could not be delivered is sent again once the link is back.
pub async fn run_status_publisher(
    period: Duration,
    agent: Arc<NodeAgent>,
    link: LinkHandle,
    mut shutdown: ShutdownReceiver,
) {
    let mut ticker = interval(period);
    let mut last_sent: Option<String> = None;

    loop {
        tokio::select! {
            _ = fc_core::shutdown::requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        if link.state() != LinkState::Up {
            last_sent = None;
            continue;
        }

        let text = TelemetryMessage::Shelf(agent.status()).encode();
        if last_sent.as_deref() == Some(text.as_str()) {
            continue;
        }
        if link.publish(text.clone()) {
            debug!(status = %text, "Status published");
            last_sent = Some(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::FanctlError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// Records accepted writes; fails the next `failures` writes
    #[derive(Default)]
    struct RecordingPwm {
        writes: Arc<Mutex<Vec<u8>>>,
        failures: Arc<AtomicU32>,
    }

    impl PwmOutput for RecordingPwm {
        fn set_duty(&mut self, percent: u8) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(FanctlError::PwmWrite {
                    path: PathBuf::from("pwm0/duty_cycle"),
                    reason: "Input/output error".into(),
                });
            }
            self.writes.lock().push(percent);
            Ok(())
        }

        fn release(&mut self) -> Result<()> {
            self.set_duty(100)
        }
    }

    #[derive(Default)]
    struct FakeCounter {
        pulses: AtomicU64,
        resets: AtomicU64,
        reset_failures: AtomicU32,
    }

    impl PulseCounter for FakeCounter {
        fn tally(&self) -> Result<u64> {
            Ok(self.pulses.load(Ordering::SeqCst))
        }

        fn reset_tally(&self) -> Result<()> {
            if self.reset_failures.load(Ordering::SeqCst) > 0 {
                self.reset_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(FanctlError::CounterRead {
                    path: PathBuf::from("count0/count"),
                    reason: "Failed to reset: Input/output error".into(),
                });
            }
            self.pulses.store(0, Ordering::SeqCst);
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FixedProbe(f32);

    impl TemperatureProbe for FixedProbe {
        fn read(&self) -> Result<f32> {
            Ok(self.0)
        }
    }

    struct BrokenProbe;

    impl TemperatureProbe for BrokenProbe {
        fn read(&self) -> Result<f32> {
            Err(FanctlError::temperature("w1_slave", "CRC check failed"))
        }
    }

    fn agent(initial: u8) -> (NodeAgent, Arc<Mutex<Vec<u8>>>, Arc<FakeCounter>) {
        let (agent, writes, _, counter) = flaky_agent(initial);
        (agent, writes, counter)
    }

    fn flaky_agent(initial: u8) -> (NodeAgent, Arc<Mutex<Vec<u8>>>, Arc<AtomicU32>, Arc<FakeCounter>) {
        let pwm = RecordingPwm::default();
        let writes = pwm.writes.clone();
        let failures = pwm.failures.clone();
        let counter = Arc::new(FakeCounter::default());
        let hardware = NodeHardware {
            pwm: Box::new(pwm),
            counter: counter.clone(),
            probe: Some(Arc::new(FixedProbe(23.5))),
        };
        let control = NodeControl::new(initial, 2, Instant::now()).unwrap();
        (
            NodeAgent::new(control, hardware, TemperatureUnit::Fahrenheit),
            writes,
            failures,
            counter,
        )
    }

    #[test]
    fn test_command_then_ramp_to_target() {
        let (agent, writes, counter) = agent(100);
        assert_eq!(agent.apply_command(97).unwrap(), TargetChange::Started);

        assert_eq!(agent.ramp_tick().unwrap(), RampStep::Moved { duty: 99 });
        assert_eq!(agent.ramp_tick().unwrap(), RampStep::Moved { duty: 98 });
        assert_eq!(agent.ramp_tick().unwrap(), RampStep::Completed { duty: 97 });
        assert_eq!(agent.ramp_tick().unwrap(), RampStep::Idle);

        assert_eq!(*writes.lock(), vec![99, 98, 97]);
        assert_eq!(counter.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_text_while_ramping_and_steady() {
        let (agent, _, counter) = agent(50);
        agent.sample_ambient().unwrap();
        agent.apply_command(52).unwrap();
        agent.ramp_tick().unwrap();
        assert_eq!(
            TelemetryMessage::Shelf(agent.status()).encode(),
            "Fans 51% (50% -> 52%);74"
        );

        agent.ramp_tick().unwrap();
        assert_eq!(counter.resets.load(Ordering::SeqCst), 1);
        assert_eq!(
            TelemetryMessage::Shelf(agent.status()).encode(),
            "Fans 52% @ 0 RPM;74"
        );
    }

    #[test]
    fn test_unchanged_command_reasserts_and_resets_window() {
        let (agent, writes, counter) = agent(60);
        let opened = agent.control().tachometer().window_start();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(agent.apply_command(60).unwrap(), TargetChange::Unchanged);
        assert_eq!(*writes.lock(), vec![60]);
        assert_eq!(counter.resets.load(Ordering::SeqCst), 1);
        assert!(agent.control().tachometer().window_start() > opened);
    }

    #[test]
    fn test_failed_write_does_not_advance_ramp() {
        let (agent, writes, failures, counter) = flaky_agent(100);
        agent.apply_command(99).unwrap();
        failures.store(1, Ordering::SeqCst);

        assert!(agent.ramp_tick().is_err());
        assert_eq!(agent.control().ramp().current(), 100);
        assert!(agent.control().ramp().is_ramping());
        assert_eq!(counter.resets.load(Ordering::SeqCst), 0);

        assert_eq!(agent.ramp_tick().unwrap(), RampStep::Completed { duty: 99 });
        assert_eq!(*writes.lock(), vec![99]);
        assert_eq!(counter.resets.load(Ordering::SeqCst), 1);
        assert_eq!(agent.ramp_tick().unwrap(), RampStep::Idle);
        assert_eq!(*writes.lock(), vec![99]);
    }

    #[test]
    fn test_failed_tally_reset_is_retried() {
        let (agent, _, counter) = agent(50);
        agent.apply_command(51).unwrap();
        let opened = agent.control().tachometer().window_start();
        counter.reset_failures.store(1, Ordering::SeqCst);

        assert!(agent.ramp_tick().is_err());
        assert_eq!(agent.control().ramp().current(), 51);
        assert!(agent.control().window_pending());
        assert_eq!(agent.control().tachometer().window_start(), opened);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(agent.ramp_tick().unwrap(), RampStep::Idle);
        assert!(!agent.control().window_pending());
        assert_eq!(counter.resets.load(Ordering::SeqCst), 1);
        assert!(agent.control().tachometer().window_start() > opened);
    }

    #[test]
    fn test_failed_reassert_is_written_on_next_tick() {
        let (agent, writes, failures, counter) = flaky_agent(70);
        failures.store(1, Ordering::SeqCst);

        assert!(agent.apply_command(70).is_err());
        assert!(writes.lock().is_empty());
        assert!(agent.control().window_pending());

        assert_eq!(agent.ramp_tick().unwrap(), RampStep::Idle);
        assert_eq!(*writes.lock(), vec![70]);
        assert_eq!(counter.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_settled_command_resets_window() {
        let (agent, _, counter) = agent(50);
        agent.apply_command(60).unwrap();
        agent.ramp_tick().unwrap();
        assert_eq!(agent.apply_command(51).unwrap(), TargetChange::Settled);
        assert_eq!(counter.resets.load(Ordering::SeqCst), 1);
        assert!(!agent.control().ramp().is_ramping());
    }

    #[test]
    fn test_tachometer_sample_uses_tally() {
        let (agent, _, counter) = agent(100);
        counter.pulses.store(1_000_000, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert!(agent.sample_tachometer().unwrap() > 0);
    }

    #[test]
    fn test_ambient_failure_keeps_last_value() {
        let pwm = RecordingPwm::default();
        let hardware = NodeHardware {
            pwm: Box::new(pwm),
            counter: Arc::new(FakeCounter::default()),
            probe: Some(Arc::new(BrokenProbe)),
        };
        let control = NodeControl::new(100, 2, Instant::now()).unwrap();
        let agent = NodeAgent::new(control, hardware, TemperatureUnit::Celsius);

        assert!(agent.sample_ambient().is_err());
        match agent.status() {
            ShelfStatus::Steady { ambient, .. } => assert_eq!(ambient, None),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_release_goes_to_full_duty() {
        let (agent, writes, _) = agent(30);
        agent.release().unwrap();
        assert_eq!(writes.lock().last(), Some(&100));
    }
}
