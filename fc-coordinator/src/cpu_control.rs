//! CPU zone control: core temperatures to BMC duty, plus fan health
//!
//! One [`CpuController::run_cycle`] per control tick. It blocks on CLI
//! tools, so the caller runs it on the blocking pool and publishes the
//! returned telemetry itself.

use std::time::Instant;

use tracing::{debug, info, warn};

use fc_core::constants::duty;
use fc_core::hw::{CpuSensors, ManagementController};
use fc_core::{CpuFanSupervisor, DutyMappingTable, FanReading, HealthAction};
use fc_protocol::{CpuFanStatus, TelemetryMessage};

/// Result of one CPU cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CpuCycle {
    /// Whole-degree core temperatures; empty when none could be read
    pub temps: Vec<i32>,
    /// Duty sent to the BMC this cycle, if any
    pub commanded: Option<u8>,
    /// Hottest core at or above the override threshold
    pub override_active: bool,
    pub fan: CpuFanStatus,
    pub action: HealthAction,
}

impl CpuCycle {
    /// Telemetry lines in publish order
    pub fn telemetry(&self) -> Vec<TelemetryMessage> {
        let mut messages = Vec::with_capacity(2);
        if !self.temps.is_empty() {
            messages.push(TelemetryMessage::CpuTemps(self.temps.clone()));
        }
        messages.push(TelemetryMessage::CpuFans(self.fan.clone()));
        messages
    }
}

pub struct CpuController {
    sensors: Box<dyn CpuSensors>,
    bmc: Box<dyn ManagementController>,
    table: DutyMappingTable,
    supervisor: CpuFanSupervisor,
    override_temp_c: i32,
    last_duty: Option<u8>,
}

impl CpuController {
    pub fn new(
        sensors: Box<dyn CpuSensors>,
        bmc: Box<dyn ManagementController>,
        table: DutyMappingTable,
        supervisor: CpuFanSupervisor,
        override_temp_c: i32,
    ) -> Self {
        Self {
            sensors,
            bmc,
            table,
            supervisor,
            override_temp_c,
            last_duty: None,
        }
    }

    /// Last duty the BMC accepted
    pub fn last_duty(&self) -> Option<u8> {
        self.last_duty
    }

    /// Put the CPU zone in manual mode at full speed
    pub fn assert_manual_mode(&mut self) -> fc_core::Result<()> {
        self.bmc.set_full_manual_mode()
    }

    /// Drive the CPU zone to full speed before exit
    pub fn release(&mut self) -> fc_core::Result<()> {
        self.bmc.set_cpu_duty(duty::SAFE)
    }

    pub fn run_cycle(&mut self, now: Instant) -> CpuCycle {
        let temps = match self.sensors.core_temperatures() {
            Ok(temps) => temps.into_iter().map(|t| t.trunc() as i32).collect(),
            Err(e) => {
                warn!(kind = %e.kind(), "CPU temperatures unavailable: {}", e);
                Vec::new()
            }
        };

        let hottest = temps.iter().copied().max();
        let commanded = hottest.and_then(|t| self.apply_mapping(t));
        let override_active = hottest.map_or(false, |t| t >= self.override_temp_c);

        let reading = self.supervisor.read(self.bmc.as_mut());
        let fan = CpuFanStatus {
            duty: self.last_duty.unwrap_or(duty::SAFE),
            rpm: reading.rpm(),
            load_percent: self.sensors.load_percent(),
        };

        let action = self.run_health(reading, now);

        CpuCycle {
            temps,
            commanded,
            override_active,
            fan,
            action,
        }
    }

    /// Command the BMC when the mapped duty differs from the last applied one
    fn apply_mapping(&mut self, hottest: i32) -> Option<u8> {
        let duty = self.table.lookup(hottest);
        if self.last_duty == Some(duty) {
            return None;
        }

        match self.bmc.set_cpu_duty(duty) {
            Ok(()) => {
                info!(zone = "cpu", temperature = hottest, duty = duty, "CPU duty changed");
                self.last_duty = Some(duty);
                Some(duty)
            }
            Err(e) => {
                warn!(zone = "cpu", duty = duty, kind = %e.kind(), "Failed to set CPU duty: {}", e);
                None
            }
        }
    }

    fn run_health(&mut self, reading: FanReading, now: Instant) -> HealthAction {
        let action = self.supervisor.handle(self.bmc.as_mut(), reading, self.last_duty, now);
        match action {
            Ok(action @ HealthAction::HardReset { .. }) => {
                // The reset leaves the zone at whatever the BMC defaults to
                self.last_duty = None;
                action
            }
            Ok(action) => action,
            Err(e) => {
                debug!(state = ?self.supervisor.state(), "Recovery incomplete: {}", e);
                HealthAction::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::{FanctlError, HealthConfig, HealthMonitor, Result};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        FullMode,
        ColdReset,
        Duty(u8),
    }

    struct FakeSensors {
        temps: Arc<Mutex<Option<Vec<f32>>>>,
    }

    impl CpuSensors for FakeSensors {
        fn core_temperatures(&mut self) -> Result<Vec<f32>> {
            self.temps
                .lock()
                .clone()
                .ok_or_else(|| FanctlError::temperature("dev.cpu.0.temperature", "unknown oid"))
        }

        fn load_percent(&mut self) -> f32 {
            12.5
        }
    }

    struct FakeBmc {
        calls: Arc<Mutex<Vec<Call>>>,
        fan: Arc<Mutex<FanReading>>,
    }

    impl ManagementController for FakeBmc {
        fn set_full_manual_mode(&mut self) -> Result<()> {
            self.calls.lock().push(Call::FullMode);
            Ok(())
        }

        fn cold_reset(&mut self) -> Result<()> {
            self.calls.lock().push(Call::ColdReset);
            Ok(())
        }

        fn set_cpu_duty(&mut self, percent: u8) -> Result<()> {
            self.calls.lock().push(Call::Duty(percent));
            Ok(())
        }

        fn read_fan(&mut self, _header: &str) -> Result<FanReading> {
            Ok(*self.fan.lock())
        }
    }

    struct Rig {
        controller: CpuController,
        temps: Arc<Mutex<Option<Vec<f32>>>>,
        calls: Arc<Mutex<Vec<Call>>>,
        fan: Arc<Mutex<FanReading>>,
    }

    fn rig() -> Rig {
        let temps = Arc::new(Mutex::new(Some(vec![41.7, 44.2])));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let fan = Arc::new(Mutex::new(FanReading::Rpm(1200)));
        let controller = CpuController::new(
            Box::new(FakeSensors { temps: temps.clone() }),
            Box::new(FakeBmc {
                calls: calls.clone(),
                fan: fan.clone(),
            }),
            DutyMappingTable::default_cpu(),
            CpuFanSupervisor::new("FAN1", HealthMonitor::new(HealthConfig::default())),
            70,
        );
        Rig {
            controller,
            temps,
            calls,
            fan,
        }
    }

    #[test]
    fn test_first_decision_always_issues() {
        let mut rig = rig();
        let cycle = rig.controller.run_cycle(Instant::now());

        assert_eq!(cycle.temps, vec![41, 44]);
        assert_eq!(cycle.commanded, Some(DutyMappingTable::default_cpu().lookup(44)));
        assert!(!cycle.override_active);
        assert_eq!(rig.calls.lock().len(), 1);
    }

    #[test]
    fn test_commands_are_edge_triggered() {
        let mut rig = rig();
        let now = Instant::now();
        rig.controller.run_cycle(now);
        let second = rig.controller.run_cycle(now + Duration::from_secs(1));
        assert_eq!(second.commanded, None);
        assert_eq!(rig.calls.lock().len(), 1);

        *rig.temps.lock() = Some(vec![52.0]);
        let third = rig.controller.run_cycle(now + Duration::from_secs(2));
        assert_eq!(third.commanded, Some(DutyMappingTable::default_cpu().lookup(52)));
        assert_eq!(rig.calls.lock().len(), 2);
    }

    #[test]
    fn test_override_threshold_is_inclusive() {
        let mut rig = rig();
        *rig.temps.lock() = Some(vec![65.0, 70.4]);
        let cycle = rig.controller.run_cycle(Instant::now());
        assert!(cycle.override_active);
        assert_eq!(cycle.commanded, Some(100));
    }

    #[test]
    fn test_missing_temperatures_still_run_health() {
        let mut rig = rig();
        *rig.temps.lock() = None;
        *rig.fan.lock() = FanReading::Rpm(5000);

        let cycle = rig.controller.run_cycle(Instant::now());
        assert!(cycle.temps.is_empty());
        assert_eq!(cycle.commanded, None);
        assert_eq!(cycle.action, HealthAction::SoftRecovery { count: 1 });
        assert_eq!(*rig.calls.lock(), vec![Call::FullMode]);
    }

    #[test]
    fn test_soft_recovery_reapplies_last_duty() {
        let mut rig = rig();
        let now = Instant::now();
        let duty = rig.controller.run_cycle(now).commanded.unwrap();

        *rig.fan.lock() = FanReading::Rpm(3000);
        rig.controller.run_cycle(now + Duration::from_secs(1));
        assert_eq!(
            *rig.calls.lock(),
            vec![Call::Duty(duty), Call::FullMode, Call::Duty(duty)]
        );
    }

    #[test]
    fn test_hard_reset_forces_next_decision() {
        let mut rig = rig();
        let now = Instant::now();
        rig.controller.run_cycle(now);

        *rig.fan.lock() = FanReading::Rpm(0);
        let mut reset = false;
        for i in 1..=6 {
            let cycle = rig.controller.run_cycle(now + Duration::from_secs(i));
            reset |= matches!(cycle.action, HealthAction::HardReset { .. });
        }
        assert!(reset);
        assert!(rig.calls.lock().contains(&Call::ColdReset));
        assert_eq!(rig.controller.last_duty(), None);
    }

    #[test]
    fn test_telemetry_lines() {
        let mut rig = rig();
        let cycle = rig.controller.run_cycle(Instant::now());
        let lines: Vec<String> = cycle.telemetry().iter().map(|m| m.encode()).collect();

        let duty = cycle.commanded.unwrap();
        assert_eq!(lines[0], "cpu;41 44");
        assert_eq!(lines[1], format!("cpu_fans;Fans {}% @ 1200 RPM;12.5", duty));
    }
}
