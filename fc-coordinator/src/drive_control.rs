//! Drive bay control: per-enclosure HDD temperatures to fan node duty

use tracing::{debug, info, warn};

use fc_core::constants::duty;
use fc_core::hw::DriveSensors;
use fc_core::EnclosureSettings;
use fc_protocol::TelemetryMessage;

/// Decision for one enclosure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosureDecision {
    /// Index into the configured enclosures
    pub index: usize,
    /// Hottest readable drive, 0 when none could be read
    pub hottest: i32,
    pub duty: u8,
    /// Whether this duty must be sent to the node
    pub send: bool,
}

/// Result of one HDD poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveCycle {
    /// Enclosure order, then slot position; `None` for failed reads
    pub temps: Vec<Option<i32>>,
    pub decisions: Vec<EnclosureDecision>,
}

impl DriveCycle {
    pub fn telemetry(&self) -> TelemetryMessage {
        TelemetryMessage::HddTemps(self.temps.clone())
    }
}

pub struct DriveController {
    drives: Box<dyn DriveSensors>,
    enclosures: Vec<EnclosureSettings>,
    last_sent: Vec<Option<u8>>,
}

impl DriveController {
    pub fn new(drives: Box<dyn DriveSensors>, mut enclosures: Vec<EnclosureSettings>) -> Self {
        for enclosure in &mut enclosures {
            enclosure.drives.sort_by_key(|slot| slot.position);
        }
        let last_sent = vec![None; enclosures.len()];
        Self {
            drives,
            enclosures,
            last_sent,
        }
    }

    pub fn enclosures(&self) -> &[EnclosureSettings] {
        &self.enclosures
    }

    /// Poll every drive and decide each enclosure's duty
    pub fn run_cycle(&self, override_active: bool) -> DriveCycle {
        let mut temps = Vec::new();
        let mut decisions = Vec::with_capacity(self.enclosures.len());

        for (index, enclosure) in self.enclosures.iter().enumerate() {
            let mut hottest = 0;
            for slot in &enclosure.drives {
                match self.drives.drive_temperature(&slot.device) {
                    Ok(t) => {
                        hottest = hottest.max(t);
                        temps.push(Some(t));
                    }
                    Err(e) => {
                        debug!(
                            enclosure = %enclosure.name,
                            device = %slot.device,
                            kind = %e.kind(),
                            "Drive temperature unavailable: {}",
                            e
                        );
                        temps.push(None);
                    }
                }
            }

            let forced = override_active && enclosure.follow_cpu_override;
            let duty = if forced {
                duty::MAX
            } else {
                enclosure.hdd_table.lookup(hottest)
            };
            let send = override_active || self.last_sent[index] != Some(duty);

            decisions.push(EnclosureDecision {
                index,
                hottest,
                duty,
                send,
            });
        }

        DriveCycle { temps, decisions }
    }

    /// Record that `duty` was queued for the enclosure's node
    pub fn mark_sent(&mut self, index: usize, duty: u8) {
        if let Some(slot) = self.last_sent.get_mut(index) {
            if *slot != Some(duty) {
                info!(
                    enclosure = %self.enclosures[index].name,
                    duty = duty,
                    "Enclosure duty changed"
                );
            }
            *slot = Some(duty);
        } else {
            warn!(index = index, "No such enclosure");
        }
    }
}
