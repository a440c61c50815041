//! Fixed-rate duty cycle ramp
//!
//! The applied duty moves toward the commanded target by exactly one percent
//! per tick. A new command always ramps from whatever value is applied at the
//! moment it arrives, so a retarget mid-ramp never jumps.

use crate::constants::duty;

/// Outcome of a [`RampController::set_target`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChange {
    /// Idle and already at the requested duty
    Unchanged,
    /// Idle ramp started toward a new duty
    Started,
    /// In-flight ramp redirected to a new duty
    Retargeted,
    /// Mid-ramp command matching the applied duty; the ramp ended on the spot
    Settled,
}

impl TargetChange {
    /// Whether the command left the controller idle at its target
    ///
    /// Both an ended ramp and a repeat of the held duty count as completions.
    pub fn at_target(self) -> bool {
        matches!(self, TargetChange::Settled | TargetChange::Unchanged)
    }
}

/// Result of one ramp tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampStep {
    /// Nothing to do
    Idle,
    /// Apply `duty`; the ramp continues
    Moved { duty: u8 },
    /// Apply `duty`; the ramp reached its target
    Completed { duty: u8 },
}

impl RampStep {
    /// Duty to apply to the actuator, if any
    pub fn duty(self) -> Option<u8> {
        match self {
            RampStep::Idle => None,
            RampStep::Moved { duty } | RampStep::Completed { duty } => Some(duty),
        }
    }
}

/// Duty cycle state machine owned by a fan node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampController {
    current: u8,
    previous_target: u8,
    desired_target: u8,
    ramping: bool,
}

impl RampController {
    /// Start idle at `initial` percent
    pub fn new(initial: u8) -> Self {
        let initial = initial.min(duty::MAX);
        Self {
            current: initial,
            previous_target: initial,
            desired_target: initial,
            ramping: false,
        }
    }

    /// Duty currently applied to the actuator
    pub fn current(&self) -> u8 {
        self.current
    }

    /// Duty the in-flight ramp started from
    pub fn previous_target(&self) -> u8 {
        self.previous_target
    }

    /// Duty the controller is heading toward
    pub fn desired_target(&self) -> u8 {
        self.desired_target
    }

    pub fn is_ramping(&self) -> bool {
        self.ramping
    }

    /// Accept a new commanded duty, clamped to 0..=100
    pub fn set_target(&mut self, target: i64) -> TargetChange {
        let target = target.clamp(duty::MIN as i64, duty::MAX as i64) as u8;
        let was_ramping = self.ramping;

        self.previous_target = self.current;
        self.desired_target = target;
        self.ramping = self.previous_target != self.desired_target;

        match (was_ramping, self.ramping) {
            (false, false) => TargetChange::Unchanged,
            (false, true) => TargetChange::Started,
            (true, true) => TargetChange::Retargeted,
            (true, false) => TargetChange::Settled,
        }
    }

    /// Advance the ramp by one step
    pub fn tick(&mut self) -> RampStep {
        if !self.ramping {
            return RampStep::Idle;
        }

        if self.current < self.desired_target {
            self.current += 1;
        } else if self.current > self.desired_target {
            self.current -= 1;
        }

        if self.current == self.desired_target {
            self.previous_target = self.desired_target;
            self.ramping = false;
            RampStep::Completed { duty: self.current }
        } else {
            RampStep::Moved { duty: self.current }
        }
    }
}

impl Default for RampController {
    fn default() -> Self {
        Self::new(duty::SAFE)
    }
}
