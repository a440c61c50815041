//! CPU over-temperature override shared by the CPU and HDD tasks

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    active: bool,
    last_armed: Option<Instant>,
}

/// Override flag plus a wake-up for the HDD task
///
/// The flag follows the CPU temperature every cycle. Arming wakes the HDD
/// task for an immediate poll and happens at most once per `rearm_after`.
#[derive(Debug)]
pub struct OverrideSignal {
    state: Mutex<State>,
    notify: Notify,
    rearm_after: Duration,
}

impl OverrideSignal {
    pub fn new(rearm_after: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            rearm_after,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Record this cycle's override condition; returns true if it armed
    pub fn update(&self, active: bool, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.active = active;
        if !active {
            return false;
        }

        let due = match state.last_armed {
            Some(at) => now.saturating_duration_since(at) >= self.rearm_after,
            None => true,
        };
        if due {
            state.last_armed = Some(now);
            drop(state);
            // Stores a permit if the HDD task is mid-poll
            self.notify.notify_one();
        }
        due
    }

    /// Resolve once the override arms
    pub async fn armed(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_arms_at_most_once_per_interval() {
        let signal = OverrideSignal::new(Duration::from_secs(60));
        let start = Instant::now();

        assert!(signal.update(true, start));
        assert!(!signal.update(true, start + Duration::from_secs(1)));
        assert!(!signal.update(true, start + Duration::from_secs(59)));
        assert!(signal.update(true, start + Duration::from_secs(60)));
        assert!(signal.is_active());
    }

    #[test]
    fn test_inactive_clears_flag_without_rearming() {
        let signal = OverrideSignal::new(HOUR);
        let start = Instant::now();

        assert!(signal.update(true, start));
        assert!(!signal.update(false, start + Duration::from_secs(1)));
        assert!(!signal.is_active());

        // Dropping below the threshold does not reset the interval
        assert!(!signal.update(true, start + Duration::from_secs(2)));
        assert!(signal.is_active());
    }

    #[tokio::test]
    async fn test_arming_wakes_waiter() {
        let signal = OverrideSignal::new(HOUR);
        signal.update(true, Instant::now());
        tokio::time::timeout(Duration::from_secs(1), signal.armed())
            .await
            .unwrap();
    }
}
