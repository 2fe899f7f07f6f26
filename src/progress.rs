//! A 60-second wall-clock throttle for human-readable progress lines,
//! immune to calendar-clock adjustments during a long-running pass since it
//! is built entirely on `Instant`.

use std::time::{Duration, Instant};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

pub struct ProgressGate {
    next_at: Option<Instant>,
}

impl ProgressGate {
    pub fn new() -> Self {
        Self { next_at: None }
    }

    /// True at most once per `PROGRESS_INTERVAL`; arms the next threshold as
    /// a side effect whenever it returns true.
    pub fn should_print(&mut self) -> bool {
        let now = Instant::now();
        let fire = match self.next_at {
            None => true,
            Some(t) => now >= t,
        };
        if fire {
            self.next_at = Some(now + PROGRESS_INTERVAL);
        }
        fire
    }

    pub fn reset(&mut self) {
        self.next_at = Some(Instant::now() + PROGRESS_INTERVAL);
    }
}

impl Default for ProgressGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_then_throttles() {
        let mut gate = ProgressGate::new();
        assert!(gate.should_print());
        assert!(!gate.should_print());
        assert!(!gate.should_print());
    }

    #[test]
    fn reset_rearms_the_threshold() {
        let mut gate = ProgressGate::new();
        assert!(gate.should_print());
        gate.reset();
        assert!(!gate.should_print());
    }
}
