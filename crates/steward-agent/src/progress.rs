//! Throttled progress reporting
//!
//! Stream events arrive far faster than any external channel wants updates.
//! The gate counts every event and opens only when a count or time threshold
//! passes; delivery happens elsewhere and delivery failures never touch the
//! counter.

use std::time::{Duration, Instant};

/// Count/time-gated throttle for progress delivery
#[derive(Debug)]
pub struct ProgressGate {
    events: u64,
    events_at_last_emit: u64,
    last_emit: Instant,
    count_threshold: u64,
    min_interval: Duration,
}

impl ProgressGate {
    pub fn new(count_threshold: u64, min_interval: Duration) -> Self {
        Self {
            events: 0,
            events_at_last_emit: 0,
            last_emit: Instant::now(),
            count_threshold,
            min_interval,
        }
    }

    /// Record one event; returns true when a delivery should fire
    pub fn record(&mut self) -> bool {
        self.events += 1;
        let by_count = self.events - self.events_at_last_emit >= self.count_threshold;
        let by_time = self.last_emit.elapsed() >= self.min_interval;
        if by_count || by_time {
            self.events_at_last_emit = self.events;
            self.last_emit = Instant::now();
            true
        } else {
            false
        }
    }

    /// Total events observed, independent of deliveries
    pub fn events(&self) -> u64 {
        self.events
    }
}

impl Default for ProgressGate {
    fn default() -> Self {
        Self::new(25, Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_threshold_opens_gate() {
        let mut gate = ProgressGate::new(3, Duration::from_secs(3600));
        assert!(!gate.record());
        assert!(!gate.record());
        assert!(gate.record());
        // Counter resets relative to last emission
        assert!(!gate.record());
        assert_eq!(gate.events(), 4);
    }

    #[test]
    fn test_counter_unaffected_by_gating() {
        let mut gate = ProgressGate::new(1000, Duration::from_secs(3600));
        for _ in 0..10 {
            gate.record();
        }
        assert_eq!(gate.events(), 10);
    }

    #[test]
    fn test_time_threshold_opens_gate() {
        let mut gate = ProgressGate::new(u64::MAX, Duration::from_millis(0));
        // Zero interval means every event is past the time threshold
        assert!(gate.record());
        assert!(gate.record());
    }
}
