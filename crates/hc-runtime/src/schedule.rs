//! Drift-free periodic schedule

use std::time::Duration;
use tokio::time::Instant;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Next due time of a periodic loop
///
/// Ticks stay on the grid `start + n * period`. A late poll reports a
/// single due tick and skips the missed ones instead of bursting.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    period: Duration,
    next_tick: Instant,
}

impl TickSchedule {
    pub fn new(first_tick: Instant, period: Duration) -> Self {
        Self {
            period: period.max(MIN_PERIOD),
            next_tick: first_tick,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    /// Whether a tick is due at `now`; advances past `now` when it is
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_tick {
            return false;
        }
        let behind = now.duration_since(self.next_tick).as_secs_f64();
        let missed = (behind / self.period.as_secs_f64()).floor() as u32;
        self.next_tick += self.period * missed.saturating_add(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_due_before_first_tick() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(start + Duration::from_secs(5), Duration::from_secs(10));
        assert!(!schedule.poll(start));
        assert!(schedule.poll(start + Duration::from_secs(5)));
        assert_eq!(schedule.next_tick(), start + Duration::from_secs(15));
    }

    #[test]
    fn test_late_poll_skips_missed_ticks() {
        let start = Instant::now();
        let period = Duration::from_secs(10);
        let mut schedule = TickSchedule::new(start, period);

        assert!(schedule.poll(start + Duration::from_secs(35)));
        assert_eq!(schedule.next_tick(), start + Duration::from_secs(40));
        assert!(!schedule.poll(start + Duration::from_secs(39)));
    }

    #[test]
    fn test_step_duration_does_not_drift() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(start, Duration::from_secs(10));
        // Each step takes 3 s; ticks stay on the 10 s grid
        for n in 0..5u64 {
            let due = start + Duration::from_secs(10 * n);
            assert!(schedule.poll(due + Duration::from_secs(3)));
            assert_eq!(schedule.next_tick(), start + Duration::from_secs(10 * (n + 1)));
        }
    }

    #[test]
    fn test_zero_period_is_bounded() {
        let schedule = TickSchedule::new(Instant::now(), Duration::ZERO);
        assert_eq!(schedule.period(), MIN_PERIOD);
    }
}
