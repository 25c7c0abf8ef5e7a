//! Fixed-rate tick pacing.
//!
//! The clock never runs a tick early: until the next boundary is reached the
//! caller is told how long to sleep. The next boundary is measured from the
//! moment the previous tick actually started, so a slow tick is followed by
//! exactly one immediate tick and never by a burst of catch-up ticks.

use std::time::{Duration, Instant};

/// What the loop should do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Run,
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct TickClock {
    interval: Duration,
    next: Instant,
    ticks: u64,
}

impl TickClock {
    /// First tick is due immediately at `start`.
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            next: start,
            ticks: 0,
        }
    }

    pub fn poll(&self, now: Instant) -> Pacing {
        if now >= self.next {
            Pacing::Run
        } else {
            Pacing::Wait(self.next - now)
        }
    }

    /// Records a tick that began at `started_at`.
    pub fn mark_tick(&mut self, started_at: Instant) {
        self.ticks += 1;
        self.next = started_at + self.interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: Duration = Duration::from_millis(16);

    #[test]
    fn short_ticks_are_spaced_by_the_interval() {
        let t0 = Instant::now();
        let mut clock = TickClock::new(DT, t0);
        assert_eq!(clock.poll(t0), Pacing::Run);
        clock.mark_tick(t0);

        // body took 5ms
        let after_body = t0 + Duration::from_millis(5);
        assert_eq!(
            clock.poll(after_body),
            Pacing::Wait(Duration::from_millis(11))
        );
        assert_eq!(clock.poll(t0 + DT), Pacing::Run);
    }

    #[test]
    fn long_tick_runs_next_immediately_without_catch_up() {
        let t0 = Instant::now();
        let mut clock = TickClock::new(DT, t0);
        clock.mark_tick(t0);

        // body took 3.5 intervals
        let t1 = t0 + DT * 7 / 2;
        assert_eq!(clock.poll(t1), Pacing::Run);
        clock.mark_tick(t1);

        // only one immediate tick; the next waits a full interval
        let shortly_after = t1 + Duration::from_millis(1);
        assert_eq!(
            clock.poll(shortly_after),
            Pacing::Wait(DT - Duration::from_millis(1))
        );
        assert_eq!(clock.ticks(), 2);
    }
}
