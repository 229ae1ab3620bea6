use std::time::{Duration, Instant};

use crate::models::SideColor;

/// Live view of both countdowns, with elapsed time applied to whichever
/// side is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    pub white: Duration,
    pub black: Duration,
    /// Side whose remaining time has reached zero, if any.
    pub flagged: Option<SideColor>,
}

impl ClockReading {
    pub fn white_ms(&self) -> u64 {
        self.white.as_millis() as u64
    }

    pub fn black_ms(&self) -> u64 {
        self.black.as_millis() as u64
    }
}

/// Turn-based countdown for one session. Pure time accounting: the session
/// decides when the clock may run, the server schedules the ticks.
///
/// `remaining` values are true-as-of-last-stop; while running, the live
/// figure is derived from `running_since` on every read, so tick
/// granularity never accumulates drift. Only `halt` commits elapsed time.
///
/// Every `start` and `halt` bumps `generation`. A scheduled tick carries
/// the generation of the `start` that created it and must treat any
/// mismatch as a stale, already-superseded timer.
#[derive(Debug, Clone)]
pub struct TurnClock {
    remaining_white: Duration,
    remaining_black: Duration,
    running_since: Option<Instant>,
    running_for: Option<SideColor>,
    generation: u64,
}

impl TurnClock {
    pub fn new(initial: Duration) -> Self {
        Self {
            remaining_white: initial,
            remaining_black: initial,
            running_since: None,
            running_for: None,
            generation: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remaining(&self, side: SideColor) -> Duration {
        match side {
            SideColor::White => self.remaining_white,
            SideColor::Black => self.remaining_black,
        }
    }

    /// Start counting down `side`. Returns the new generation for the
    /// caller to tie its tick schedule to.
    pub fn start(&mut self, side: SideColor, now: Instant) -> u64 {
        self.running_since = Some(now);
        self.running_for = Some(side);
        self.generation += 1;
        self.generation
    }

    /// Stop the clock, charging exact elapsed time to the running side
    /// (floored at zero). Returns the side that flagged if the charge
    /// exhausted it. No-op when not running.
    pub fn halt(&mut self, now: Instant) -> Option<SideColor> {
        let (since, side) = match (self.running_since.take(), self.running_for.take()) {
            (Some(since), Some(side)) => (since, side),
            _ => return None,
        };
        self.generation += 1;
        let elapsed = now.saturating_duration_since(since);
        let left = self.remaining(side).saturating_sub(elapsed);
        match side {
            SideColor::White => self.remaining_white = left,
            SideColor::Black => self.remaining_black = left,
        }
        if left.is_zero() {
            Some(side)
        } else {
            None
        }
    }

    /// Non-mutating snapshot. Ticks broadcast from here; nothing is
    /// committed until `halt`.
    pub fn read(&self, now: Instant) -> ClockReading {
        let mut white = self.remaining_white;
        let mut black = self.remaining_black;
        if let (Some(since), Some(side)) = (self.running_since, self.running_for) {
            let elapsed = now.saturating_duration_since(since);
            match side {
                SideColor::White => white = white.saturating_sub(elapsed),
                SideColor::Black => black = black.saturating_sub(elapsed),
            }
        }
        let flagged = self.running_for.filter(|side| match side {
            SideColor::White => white.is_zero(),
            SideColor::Black => black.is_zero(),
        });
        ClockReading {
            white,
            black,
            flagged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECS_900: Duration = Duration::from_secs(900);

    #[test]
    fn only_the_running_side_is_charged() {
        let t0 = Instant::now();
        let mut clock = TurnClock::new(SECS_900);
        clock.start(SideColor::White, t0);
        let flagged = clock.halt(t0 + Duration::from_secs(10));
        assert_eq!(flagged, None);
        assert_eq!(clock.remaining(SideColor::White), Duration::from_secs(890));
        assert_eq!(clock.remaining(SideColor::Black), SECS_900);
    }

    #[test]
    fn halt_when_not_running_is_a_no_op() {
        let t0 = Instant::now();
        let mut clock = TurnClock::new(SECS_900);
        assert_eq!(clock.halt(t0), None);
        assert_eq!(clock.remaining(SideColor::White), SECS_900);
        let generation = clock.generation();
        assert_eq!(clock.halt(t0 + Duration::from_secs(5)), None);
        assert_eq!(clock.generation(), generation);
    }

    #[test]
    fn read_does_not_commit() {
        let t0 = Instant::now();
        let mut clock = TurnClock::new(SECS_900);
        clock.start(SideColor::Black, t0);
        let reading = clock.read(t0 + Duration::from_secs(30));
        assert_eq!(reading.black, Duration::from_secs(870));
        assert_eq!(reading.white, SECS_900);
        // stored remaining is untouched until halt
        assert_eq!(clock.remaining(SideColor::Black), SECS_900);
    }

    #[test]
    fn halt_at_exhaustion_reports_the_flagged_side() {
        let t0 = Instant::now();
        let mut clock = TurnClock::new(Duration::from_secs(5));
        clock.start(SideColor::White, t0);
        let flagged = clock.halt(t0 + Duration::from_secs(6));
        assert_eq!(flagged, Some(SideColor::White));
        assert_eq!(clock.remaining(SideColor::White), Duration::ZERO);
        assert_eq!(clock.remaining(SideColor::Black), Duration::from_secs(5));
    }

    #[test]
    fn read_flags_a_running_side_at_zero() {
        let t0 = Instant::now();
        let mut clock = TurnClock::new(Duration::from_secs(5));
        clock.start(SideColor::White, t0);
        assert_eq!(clock.read(t0 + Duration::from_secs(4)).flagged, None);
        assert_eq!(
            clock.read(t0 + Duration::from_secs(5)).flagged,
            Some(SideColor::White)
        );
    }

    #[test]
    fn generations_supersede_on_every_transition() {
        let t0 = Instant::now();
        let mut clock = TurnClock::new(SECS_900);
        let g1 = clock.start(SideColor::White, t0);
        clock.halt(t0 + Duration::from_secs(1));
        let g2 = clock.start(SideColor::White, t0 + Duration::from_secs(1));
        assert!(g2 > g1);
        assert_eq!(clock.generation(), g2);
    }

    #[test]
    fn alternating_turns_never_overcharge() {
        let t0 = Instant::now();
        let mut clock = TurnClock::new(SECS_900);
        let mut now = t0;
        for turn in 0..10 {
            let side = if turn % 2 == 0 {
                SideColor::White
            } else {
                SideColor::Black
            };
            clock.start(side, now);
            now += Duration::from_secs(3);
            clock.halt(now);
        }
        let charged = (SECS_900 - clock.remaining(SideColor::White))
            + (SECS_900 - clock.remaining(SideColor::Black));
        assert_eq!(charged, Duration::from_secs(30));
        assert_eq!(clock.remaining(SideColor::White), Duration::from_secs(885));
        assert_eq!(clock.remaining(SideColor::Black), Duration::from_secs(885));
    }
}
