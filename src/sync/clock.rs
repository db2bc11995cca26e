//! Session clock
//!
//! The single time axis every output item is stamped on. The origin is set
//! once by the controller; pause/resume edges are recorded so that session
//! time excludes paused wall time, and `freeze` pins the clock at stop so the
//! drain can work towards a fixed end.

use crate::utils::error::ClockError;
use parking_lot::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct ClockState {
    origin: Option<Instant>,
    /// Closed pause intervals, in order
    pauses: Vec<(Instant, Instant)>,
    paused_since: Option<Instant>,
    frozen_at: Option<Instant>,
    /// Bumped on every resume
    epoch: u64,
}

impl ClockState {
    fn session_time(&self, at: Instant) -> Duration {
        let Some(origin) = self.origin else {
            return Duration::ZERO;
        };
        let at = match self.frozen_at {
            Some(frozen) => at.min(frozen),
            None => at,
        };
        if at <= origin {
            return Duration::ZERO;
        }

        let mut paused = Duration::ZERO;
        for &(start, end) in &self.pauses {
            if at >= end {
                paused += end - start;
            } else if at > start {
                paused += at - start;
            }
        }
        if let Some(start) = self.paused_since {
            if at > start {
                paused += at - start;
            }
        }
        (at - origin).saturating_sub(paused)
    }

    fn paused_total(&self, now: Instant) -> Duration {
        let now = self.frozen_at.map(|f| now.min(f)).unwrap_or(now);
        let closed: Duration = self.pauses.iter().map(|&(s, e)| e - s).sum();
        let open = self
            .paused_since
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or_default();
        closed + open
    }
}

/// Shared, monotonic session timeline
#[derive(Debug, Default)]
pub struct SessionClock {
    state: RwLock<ClockState>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the origin. Only the first call succeeds.
    pub fn establish(&self, origin: Instant) -> Result<(), ClockError> {
        let mut state = self.state.write();
        if state.origin.is_some() {
            return Err(ClockError::AlreadyEstablished);
        }
        state.origin = Some(origin);
        Ok(())
    }

    pub fn is_established(&self) -> bool {
        self.state.read().origin.is_some()
    }

    pub fn origin(&self) -> Option<Instant> {
        self.state.read().origin
    }

    pub fn pause(&self, at: Instant) -> Result<(), ClockError> {
        let mut state = self.state.write();
        if state.origin.is_none() {
            return Err(ClockError::NotEstablished);
        }
        if state.frozen_at.is_some() {
            return Err(ClockError::Frozen);
        }
        if state.paused_since.is_some() {
            return Err(ClockError::AlreadyPaused);
        }
        state.paused_since = Some(at);
        Ok(())
    }

    pub fn resume(&self, at: Instant) -> Result<(), ClockError> {
        let mut state = self.state.write();
        if state.frozen_at.is_some() {
            return Err(ClockError::Frozen);
        }
        let start = state.paused_since.take().ok_or(ClockError::NotPaused)?;
        state.pauses.push((start, at.max(start)));
        state.epoch += 1;
        Ok(())
    }

    /// Stop the clock. Later calls keep the first freeze point; an open
    /// pause is closed at `at`, so a clock frozen while paused reads the
    /// elapsed time at the pause.
    pub fn freeze(&self, at: Instant) {
        let mut state = self.state.write();
        if state.frozen_at.is_some() {
            return;
        }
        if let Some(start) = state.paused_since.take() {
            state.pauses.push((start, at.max(start)));
        }
        state.frozen_at = Some(at);
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen_at.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().paused_since.is_some()
    }

    /// Session time now; zero before the origin is set
    pub fn elapsed(&self) -> Duration {
        self.session_time(Instant::now())
    }

    /// Session time of a wall-clock instant. An instant inside a pause maps
    /// to the moment the pause began.
    pub fn session_time(&self, at: Instant) -> Duration {
        self.state.read().session_time(at)
    }

    /// Session time of a wall-clock offset from the origin
    pub fn wall_to_session(&self, wall_offset: Duration) -> Duration {
        let state = self.state.read();
        match state.origin {
            Some(origin) => state.session_time(origin + wall_offset),
            None => Duration::ZERO,
        }
    }

    pub fn paused_total(&self) -> Duration {
        self.state.read().paused_total(Instant::now())
    }

    /// Number of resumes so far. Consumers re-anchor their clock mapping
    /// when this changes.
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn origin_is_set_once() {
        let clock = SessionClock::new();
        assert_eq!(clock.elapsed(), Duration::ZERO);
        let t0 = Instant::now();
        clock.establish(t0).unwrap();
        assert_eq!(
            clock.establish(t0 + ms(5)),
            Err(ClockError::AlreadyEstablished)
        );
        assert_eq!(clock.origin(), Some(t0));
    }

    #[test]
    fn paused_time_is_excluded() {
        let clock = SessionClock::new();
        let t0 = Instant::now();
        clock.establish(t0).unwrap();

        clock.pause(t0 + ms(1000)).unwrap();
        assert_eq!(clock.pause(t0 + ms(1001)), Err(ClockError::AlreadyPaused));
        clock.resume(t0 + ms(1500)).unwrap();
        clock.pause(t0 + ms(2000)).unwrap();
        clock.resume(t0 + ms(2250)).unwrap();

        assert_eq!(clock.session_time(t0 + ms(500)), ms(500));
        // Inside a pause: held at the pause start
        assert_eq!(clock.session_time(t0 + ms(1200)), ms(1000));
        assert_eq!(clock.session_time(t0 + ms(1600)), ms(1100));
        assert_eq!(clock.session_time(t0 + ms(3000)), ms(2250));
        assert_eq!(clock.wall_to_session(ms(3000)), ms(2250));
        assert_eq!(clock.epoch(), 2);
    }

    #[test]
    fn resume_without_pause_is_rejected() {
        let clock = SessionClock::new();
        clock.establish(Instant::now()).unwrap();
        assert_eq!(clock.resume(Instant::now()), Err(ClockError::NotPaused));
    }

    #[test]
    fn freeze_while_paused_reads_pause_start() {
        let clock = SessionClock::new();
        let t0 = Instant::now() - ms(10_000);
        clock.establish(t0).unwrap();
        clock.pause(t0 + ms(4000)).unwrap();
        clock.freeze(t0 + ms(6000));
        clock.freeze(t0 + ms(9000));

        assert!(clock.is_frozen());
        assert!(!clock.is_paused());
        assert_eq!(clock.elapsed(), ms(4000));
        assert_eq!(clock.paused_total(), ms(2000));
        assert_eq!(clock.resume(t0 + ms(7000)), Err(ClockError::Frozen));
    }

    #[test]
    fn elapsed_tracks_wall_clock() {
        let clock = SessionClock::new();
        clock.establish(Instant::now()).unwrap();
        std::thread::sleep(ms(30));
        let elapsed = clock.elapsed();
        assert!(elapsed >= ms(30) && elapsed < ms(500), "{:?}", elapsed);
    }
}
