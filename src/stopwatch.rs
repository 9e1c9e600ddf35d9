// Stopwatch module
// Measures how long a track has actually been audible

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time
pub trait Clock: Clone + Send + 'static {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Real time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Pausable elapsed-time accumulator
///
/// Paused intervals are subtracted from the wall-clock time since `start()`.
/// `pause()` and `resume()` reject calls that do not match the current state,
/// so callers check [`Stopwatch::is_paused`] first.
#[derive(Debug, Clone)]
pub struct Stopwatch<C: Clock = SystemClock> {
    clock: C,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    is_paused: bool,
    paused_total: Duration,
}

impl<C: Clock> Stopwatch<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            started_at: None,
            paused_at: None,
            is_paused: false,
            paused_total: Duration::ZERO,
        }
    }

    /// Begin a fresh zero-based run, dropping any pause state
    pub fn start(&mut self) {
        self.started_at = Some(self.clock.now());
        self.paused_at = None;
        self.is_paused = false;
        self.paused_total = Duration::ZERO;
    }

    /// Freeze elapsed accounting
    pub fn pause(&mut self) -> Result<()> {
        if self.started_at.is_none() {
            return Err(Error::InvalidState("pause before start"));
        }
        if self.is_paused {
            return Err(Error::InvalidState("pause while already paused"));
        }

        self.paused_at = Some(self.clock.now());
        self.is_paused = true;
        Ok(())
    }

    /// Continue accounting from the frozen point
    pub fn resume(&mut self) -> Result<()> {
        if self.started_at.is_none() {
            return Err(Error::InvalidState("resume before start"));
        }
        let paused_at = match (self.is_paused, self.paused_at) {
            (true, Some(at)) => at,
            _ => return Err(Error::InvalidState("resume while not paused")),
        };

        self.paused_total += self.clock.now().saturating_duration_since(paused_at);
        self.paused_at = None;
        self.is_paused = false;
        Ok(())
    }

    /// Accumulated audible seconds, `0.0` if never started
    pub fn elapsed(&self) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };

        let end = match self.paused_at {
            Some(at) if self.is_paused => at,
            _ => self.clock.now(),
        };

        end.saturating_duration_since(started_at)
            .saturating_sub(self.paused_total)
            .as_secs_f64()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Clock that only moves when told to
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        base: Instant,
        base_utc: DateTime<Utc>,
        offset: Arc<Mutex<Duration>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                base: Instant::now(),
                base_utc: Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        pub fn advance_secs(&self, secs: f64) {
            *self.offset.lock().unwrap() += Duration::from_secs_f64(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        fn utc_now(&self) -> DateTime<Utc> {
            let offset = *self.offset.lock().unwrap();
            self.base_utc + chrono::Duration::from_std(offset).unwrap()
        }
    }
}
