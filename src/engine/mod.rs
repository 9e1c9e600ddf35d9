// Scrobble engine
// Turns the ordered stream of player snapshots into "now playing" and
// scrobble submissions, at most once per listening session.

use crate::player::{PlaybackSnapshot, TrackRef, TransportState};
use crate::stopwatch::{Clock, Stopwatch, SystemClock};
use chrono::{DateTime, Utc};

pub mod runner;
pub mod session;

pub use runner::{Activity, EngineHandle, EngineOptions};
pub use session::PlaySession;

/// When a listened track counts as played
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrobbleThreshold {
    /// Fraction of the duration that must elapse (strictly exceeded)
    pub min_fraction: f64,
    /// Play time after which any track with a known duration qualifies
    pub max_absolute_seconds: f64,
}

impl Default for ScrobbleThreshold {
    fn default() -> Self {
        Self {
            min_fraction: 0.5,
            max_absolute_seconds: 360.0,
        }
    }
}

impl ScrobbleThreshold {
    /// Check if `elapsed` seconds of a `duration`-long track should be scrobbled
    pub fn qualifies(&self, elapsed: f64, duration: f64) -> bool {
        if duration <= 0.0 {
            return false;
        }
        elapsed / duration > self.min_fraction || elapsed > self.max_absolute_seconds
    }
}

/// Work for the listening submitter
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    NowPlaying(TrackRef),
    Scrobble { track: TrackRef, at: DateTime<Utc> },
}

/// State machine deciding when to announce and when to scrobble
pub struct ScrobbleEngine<C: Clock = SystemClock> {
    threshold: ScrobbleThreshold,
    session: PlaySession,
    stopwatch: Stopwatch<C>,
    state: TransportState,
}

impl ScrobbleEngine<SystemClock> {
    pub fn new(threshold: ScrobbleThreshold) -> Self {
        Self::with_clock(threshold, SystemClock)
    }
}

impl<C: Clock> ScrobbleEngine<C> {
    pub fn with_clock(threshold: ScrobbleThreshold, clock: C) -> Self {
        Self {
            threshold,
            session: PlaySession::default(),
            stopwatch: Stopwatch::new(clock),
            state: TransportState::Stopped,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &PlaySession {
        &self.session
    }

    /// Audible seconds of the current session
    #[cfg(test)]
    pub fn elapsed(&self) -> f64 {
        self.stopwatch.elapsed()
    }

    /// Feed the next snapshot, in the order the player reported them
    pub fn observe(&mut self, snapshot: &PlaybackSnapshot) -> Vec<Submission> {
        let mut submissions = Vec::new();
        let incoming = snapshot.transport_state;

        if let Some(track) = &snapshot.track {
            if !self.session.is_current(&track.file_id) {
                self.evaluate(&mut submissions);
                self.begin_session(track, snapshot.scrobble_duration());
            } else {
                if self.session.duration.is_none() {
                    self.session.duration = snapshot.scrobble_duration();
                }
                if self.state == TransportState::Stopped && incoming != TransportState::Stopped {
                    log::info!("Replaying after stop: {}", track);
                    let now = self.stopwatch.clock().utc_now();
                    self.session.restart(now);
                    self.stopwatch.start();
                }
            }
        }

        match incoming {
            TransportState::Playing => {
                self.run_stopwatch();
                if !self.session.announced {
                    if let Some(track) = &self.session.current_track {
                        log::info!("Now playing: {}", track);
                        submissions.push(Submission::NowPlaying(track.clone()));
                        self.session.announced = true;
                    }
                }
            }
            TransportState::Paused => {
                if self.state == TransportState::Playing {
                    log::debug!("Paused at {:.1}s", self.stopwatch.elapsed());
                }
                self.freeze_stopwatch();
            }
            TransportState::Stopped => {
                self.freeze_stopwatch();
                if self.state != TransportState::Stopped {
                    log::debug!("Stopped at {:.1}s", self.stopwatch.elapsed());
                    self.evaluate(&mut submissions);
                }
            }
        }

        self.state = incoming;
        submissions
    }

    /// Forget everything after a gap in notifications and start over from `snapshot`.
    /// The session that was in progress is dropped without being evaluated.
    pub fn resync(&mut self, snapshot: &PlaybackSnapshot) -> Vec<Submission> {
        if let Some(track) = &self.session.current_track {
            log::info!("Resynchronizing, dropping session for {}", track);
        }
        self.session = PlaySession::default();
        self.stopwatch = Stopwatch::new(self.stopwatch.clock().clone());
        self.state = TransportState::Stopped;
        self.observe(snapshot)
    }

    fn begin_session(&mut self, track: &TrackRef, duration: Option<f64>) {
        match duration {
            Some(d) => log::info!("New track: {} ({:.0}s)", track, d),
            None => log::info!("New track: {} (no duration, will not scrobble)", track),
        }

        let now = self.stopwatch.clock().utc_now();
        self.session.begin(track.clone(), duration, now);
        self.stopwatch.start();
    }

    /// Scrobble the timed track if it qualifies and has not been scrobbled yet
    fn evaluate(&mut self, submissions: &mut Vec<Submission>) {
        if self.session.scrobbled {
            return;
        }
        let Some(track) = &self.session.current_track else {
            return;
        };
        let Some(duration) = self.session.duration else {
            return;
        };

        let elapsed = self.stopwatch.elapsed();
        if !self.threshold.qualifies(elapsed, duration) {
            log::debug!(
                "Not scrobbling {} (played {:.1}s / {:.1}s)",
                track,
                elapsed,
                duration
            );
            return;
        }

        log::info!(
            "Scrobbling: {} (played {:.0}s / {:.0}s)",
            track,
            elapsed,
            duration
        );
        let at = self
            .session
            .started_at
            .unwrap_or_else(|| self.stopwatch.clock().utc_now());
        submissions.push(Submission::Scrobble {
            track: track.clone(),
            at,
        });
        self.session.scrobbled = true;
    }

    fn run_stopwatch(&mut self) {
        if self.stopwatch.is_paused() {
            if let Err(e) = self.stopwatch.resume() {
                log::error!("{}", e);
            }
        }
    }

    fn freeze_stopwatch(&mut self) {
        if self.stopwatch.is_started() && !self.stopwatch.is_paused() {
            if let Err(e) = self.stopwatch.pause() {
                log::error!("{}", e);
            }
        }
    }
}
