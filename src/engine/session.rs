// Play session state owned by the scrobble engine

use crate::player::TrackRef;
use chrono::{DateTime, Utc};

/// Represents the current play session state
#[derive(Debug, Clone, Default)]
pub struct PlaySession {
    pub current_track: Option<TrackRef>,
    pub previous_track: Option<TrackRef>,
    /// "Now playing" was sent for `current_track`
    pub announced: bool,
    /// The scrobble for the track being timed was submitted
    pub scrobbled: bool,
    /// Duration of `current_track`, `None` when unknown or zero
    pub duration: Option<f64>,
    /// When listening to `current_track` began
    pub started_at: Option<DateTime<Utc>>,
}

impl PlaySession {
    /// Whether `file_id` is the track this session is about
    pub fn is_current(&self, file_id: &str) -> bool {
        self.current_track
            .as_ref()
            .is_some_and(|t| t.file_id == file_id)
    }

    /// Supersede the current track with `track`
    pub fn begin(&mut self, track: TrackRef, duration: Option<f64>, started_at: DateTime<Utc>) {
        self.previous_track = self.current_track.take();
        self.current_track = Some(track);
        self.duration = duration;
        self.restart(started_at);
    }

    /// Start listening to the same track again
    pub fn restart(&mut self, started_at: DateTime<Utc>) {
        self.announced = false;
        self.scrobbled = false;
        self.started_at = Some(started_at);
    }
}
