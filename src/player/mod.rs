// Player module
// Typed view of the remote player's transport state

use crate::error::Result;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

pub mod mpd;

pub use mpd::MpdClient;

/// Identifies a track on the player
///
/// Two references are the same track iff their `file_id` matches.
#[derive(Debug, Clone)]
pub struct TrackRef {
    /// Player-side unique key (the file path relative to the music directory, or a stream URL)
    pub file_id: String,
    pub artist: String,
    pub title: String,
    /// Absent for radio and other streamed sources
    pub album: Option<String>,
}

impl PartialEq for TrackRef {
    fn eq(&self, other: &Self) -> bool {
        self.file_id == other.file_id
    }
}

impl Eq for TrackRef {}

impl Hash for TrackRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file_id.hash(state);
    }
}

impl fmt::Display for TrackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

/// Coarse playback mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    Playing,
    Paused,
    #[default]
    Stopped,
}

/// Player state as reported by a single status fetch
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaybackSnapshot {
    pub transport_state: TransportState,
    pub track: Option<TrackRef>,
    pub elapsed_seconds: f64,
    pub duration_seconds: Option<f64>,
}

impl PlaybackSnapshot {
    /// Duration usable for scrobbling; `None` for streams of unknown length
    pub fn scrobble_duration(&self) -> Option<f64> {
        self.duration_seconds.filter(|d| *d > 0.0)
    }
}

/// Push-style source of player state
pub trait PlayerSource: Send {
    /// Fetch the player's state right now
    fn current_status(&mut self) -> Result<PlaybackSnapshot>;

    /// Block until the player reports a transport or track change.
    /// Returns `Ok(false)` if `timeout` expires first.
    fn wait_for_change(&mut self, timeout: Duration) -> Result<bool>;

    /// Drop the current connection and open a new one
    fn reconnect(&mut self) -> Result<()>;

    /// Release the subscription
    fn close(&mut self);
}
