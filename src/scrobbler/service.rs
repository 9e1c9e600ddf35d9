// Listening services a submission fans out to

use crate::player::TrackRef;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use listenbrainz::ListenBrainz;
use rustfm_scrobble_proxy::{Scrobble, Scrobbler as LastFmScrobbler};

/// Public ListenBrainz instance
pub const LISTENBRAINZ_API_URL: &str = "https://api.listenbrainz.org";

/// One configured service endpoint
pub enum Service {
    LastFm(LastFmScrobbler),
    ListenBrainz {
        name: String,
        client: ListenBrainz,
    },
}

fn to_scrobble(track: &TrackRef) -> Scrobble {
    Scrobble::new(&track.artist, &track.title, track.album.as_deref())
}

impl Service {
    /// Last.fm with a stored session key (see `auth lastfm`)
    pub fn lastfm(api_key: &str, api_secret: &str, session_key: &str) -> Self {
        let mut client = LastFmScrobbler::new(api_key, api_secret);
        client.authenticate_with_session_key(session_key);
        Self::LastFm(client)
    }

    /// A ListenBrainz instance; the token is checked right away
    pub fn listenbrainz(name: &str, token: &str, api_url: &str) -> Result<Self> {
        let mut client = match api_url.trim_end_matches('/') {
            LISTENBRAINZ_API_URL => ListenBrainz::new(),
            custom => ListenBrainz::new_with_url(custom),
        };

        client
            .authenticate(token)
            .with_context(|| format!("ListenBrainz ({}) rejected the token", name))?;

        Ok(Self::ListenBrainz {
            name: name.to_string(),
            client,
        })
    }

    pub fn name(&self) -> String {
        match self {
            Self::LastFm(_) => "Last.fm".to_string(),
            Self::ListenBrainz { name, .. } => format!("ListenBrainz ({})", name),
        }
    }

    pub fn now_playing(&self, track: &TrackRef) -> Result<()> {
        match self {
            Self::LastFm(client) => {
                client
                    .now_playing(&to_scrobble(track))
                    .with_context(|| format!("Last.fm refused now playing for {}", track))?;
            }
            Self::ListenBrainz { client, .. } => {
                client
                    .playing_now(&track.artist, &track.title, track.album.as_deref())
                    .with_context(|| format!("{} refused now playing for {}", self.name(), track))?;
            }
        }
        log::debug!("{} now playing: {}", self.name(), track);
        Ok(())
    }

    /// Record a listen that began at `started_at`.
    ///
    /// Last.fm stores `started_at`. ListenBrainz stores the time of this call
    /// instead, because its single-listen submission carries no timestamp of ours.
    pub fn scrobble(&self, track: &TrackRef, started_at: DateTime<Utc>) -> Result<()> {
        match self {
            Self::LastFm(client) => {
                let mut scrobble = to_scrobble(track);
                scrobble.with_timestamp(started_at.timestamp() as u64);
                client
                    .scrobble(&scrobble)
                    .with_context(|| format!("Last.fm refused the scrobble of {}", track))?;
            }
            Self::ListenBrainz { client, .. } => {
                let lag = Utc::now().signed_duration_since(started_at);
                log::debug!(
                    "{} records {} at submission time, {}s after it started",
                    self.name(),
                    track,
                    lag.num_seconds()
                );
                client
                    .listen(&track.artist, &track.title, track.album.as_deref())
                    .with_context(|| format!("{} refused the scrobble of {}", self.name(), track))?;
            }
        }
        log::info!("{} scrobbled {}", self.name(), track);
        Ok(())
    }
}
