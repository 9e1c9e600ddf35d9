// Scrobbler module
// Listening submitter: sends engine decisions to every configured service

use crate::config::Config;
use crate::error::SubmitError;
use crate::player::TrackRef;
use crate::text_cleanup::TextCleaner;
use anyhow::Result;
use chrono::{DateTime, Utc};

pub mod lastfm_auth;
pub mod service;

pub use service::Service;

/// Sink for engine decisions; one outbound call per service and invocation
pub trait Submitter: Send {
    /// Update "now playing" status
    fn announce(&self, track: &TrackRef) -> Result<(), SubmitError>;

    /// Submit a scrobble for a listen that began at `at`
    fn scrobble(&self, track: &TrackRef, at: DateTime<Utc>) -> Result<(), SubmitError>;
}

/// All enabled services, fed the same cleaned-up track
pub struct Services {
    services: Vec<Service>,
    cleaner: TextCleaner,
}

impl Services {
    pub fn new(services: Vec<Service>, cleaner: TextCleaner) -> Self {
        Self { services, cleaner }
    }

    /// Build every service enabled in `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut services = Vec::new();

        if let Some(lastfm) = config.lastfm.as_ref().filter(|l| l.enabled) {
            if lastfm.session_key.is_empty() {
                log::warn!("Last.fm is enabled but has no session key, run `auth lastfm` first");
            } else {
                services.push(Service::lastfm(
                    &lastfm.api_key,
                    &lastfm.api_secret,
                    &lastfm.session_key,
                ));
                log::info!("Last.fm scrobbling enabled");
            }
        }

        for lb in config.listenbrainz.iter().filter(|l| l.enabled) {
            services.push(Service::listenbrainz(&lb.name, &lb.token, &lb.api_url)?);
            log::info!("ListenBrainz ({}) scrobbling enabled", lb.name);
        }

        Ok(Self::new(services, TextCleaner::new(&config.cleanup)))
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Clean metadata and make sure the services can accept it
    fn prepare(&self, track: &TrackRef) -> Result<TrackRef, SubmitError> {
        let track = self.cleaner.clean_track(track);

        if track.artist.is_empty() {
            return Err(SubmitError::Incomplete {
                file_id: track.file_id,
                field: "artist",
            });
        }
        if track.title.is_empty() {
            return Err(SubmitError::Incomplete {
                file_id: track.file_id,
                field: "title",
            });
        }

        Ok(track)
    }

    fn fan_out(
        &self,
        action: &str,
        submit: impl Fn(&Service) -> anyhow::Result<()>,
    ) -> Result<(), SubmitError> {
        let mut failures = Vec::new();

        for service in &self.services {
            if let Err(e) = submit(service) {
                log::warn!("{}: {} failed: {:#}", service.name(), action, e);
                failures.push(SubmitError::Service {
                    service: service.name(),
                    message: format!("{:#}", e),
                });
            }
        }

        match (failures.len(), self.services.len()) {
            (0, _) => Ok(()),
            (1, 1) => Err(failures.remove(0)),
            (failed, total) => Err(SubmitError::Partial { failed, total }),
        }
    }
}

impl Submitter for Services {
    fn announce(&self, track: &TrackRef) -> Result<(), SubmitError> {
        let track = self.prepare(track)?;
        self.fan_out("now playing", |service| service.now_playing(&track))
    }

    fn scrobble(&self, track: &TrackRef, at: DateTime<Utc>) -> Result<(), SubmitError> {
        let track = self.prepare(track)?;
        self.fan_out("scrobble", |service| service.scrobble(&track, at))
    }
}
