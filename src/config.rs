// Configuration management module
// Handles loading, saving, and validating configuration

use crate::engine::{EngineOptions, ScrobbleThreshold};
use crate::scrobbler::service::LISTENBRAINZ_API_URL;
use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default log filter, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Scrobble after playing more than this percentage of the track (50% default)
    pub scrobble_threshold: u8,

    /// Scrobble any track with a known length after this many seconds
    #[serde(default = "default_scrobble_max_seconds")]
    pub scrobble_max_seconds: u64,

    /// Submissions waiting for the network before the engine blocks
    #[serde(default = "default_submit_queue_size")]
    pub submit_queue_size: usize,

    /// Player connection
    #[serde(default)]
    pub mpd: MpdConfig,

    /// Reconnect policy when the player goes away
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Text cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Last.fm configuration
    pub lastfm: Option<LastFmConfig>,

    /// ListenBrainz configurations (can have multiple instances)
    #[serde(default)]
    pub listenbrainz: Vec<ListenBrainzConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Just the logging key, readable before the rest of the file is validated
#[derive(Deserialize)]
struct LogLevelOnly {
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_scrobble_max_seconds() -> u64 {
    360
}

fn default_submit_queue_size() -> usize {
    32
}

fn default_reply_timeout_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpdConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Seconds one idle wait may block before shutdown is checked
    pub idle_poll_secs: u64,
    /// Seconds to wait for a connection, the greeting or a command reply
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
}

impl MpdConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6600,
            password: None,
            idle_poll_secs: 1,
            reply_timeout_secs: default_reply_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub initial_interval_ms: u64,
    pub max_interval_secs: u64,
    /// Give up after this many seconds without a connection; 0 retries forever
    pub max_elapsed_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_secs: 60,
            max_elapsed_secs: 0,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            current_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_secs(self.max_interval_secs),
            max_elapsed_time: match self.max_elapsed_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ..ExponentialBackoff::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Enable text cleanup
    pub enabled: bool,

    /// Regex patterns to remove from track/album/artist names
    /// Applied in order, each pattern is removed from the text
    pub patterns: Vec<String>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: vec![
                r"\s*\[Explicit\]".to_string(),
                r"\s*\[Clean\]".to_string(),
                r"\s*\(Explicit\)".to_string(),
                r"\s*\(Clean\)".to_string(),
                r"\s*- Explicit".to_string(),
                r"\s*- Clean".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastFmConfig {
    pub enabled: bool,
    pub api_key: String,
    pub api_secret: String,
    pub session_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenBrainzConfig {
    pub enabled: bool,
    pub name: String,
    pub token: String,
    pub api_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            scrobble_threshold: 50,
            scrobble_max_seconds: default_scrobble_max_seconds(),
            submit_queue_size: default_submit_queue_size(),
            mpd: MpdConfig::default(),
            reconnect: ReconnectConfig::default(),
            cleanup: CleanupConfig::default(),
            lastfm: Some(LastFmConfig {
                enabled: false,
                api_key: String::new(),
                api_secret: String::new(),
                session_key: String::new(),
            }),
            listenbrainz: vec![ListenBrainzConfig {
                enabled: false,
                name: "Primary".to_string(),
                token: String::new(),
                api_url: LISTENBRAINZ_API_URL.to_string(),
            }],
        }
    }
}

impl Config {
    /// Get the default path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;

        Ok(config_dir.join("jukebox_scrobbler.toml"))
    }

    /// Log filter configured in `path`, so logging can start before `load`
    pub fn log_level_at(path: &Path) -> String {
        fs::read_to_string(path)
            .ok()
            .and_then(|content| toml::from_str::<LogLevelOnly>(&content).ok())
            .map(|parsed| parsed.log_level)
            .unwrap_or_else(default_log_level)
    }

    /// Load configuration from `path`, or create a default one if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("Config file not found, creating default at {:?}", path);
            let default_config = Self::default();
            default_config.save(path)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content).context("Failed to write config file")?;

        log::info!("Config saved to {:?}", path);

        Ok(())
    }

    /// Apply HOST_MPD / PORT_MPD style overrides
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("HOST_MPD").filter(|h| !h.is_empty()) {
            self.mpd.host = host;
        }
        if let Some(port) = var("PORT_MPD").filter(|p| !p.is_empty()) {
            self.mpd.port = port
                .parse()
                .with_context(|| format!("PORT_MPD is not a valid port: {}", port))?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Validate scrobble threshold (should be 1-100%)
        if self.scrobble_threshold == 0 || self.scrobble_threshold > 100 {
            anyhow::bail!("scrobble_threshold must be between 1 and 100");
        }

        if self.mpd.idle_poll_secs == 0 {
            anyhow::bail!("mpd.idle_poll_secs must be greater than 0");
        }

        if self.mpd.reply_timeout_secs == 0 {
            anyhow::bail!("mpd.reply_timeout_secs must be greater than 0");
        }

        if self.submit_queue_size == 0 {
            anyhow::bail!("submit_queue_size must be greater than 0");
        }

        // Check that at least one scrobbler is enabled
        let lastfm_enabled = self.lastfm.as_ref().map(|l| l.enabled).unwrap_or(false);
        let listenbrainz_enabled = self.listenbrainz.iter().any(|l| l.enabled);

        if !lastfm_enabled && !listenbrainz_enabled {
            log::warn!("No scrobbling services are enabled");
        }

        // Validate Last.fm config if enabled
        if let Some(lastfm) = &self.lastfm {
            if lastfm.enabled {
                if lastfm.api_key.is_empty() {
                    anyhow::bail!("Last.fm api_key is required when Last.fm is enabled");
                }
                if lastfm.api_secret.is_empty() {
                    anyhow::bail!("Last.fm api_secret is required when Last.fm is enabled");
                }
            }
        }

        // Validate ListenBrainz configs if enabled
        for lb in &self.listenbrainz {
            if lb.enabled {
                if lb.token.is_empty() {
                    anyhow::bail!("ListenBrainz token is required when enabled (instance: {})", lb.name);
                }
                if lb.api_url.is_empty() {
                    anyhow::bail!("ListenBrainz api_url is required (instance: {})", lb.name);
                }
            }
        }

        Ok(())
    }

    pub fn threshold(&self) -> ScrobbleThreshold {
        ScrobbleThreshold {
            min_fraction: f64::from(self.scrobble_threshold) / 100.0,
            max_absolute_seconds: self.scrobble_max_seconds as f64,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            threshold: self.threshold(),
            poll_interval: Duration::from_secs(self.mpd.idle_poll_secs),
            queue_size: self.submit_queue_size,
            reconnect: self.reconnect.backoff(),
        }
    }
}
