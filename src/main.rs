// jukebox-scrobbler
// Follows an MPD player and mirrors what it plays to Last.fm and ListenBrainz

mod config;
mod engine;
mod error;
mod player;
mod scrobbler;
mod stopwatch;
mod text_cleanup;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, LastFmConfig};
use engine::{Activity, EngineHandle};
use env_logger::{Env, WriteStyle};
use player::{MpdClient, PlayerSource};
use scrobbler::{lastfm_auth, Services};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

/// How often the main thread checks whether the engine gave up
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "jukebox-scrobbler", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate with a scrobbling service and store the session
    Auth {
        #[command(subcommand)]
        service: AuthService,
    },
    /// Print what the player is doing and exit
    Status,
}

#[derive(Subcommand)]
enum AuthService {
    /// Obtain a Last.fm session key
    Lastfm {
        /// Use username and password instead of approving in a browser
        #[arg(long)]
        password: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::log_level_at(&config_path)
    };
    init_logging(&level);

    let mut config = Config::load(&config_path)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    log::info!("Using config {}", config_path.display());

    match cli.command {
        Some(Command::Auth {
            service: AuthService::Lastfm { password },
        }) => auth_lastfm(&mut config, &config_path, password),
        Some(Command::Status) => print_status(&config),
        None => run(&config),
    }
}

fn init_logging(level: &str) {
    // Plain output when piped into a journal or file
    let style = if atty::is(atty::Stream::Stderr) {
        WriteStyle::Auto
    } else {
        WriteStyle::Never
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .write_style(style)
        .init();
}

fn run(config: &Config) -> Result<()> {
    let services = Services::from_config(config)?;
    if services.is_empty() {
        log::warn!("No scrobbling services available, decisions will only be logged");
    }

    let source = mpd_client(config);
    log::info!("Following MPD at {}", source.address());

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("Failed to install the shutdown handler")?;

    let engine = EngineHandle::start(source, services, config.engine_options())
        .context("Failed to start scrobble engine")?;

    loop {
        match shutdown_rx.recv_timeout(SUPERVISE_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("Shutting down, flushing queued submissions");
                report(&engine.stop());
                return Ok(());
            }
            Err(RecvTimeoutError::Timeout) if engine.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    report(&engine.wait());
    anyhow::bail!("Gave up reconnecting to MPD at {}:{}", config.mpd.host, config.mpd.port)
}

fn mpd_client(config: &Config) -> MpdClient {
    MpdClient::new(&config.mpd.host, config.mpd.port, config.mpd.password.clone())
        .with_reply_timeout(config.mpd.reply_timeout())
}

fn report(activity: &Activity) {
    log::info!(
        "Submitted {} now playing updates and {} scrobbles ({} dropped, {} reconnects)",
        activity.announcements,
        activity.scrobbles,
        activity.failures,
        activity.reconnects
    );
    if let Some(last) = &activity.last_scrobbled {
        log::info!("Last scrobbled: {}", last);
    }
}

fn auth_lastfm(config: &mut Config, config_path: &Path, use_password: bool) -> Result<()> {
    let lastfm = config.lastfm.get_or_insert_with(|| LastFmConfig {
        enabled: false,
        api_key: String::new(),
        api_secret: String::new(),
        session_key: String::new(),
    });

    if lastfm.api_key.is_empty() || lastfm.api_secret.is_empty() {
        anyhow::bail!(
            "Set lastfm.api_key and lastfm.api_secret in {:?} before authenticating",
            config_path
        );
    }

    let session_key = if use_password {
        lastfm_auth::authenticate_with_password(&lastfm.api_key, &lastfm.api_secret)?
    } else {
        lastfm_auth::authenticate_with_token(&lastfm.api_key, &lastfm.api_secret)?
    };

    lastfm.session_key = session_key;
    lastfm.enabled = true;
    config.save(config_path)?;

    println!("Last.fm session saved to {}", config_path.display());
    Ok(())
}

fn print_status(config: &Config) -> Result<()> {
    let mut client = mpd_client(config);
    client
        .reconnect()
        .with_context(|| format!("Failed to connect to MPD at {}", client.address()))?;
    let snapshot = client.current_status().context("Failed to read player status")?;

    println!("State:    {:?}", snapshot.transport_state);
    match &snapshot.track {
        Some(track) => {
            println!("Track:    {}", track);
            if let Some(album) = &track.album {
                println!("Album:    {}", album);
            }
            println!("File:     {}", track.file_id);
        }
        None => println!("Track:    none"),
    }
    match snapshot.scrobble_duration() {
        Some(duration) => println!(
            "Position: {:.0}s / {:.0}s",
            snapshot.elapsed_seconds, duration
        ),
        None => println!("Position: {:.0}s (no duration, not scrobbled)", snapshot.elapsed_seconds),
    }

    client.close();
    Ok(())
}
