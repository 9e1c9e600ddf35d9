// Error types shared by the player client, the stopwatch and the engine

use thiserror::Error;

/// Result alias for the engine side of the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while following the player
#[derive(Error, Debug)]
pub enum Error {
    /// Stopwatch used out of order (a bug in the caller)
    #[error("Invalid stopwatch state: {0}")]
    InvalidState(&'static str),

    /// The player connection or its notification subscription was lost
    #[error("Player disconnected: {0}")]
    SourceDisconnected(String),

    /// The player answered with an error or an unreadable reply
    #[error("Player protocol error: {0}")]
    Protocol(String),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error should trigger a reconnect
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::SourceDisconnected(_) | Self::Io(_))
    }
}

/// Errors reported by a listening submitter
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The track lacks the metadata a service requires
    #[error("Track {file_id} is missing {field}")]
    Incomplete { file_id: String, field: &'static str },

    /// A single service rejected the call or could not be reached
    #[error("{service}: {message}")]
    Service { service: String, message: String },

    /// Some of the configured services failed
    #[error("{failed} of {total} services failed")]
    Partial { failed: usize, total: usize },
}
