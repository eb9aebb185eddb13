//! Session error types

use thiserror::Error;

/// Errors raised at the boundaries of the session engine
/// (snapshot encoding, configuration loading).
///
/// In-memory session operations never fail with an error; lookups on an
/// unknown key return `false`/`None` instead.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session result type
pub type SessionResult<T> = Result<T, SessionError>;
