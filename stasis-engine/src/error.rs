//! Error types for stasis-engine
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation.
//!
//! Failure scopes differ by variant: `Decode` and `UnsupportedFormat` are
//! local to one track (the engine skips and advances), `BadRequest` is local
//! to one HTTP message, and anything that escapes the playback loop is fatal
//! to the process.

use thiserror::Error;

/// Main error type for stasis-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Audio decoding errors (malformed or truncated stream)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// File extension not in the supported set (wav, ogg, mp3)
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Playback engine errors
    #[error("Playback error: {0}")]
    Playback(String),

    /// Track library errors
    #[error("Library error: {0}")]
    Library(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid timing parameters
    #[error("Invalid timing: {0}")]
    InvalidTiming(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience Result type using stasis-engine Error
pub type Result<T> = std::result::Result<T, Error>;
