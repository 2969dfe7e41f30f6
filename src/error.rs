//! Error types for native library resolution and handle operations

use std::path::PathBuf;
use thiserror::Error;

/// Interop operation result type
pub type Result<T> = std::result::Result<T, InteropError>;

/// Interop operation errors
///
/// Resolution and release never surface these to callers; they are logged and
/// turned into a fallback. Explicit operations (open, prepare, backup, blob)
/// return them directly.
#[derive(Error, Debug)]
pub enum InteropError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dynamic loader rejected a library file
    #[error("Failed to load native library {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// A required entry point is not exported by the loaded module
    #[error("Native entry point not found: {0}")]
    MissingSymbol(&'static str),

    /// No packaged resource exists under the given name
    #[error("Packaged resource not found: {0}")]
    ResourceNotFound(String),

    /// Packaged resource could not be decompressed
    #[error("Decompression failed for {name}: {source}")]
    Decompression {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Native call returned a non-zero status
    #[error("Native call failed with code {code}: {message}")]
    Native { code: i32, message: String },

    /// Path cannot be handed to the native library as UTF-8
    #[error("Path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    /// SQL text holds more than the one statement being prepared
    #[error("Unexpected SQL after the first statement: {0}")]
    TrailingSql(String),

    /// Operation attempted on a released or stale handle
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),

    /// Path or name contains an interior NUL byte
    #[error("Interior NUL byte in {0}")]
    NulInPath(String),

    /// No native API could be bound for this process
    #[error("Native API unavailable: {0}")]
    ApiUnavailable(String),
}

impl InteropError {
    /// Build a native error from a status code and message
    pub fn native(code: i32, message: impl Into<String>) -> Self {
        InteropError::Native {
            code,
            message: message.into(),
        }
    }
}
