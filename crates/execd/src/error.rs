//! Error types for the coprocess lifecycle.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;

/// Result type for lifecycle and configuration operations.
pub type ExecdResult<T> = Result<T, Report<ExecdError>>;

/// Errors surfaced to callers of [`crate::Execd`].
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ExecdError {
    /// Configuration rejected by validation
    #[display("Invalid configuration: {message}")]
    Config { message: String },

    /// Configuration file could not be read or parsed
    #[display("Failed to load configuration from {path}")]
    ConfigLoad { path: String },

    /// The executable could not be started
    #[display("Failed to spawn process `{program}`")]
    Spawn { program: String },

    /// `start` called on a running instance
    #[display("Process `{name}` is already running")]
    AlreadyRunning { name: String },

    /// `add` called before `start` or after `stop`
    #[display("Process `{name}` is not running")]
    NotRunning { name: String },

    /// `add` released by a concurrent `stop`
    #[display("Process `{name}` is stopping, metric rejected")]
    Stopped { name: String },
}

impl Error for ExecdError {}
