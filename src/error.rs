//! Unified error type for the unpacker.

use std::path::PathBuf;

/// Errors that can occur anywhere in the unpacker.
///
/// Every fallible operation in this crate returns `Result<_, UnpackError>`.
/// No error propagates across a trap callback boundary without being
/// converted into one of these variants first.
#[derive(thiserror::Error, Debug)]
pub enum UnpackError {
    /// The introspection driver or core returned an error.
    #[error(transparent)]
    Vmi(#[from] vmi_core::VmiError),

    /// An I/O error occurred while reading the profile or writing a dump.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path the operation was attempted on.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The profile file could not be parsed as JSON.
    #[error("failed to parse profile at {path}: {source}")]
    Profile {
        /// The path the profile was read from.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A required kernel symbol or field offset was missing from the profile.
    #[error(transparent)]
    Isr(#[from] isr_macros::Error),

    /// The CLI arguments or derived configuration were invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The introspection connection was lost; the run cannot continue.
    #[error("lost introspection connection: {0}")]
    ConnectionLost(String),

    /// Neither the target PID nor the target process name could be resolved.
    #[error("process {0} not found")]
    ProcessNotFound(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = UnpackError> = std::result::Result<T, E>;
