//! Errors raised while resolving settings.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was opened.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The settings file is not JSON.
    #[error("{} is not valid settings JSON: {source}", path.display())]
    Malformed {
        /// File that was parsed.
        path: PathBuf,
        /// Parser error with line and column.
        source: serde_json::Error,
    },
    /// The merged document does not deserialize into [`crate::CourierSettings`],
    /// for example a string where a number belongs.
    #[error("settings do not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),
    /// A value is out of range or contradicts another.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result alias for settings resolution.
pub type Result<T> = std::result::Result<T, SettingsError>;
