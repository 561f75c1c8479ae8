//! Error types shared across the engine.

use thiserror::Error;

/// Main error type for the non-GPU parts of the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed or serialized
    #[error("Config error: {0}")]
    Config(String),

    /// Configuration parsed but holds an unusable value
    #[error("Invalid config value for `{field}`: {reason}")]
    InvalidConfig {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;
