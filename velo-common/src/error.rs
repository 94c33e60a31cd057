//! Common error types for the velo services

use thiserror::Error;

/// Common result type for velo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared across the velo crates
///
/// Configuration is the only concern velo-common owns beyond file access;
/// service-level errors live with the service that produces them.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration parse or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
