//! Server error types.

use rpcwire_core::{ConfigError, LocalError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection error: {0}")]
    Connection(#[from] LocalError),

    #[error("server already running")]
    AlreadyRunning,
}
