//! Client error types.

use rpcwire_core::{ErrorKind, LocalError};
use rpcwire_protocol::Encapsulation;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Local(#[from] LocalError),

    /// The servant raised a declared exception; the payload holds it.
    #[error("user exception ({} bytes)", .0.payload.len())]
    UserException(Encapsulation),
}

impl ClientError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Local(e) => Some(e.kind()),
            ClientError::UserException(_) => None,
        }
    }
}
