//! Runtime error taxonomy.

use rpcwire_protocol::{MarshalError, ProtocolError, RequestFailedInfo};
use std::io;
use thiserror::Error;

/// Error classes. Retry and teardown decisions are made per class, with a
/// few per-variant refinements (see [`LocalError::is_connection_fatal`]
/// and [`crate::retry::RetryPolicy::should_retry`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Protocol,
    Marshal,
    Transport,
    ConnectionLifecycle,
    RequestFailed,
    Unknown,
    Invocation,
    Resource,
    Lifecycle,
}

/// Errors reported to invocations and connection users.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),

    #[error("transport error ({kind:?}): {message}")]
    Transport { kind: io::ErrorKind, message: String },

    #[error("connection closed by peer")]
    ConnectionClosedByPeer,

    #[error("connection validation timed out")]
    ConnectTimeout,

    #[error("connection closed after being idle")]
    ConnectionIdle,

    #[error("graceful close timed out")]
    CloseTimeout,

    #[error("connection closed locally (graceful: {graceful})")]
    ConnectionManuallyClosed { graceful: bool },

    #[error("object does not exist: {0}")]
    ObjectNotExist(RequestFailedInfo),

    #[error("facet does not exist: {0}")]
    FacetNotExist(RequestFailedInfo),

    #[error("operation does not exist: {0}")]
    OperationNotExist(RequestFailedInfo),

    #[error("unknown local exception: {0}")]
    UnknownLocalException(String),

    #[error("unknown user exception: {0}")]
    UnknownUserException(String),

    #[error("unknown exception: {0}")]
    UnknownException(String),

    #[error("invocation timed out")]
    InvocationTimeout,

    #[error("invocation canceled")]
    InvocationCanceled,

    #[error("batch request queue too big: {size} bytes exceeds {max}")]
    QueueTooBig { size: usize, max: usize },

    #[error("runtime destroyed")]
    RuntimeDestroyed,

    #[error("no endpoint available: {0}")]
    NoEndpoint(String),
}

impl LocalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LocalError::Protocol(ProtocolError::Marshal(_)) => ErrorKind::Marshal,
            LocalError::Protocol(_) => ErrorKind::Protocol,
            LocalError::Marshal(_) => ErrorKind::Marshal,
            LocalError::Transport { .. } => ErrorKind::Transport,
            LocalError::ConnectionClosedByPeer
            | LocalError::ConnectTimeout
            | LocalError::ConnectionIdle
            | LocalError::CloseTimeout
            | LocalError::ConnectionManuallyClosed { .. } => ErrorKind::ConnectionLifecycle,
            LocalError::ObjectNotExist(_)
            | LocalError::FacetNotExist(_)
            | LocalError::OperationNotExist(_) => ErrorKind::RequestFailed,
            LocalError::UnknownLocalException(_)
            | LocalError::UnknownUserException(_)
            | LocalError::UnknownException(_) => ErrorKind::Unknown,
            LocalError::InvocationTimeout | LocalError::InvocationCanceled => {
                ErrorKind::Invocation
            }
            LocalError::QueueTooBig { .. } => ErrorKind::Resource,
            LocalError::RuntimeDestroyed | LocalError::NoEndpoint(_) => ErrorKind::Lifecycle,
        }
    }

    /// Whether this error, raised on a connection, tears the connection
    /// down. A marshal error carried by a single reply is not fatal; one
    /// raised while reading a message header or request is reported as
    /// [`LocalError::Protocol`] and is.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Protocol | ErrorKind::Transport | ErrorKind::ConnectionLifecycle
        ) || matches!(self, LocalError::Protocol(ProtocolError::Marshal(_)))
    }

    /// Whether this error means the connection can no longer be used.
    pub fn is_connection_closed(&self) -> bool {
        self.kind() == ErrorKind::ConnectionLifecycle
    }

    /// Short stable name, used in logs and unknown-exception replies.
    pub fn code(&self) -> &'static str {
        match self {
            LocalError::Protocol(_) => "PROTOCOL",
            LocalError::Marshal(_) => "MARSHAL",
            LocalError::Transport { .. } => "TRANSPORT",
            LocalError::ConnectionClosedByPeer => "CLOSED_BY_PEER",
            LocalError::ConnectTimeout => "CONNECT_TIMEOUT",
            LocalError::ConnectionIdle => "CONNECTION_IDLE",
            LocalError::CloseTimeout => "CLOSE_TIMEOUT",
            LocalError::ConnectionManuallyClosed { .. } => "MANUALLY_CLOSED",
            LocalError::ObjectNotExist(_) => "OBJECT_NOT_EXIST",
            LocalError::FacetNotExist(_) => "FACET_NOT_EXIST",
            LocalError::OperationNotExist(_) => "OPERATION_NOT_EXIST",
            LocalError::UnknownLocalException(_) => "UNKNOWN_LOCAL",
            LocalError::UnknownUserException(_) => "UNKNOWN_USER",
            LocalError::UnknownException(_) => "UNKNOWN",
            LocalError::InvocationTimeout => "INVOCATION_TIMEOUT",
            LocalError::InvocationCanceled => "INVOCATION_CANCELED",
            LocalError::QueueTooBig { .. } => "QUEUE_TOO_BIG",
            LocalError::RuntimeDestroyed => "RUNTIME_DESTROYED",
            LocalError::NoEndpoint(_) => "NO_ENDPOINT",
        }
    }
}

impl From<io::Error> for LocalError {
    fn from(e: io::Error) -> Self {
        LocalError::Transport {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
