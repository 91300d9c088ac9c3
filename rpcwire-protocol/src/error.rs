//! Protocol and marshaling error types.

use crate::frame::MessageType;
use crate::version::{EncodingVersion, ProtocolVersion};
use thiserror::Error;

/// Errors raised while encoding or decoding values.
///
/// A marshal error is scoped to the decode operation that raised it; the
/// caller decides whether the surrounding message is still trustworthy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("out of bounds: needed {needed} bytes, {remaining} remaining")]
    OutOfBounds { needed: usize, remaining: usize },

    #[error("negative size: {0}")]
    NegativeSize(i32),

    #[error("sequence of {size} elements cannot fit in {remaining} remaining bytes")]
    InvalidSequenceSize { size: usize, remaining: usize },

    #[error("invalid encapsulation size: {0}")]
    InvalidEncapsulationSize(i32),

    #[error("encapsulation has {0} unread bytes")]
    EncapsulationNotConsumed(usize),

    #[error("no encapsulation is open")]
    NoEncapsulation,

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(EncodingVersion),

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("invalid {what}: {value}")]
    InvalidEnumerator { what: &'static str, value: u8 },

    #[error("optional value format mismatch: expected {expected}, got {actual}")]
    OptionalFormatMismatch { expected: u8, actual: u8 },

    #[error("cannot skip a class-formatted optional value")]
    ClassSkipUnsupported,

    #[error("facet path must have at most one element, got {0}")]
    InvalidFacetPath(usize),

    #[error("message body has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("size {0} does not fit in 32 bits")]
    SizeOverflow(usize),
}

/// Protocol-level errors. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad magic: expected 'IceP', got {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(ProtocolVersion),

    #[error("unsupported header encoding: {0}")]
    UnsupportedEncoding(EncodingVersion),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("invalid compression status: {0}")]
    InvalidCompressionStatus(u8),

    #[error("illegal message size: {size} bytes for {message_type}")]
    IllegalMessageSize {
        size: usize,
        message_type: MessageType,
    },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("compression error: {0}")]
    Compression(String),

    #[error("received compressed message but compression is not supported")]
    CompressionNotSupported,

    #[error("reply for unknown request id {0}")]
    UnknownRequestId(i32),

    #[error("unexpected {0} message")]
    UnexpectedMessage(MessageType),

    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),
}

impl ProtocolError {
    /// Returns whether this error came from payload decompression rather
    /// than from framing.
    pub fn is_compression(&self) -> bool {
        matches!(
            self,
            ProtocolError::Compression(_) | ProtocolError::CompressionNotSupported
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::BadMagic(*b"XceP");
        assert!(err.to_string().contains("magic"));

        let err = ProtocolError::UnsupportedProtocol(ProtocolVersion::new(2, 0));
        assert!(err.to_string().contains("2.0"));

        let err = ProtocolError::MessageTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::IllegalMessageSize {
            size: 3,
            message_type: MessageType::Reply,
        };
        let msg = err.to_string();
        assert!(msg.contains('3') && msg.contains("reply"));

        let err = ProtocolError::UnknownRequestId(7);
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_marshal_error_display() {
        let err = MarshalError::OutOfBounds {
            needed: 4,
            remaining: 1,
        };
        assert!(err.to_string().contains("out of bounds"));

        let err = MarshalError::InvalidEnumerator {
            what: "reply status",
            value: 42,
        };
        assert!(err.to_string().contains("reply status"));

        let err = MarshalError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_compression_errors_are_distinct() {
        assert!(ProtocolError::Compression("bad stream".into()).is_compression());
        assert!(ProtocolError::CompressionNotSupported.is_compression());
        assert!(!ProtocolError::BadMagic(*b"abcd").is_compression());
        assert!(!ProtocolError::from(MarshalError::InvalidUtf8).is_compression());
    }
}
