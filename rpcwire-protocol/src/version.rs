//! Protocol and encoding versions.

use crate::error::{MarshalError, ProtocolError};
use std::fmt;

/// Version of the message protocol carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// Version of the value encoding used by a header or an encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

/// Protocol 1.0, the only major version this implementation speaks.
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Encoding 1.0.
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };

/// Encoding 1.1 (adds tagged optional values).
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

/// Encoding written in message headers.
pub const HEADER_ENCODING: EncodingVersion = ENCODING_1_0;

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Same major version, any minor version, is accepted.
    pub fn check_supported(self) -> Result<(), ProtocolError> {
        if self.major != PROTOCOL_1_0.major {
            return Err(ProtocolError::UnsupportedProtocol(self));
        }
        Ok(())
    }
}

impl EncodingVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Checks the encoding of a message header: same major, any minor.
    pub fn check_header(self) -> Result<(), ProtocolError> {
        if self.major != HEADER_ENCODING.major {
            return Err(ProtocolError::UnsupportedEncoding(self));
        }
        Ok(())
    }

    /// Checks the encoding of an encapsulation. Unlike headers, the payload
    /// can only be decoded if the minor version is known.
    pub fn check_supported(self) -> Result<(), MarshalError> {
        if self.major != ENCODING_1_1.major || self.minor > ENCODING_1_1.minor {
            return Err(MarshalError::UnsupportedEncoding(self));
        }
        Ok(())
    }

    pub fn is_1_0(self) -> bool {
        self == ENCODING_1_0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_minor_skew_accepted() {
        assert!(ProtocolVersion::new(1, 0).check_supported().is_ok());
        assert!(ProtocolVersion::new(1, 7).check_supported().is_ok());
        assert!(matches!(
            ProtocolVersion::new(2, 0).check_supported(),
            Err(ProtocolError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_encapsulation_encoding_is_strict() {
        assert!(ENCODING_1_0.check_supported().is_ok());
        assert!(ENCODING_1_1.check_supported().is_ok());
        assert!(EncodingVersion::new(1, 2).check_supported().is_err());
        assert!(EncodingVersion::new(2, 0).check_supported().is_err());
        assert!(EncodingVersion::new(1, 9).check_header().is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(PROTOCOL_1_0.to_string(), "1.0");
        assert_eq!(ENCODING_1_1.to_string(), "1.1");
    }
}
