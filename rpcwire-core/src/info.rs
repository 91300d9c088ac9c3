//! Connection descriptions.

use crate::transport::TransportInfo;
use std::fmt;
use uuid::Uuid;

/// Immutable description of a connection. Built once when the connection is
/// created and shared by `Arc`; the `with_*` methods return modified copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    /// Accepted by a server rather than established by a client.
    pub incoming: bool,
    /// Name of the accepting adapter, empty for outgoing connections.
    pub adapter_name: String,
    pub transport: TransportInfo,
}

impl ConnectionInfo {
    pub fn new(incoming: bool, transport: TransportInfo) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            incoming,
            adapter_name: String::new(),
            transport,
        }
    }

    pub fn with_adapter_name(&self, name: impl Into<String>) -> Self {
        Self {
            adapter_name: name.into(),
            ..self.clone()
        }
    }

    pub fn with_transport(&self, transport: TransportInfo) -> Self {
        Self {
            transport,
            ..self.clone()
        }
    }

    pub fn is_datagram(&self) -> bool {
        self.transport.datagram
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.incoming { "in" } else { "out" };
        write!(f, "{} {}", self.transport.peer(), direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_overrides_keep_identity() {
        let info = ConnectionInfo::new(true, TransportInfo::new("tcp"));
        let named = info.with_adapter_name("printers");
        assert_eq!(named.connection_id, info.connection_id);
        assert_eq!(named.adapter_name, "printers");
        assert!(info.adapter_name.is_empty());

        let udp = info.with_transport(TransportInfo::new("udp").with_datagram_limit(512));
        assert!(udp.is_datagram());
        assert!(!info.is_datagram());
    }

    #[test]
    fn test_distinct_ids() {
        let a = ConnectionInfo::new(false, TransportInfo::new("tcp"));
        let b = ConnectionInfo::new(false, TransportInfo::new("tcp"));
        assert_ne!(a.connection_id, b.connection_id);
        assert_eq!(a.to_string(), "tcp out");
    }
}
