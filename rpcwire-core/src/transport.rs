//! Byte-stream transports.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// Immutable description of a transport endpoint pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// Transport name, e.g. "tcp".
    pub name: String,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Datagram transports carry one message per packet.
    pub datagram: bool,
    /// Largest packet a datagram transport can send.
    pub max_datagram_size: Option<usize>,
}

impl TransportInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_addr: None,
            remote_addr: None,
            datagram: false,
            max_datagram_size: None,
        }
    }

    pub fn with_addrs(mut self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.remote_addr = remote;
        self
    }

    pub fn with_datagram_limit(mut self, max_datagram_size: usize) -> Self {
        self.datagram = true;
        self.max_datagram_size = Some(max_datagram_size);
        self
    }

    /// Address used to tag log lines.
    pub fn peer(&self) -> String {
        match self.remote_addr {
            Some(addr) => addr.to_string(),
            None => self.name.clone(),
        }
    }
}

/// A connected, ordered byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn info(&self) -> TransportInfo;
}

impl Transport for TcpStream {
    fn info(&self) -> TransportInfo {
        TransportInfo::new("tcp").with_addrs(self.local_addr().ok(), self.peer_addr().ok())
    }
}

/// In-memory pipe, mainly for tests.
impl Transport for DuplexStream {
    fn info(&self) -> TransportInfo {
        TransportInfo::new("duplex")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_limit() {
        let info = TransportInfo::new("udp").with_datagram_limit(1472);
        assert!(info.datagram);
        assert_eq!(info.max_datagram_size, Some(1472));
        assert_eq!(info.peer(), "udp");
    }

    #[tokio::test]
    async fn test_tcp_info() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let info = client.info();
        assert_eq!(info.name, "tcp");
        assert_eq!(info.remote_addr, Some(addr));
        assert!(!info.datagram);
    }
}
