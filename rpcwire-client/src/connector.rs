//! TCP connection establishment.

use async_trait::async_trait;
use rpcwire_core::{
    CloseMode, Connection, ConnectionProvider, ConnectionState, LocalError, Runtime,
    ServantLocator,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Connects to the first reachable endpoint and keeps the connection
/// until it closes. The next request after a close reconnects.
pub struct TcpConnector {
    runtime: Arc<Runtime>,
    endpoints: Vec<String>,
    locator: Option<Arc<dyn ServantLocator>>,
    cached: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("endpoints", &self.endpoints)
            .field("bidirectional", &self.locator.is_some())
            .finish()
    }
}

impl TcpConnector {
    /// Creates a connector for a `host:port` endpoint.
    pub fn new(runtime: Arc<Runtime>, endpoint: impl Into<String>) -> Self {
        Self {
            runtime,
            endpoints: vec![endpoint.into()],
            locator: None,
            cached: Mutex::new(None),
        }
    }

    /// Adds a fallback endpoint, tried in order after the earlier ones.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Dispatches requests the server sends back over the connection.
    pub fn with_servant_locator(mut self, locator: Arc<dyn ServantLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Closes the cached connection, if any.
    pub async fn close(&self, mode: CloseMode) {
        let connection = self.cached.lock().await.take();
        if let Some(connection) = connection {
            connection.close(mode).await;
        }
    }

    async fn connect(&self) -> Result<Connection, LocalError> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            match self.connect_to(endpoint).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    tracing::debug!("Connection to {} failed: {}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LocalError::NoEndpoint("no endpoints configured".to_string())))
    }

    async fn connect_to(&self, endpoint: &str) -> Result<Connection, LocalError> {
        tracing::debug!("Connecting to {}...", endpoint);
        let connect = TcpStream::connect(endpoint);
        let tcp_stream = match self.runtime.config().connection.connect_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| LocalError::ConnectTimeout)??,
            None => connect.await?,
        };
        tcp_stream.set_nodelay(true).ok();

        let connection = Connection::outgoing(tcp_stream, self.runtime.clone())?;
        if let Some(locator) = &self.locator {
            connection.set_servant_locator(locator.clone());
        }
        Ok(connection)
    }
}

#[async_trait]
impl ConnectionProvider for TcpConnector {
    async fn connection(&self) -> Result<Connection, LocalError> {
        let mut cached = self.cached.lock().await;
        if let Some(connection) = cached.as_ref() {
            if matches!(
                connection.state(),
                ConnectionState::Validating | ConnectionState::Active
            ) {
                return Ok(connection.clone());
            }
        }
        let connection = self.connect().await?;
        *cached = Some(connection.clone());
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcwire_core::{Config, ErrorKind};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_no_endpoints() {
        let mut connector = TcpConnector::new(Runtime::new(Config::default()), "unused");
        connector.endpoints.clear();
        let err = connector.connection().await.unwrap_err();
        assert!(matches!(err, LocalError::NoEndpoint(_)));
    }

    #[tokio::test]
    async fn test_falls_back_and_caches() {
        // A bound-then-dropped listener leaves a port nothing listens on.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();

        let connector = TcpConnector::new(Runtime::new(Config::default()), dead_addr.to_string())
            .with_endpoint(live_addr.to_string());
        assert_eq!(connector.endpoints().len(), 2);

        let first = connector.connection().await.unwrap();
        let (_accepted, _) = live.accept().await.unwrap();
        let again = connector.connection().await.unwrap();
        assert_eq!(first.info().connection_id, again.info().connection_id);

        connector.close(CloseMode::Forcefully).await;
        assert_eq!(first.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_refused_is_transport_error() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let connector = TcpConnector::new(Runtime::new(Config::default()), dead_addr.to_string());
        let err = connector.connection().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
