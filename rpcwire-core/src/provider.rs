//! Connection acquisition for outgoing invocations.

use crate::connection::Connection;
use crate::error::LocalError;
use async_trait::async_trait;

/// Supplies the connection an invocation attempt runs on.
///
/// Called once per attempt, so an implementation that reconnects after a
/// failure gives retries a fresh connection.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connection(&self) -> Result<Connection, LocalError>;
}

/// Always hands out the same connection.
#[derive(Debug, Clone)]
pub struct FixedConnection(pub Connection);

#[async_trait]
impl ConnectionProvider for FixedConnection {
    async fn connection(&self) -> Result<Connection, LocalError> {
        Ok(self.0.clone())
    }
}
