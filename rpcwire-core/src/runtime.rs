//! Runtime context shared by every connection and proxy.

use crate::config::Config;
use crate::connection::{CloseMode, Connection};
use crate::error::LocalError;
use crate::invocation::InvocationFailure;
use crate::observer::{NoopObserver, Observer};
use crate::retry::{invoke_with_retry, RetryPolicy, RetryQueue};
use dashmap::DashMap;
use rpcwire_protocol::OperationMode;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Owns configuration, the retry queue, the observer and the set of live
/// connections. Created once and passed around by `Arc`.
pub struct Runtime {
    config: Config,
    retry_policy: RetryPolicy,
    retry_queue: RetryQueue,
    observer: Arc<dyn Observer>,
    connections: DashMap<Uuid, Connection>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("retry_policy", &self.retry_policy)
            .field("connections", &self.connections.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Runtime {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(config: Config, observer: Arc<dyn Observer>) -> Arc<Self> {
        let retry_policy = RetryPolicy::from_config(&config.retry);
        Arc::new(Self {
            config,
            retry_policy,
            retry_queue: RetryQueue::new(),
            observer,
            connections: DashMap::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    pub fn observer(&self) -> &dyn Observer {
        self.observer.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of connections not yet closed.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn register(&self, connection: &Connection) -> Result<(), LocalError> {
        if self.is_destroyed() {
            return Err(LocalError::RuntimeDestroyed);
        }
        let id = connection.info().connection_id;
        self.connections.insert(id, connection.clone());
        // destroy() may have taken its snapshot between the check and the insert.
        if self.is_destroyed() {
            self.connections.remove(&id);
            return Err(LocalError::RuntimeDestroyed);
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, id: &Uuid) {
        self.connections.remove(id);
    }

    /// Runs an invocation under the runtime's retry policy.
    pub async fn invoke<T, F, Fut>(
        &self,
        operation: &str,
        mode: OperationMode,
        attempt: F,
    ) -> Result<T, LocalError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InvocationFailure>>,
    {
        if self.is_destroyed() {
            return Err(LocalError::RuntimeDestroyed);
        }
        invoke_with_retry(
            &self.retry_policy,
            &self.retry_queue,
            self.observer.as_ref(),
            operation,
            mode,
            attempt,
        )
        .await
    }

    /// Shuts the runtime down: pending retries are canceled, every live
    /// connection is closed and its waiting invocations fail with
    /// [`LocalError::RuntimeDestroyed`], then running retries are awaited.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Destroying runtime");
        self.retry_queue.close();

        let connections: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            connection.abort(LocalError::RuntimeDestroyed);
            connection.wait_closed().await;
        }
        self.connections.clear();
        self.retry_queue.destroy().await;
    }

    /// Gracefully closes every live connection.
    pub async fn close_all(&self, mode: CloseMode) {
        let connections: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            connection.close(mode).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_destroyed_runtime_rejects_invocations() {
        let runtime = Runtime::new(Config::default());
        runtime.destroy().await;
        assert!(runtime.is_destroyed());
        assert!(runtime.retry_queue().is_destroyed());

        let result: Result<(), LocalError> = runtime
            .invoke("op", OperationMode::Normal, |_| async { Ok(()) })
            .await;
        assert_eq!(result, Err(LocalError::RuntimeDestroyed));
    }

    #[tokio::test]
    async fn test_policy_from_config() {
        let mut config = Config::default();
        config.retry.max_attempts = 9;
        let runtime = Runtime::new(config);
        assert_eq!(runtime.retry_policy().max_attempts, 9);
        assert_eq!(runtime.connection_count(), 0);
    }
}
