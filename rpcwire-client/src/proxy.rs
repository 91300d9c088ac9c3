//! Proxies: typed handles to remote objects.

use crate::error::ClientError;
use rpcwire_core::{ConnectionProvider, InvocationFailure, LocalError, Response, Runtime};
use rpcwire_protocol::{Context, Encapsulation, Identity, OperationMode, Request};
use std::sync::Arc;

/// Handle to a remote object. Every invocation goes through the runtime's
/// retry policy and asks the provider for a connection on each attempt.
#[derive(Clone)]
pub struct Proxy {
    identity: Identity,
    facet: String,
    context: Context,
    provider: Arc<dyn ConnectionProvider>,
    runtime: Arc<Runtime>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("identity", &self.identity)
            .field("facet", &self.facet)
            .field("context", &self.context)
            .finish()
    }
}

impl Proxy {
    pub fn new(
        identity: Identity,
        provider: Arc<dyn ConnectionProvider>,
        runtime: Arc<Runtime>,
    ) -> Self {
        Self {
            identity,
            facet: String::new(),
            context: Context::new(),
            provider,
            runtime,
        }
    }

    /// Returns a proxy for another facet of the same object.
    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        Self {
            facet: facet.into(),
            ..self.clone()
        }
    }

    /// Returns a proxy that sends `context` with every request.
    pub fn with_context(&self, context: Context) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn facet(&self) -> &str {
        &self.facet
    }

    fn request(&self, operation: &str, mode: OperationMode, params: Encapsulation) -> Request {
        Request::new(self.identity.clone(), operation)
            .with_facet(self.facet.clone())
            .with_mode(mode)
            .with_context(self.context.clone())
            .with_params(params)
    }

    /// Invokes a twoway operation. A user exception comes back as a
    /// response with `ok == false`.
    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Encapsulation,
    ) -> Result<Response, LocalError> {
        let request = &self.request(operation, mode, params);
        let provider = &self.provider;
        self.runtime
            .invoke(operation, mode, move |attempt| async move {
                if attempt > 0 {
                    tracing::debug!("Retrying '{}' (attempt {})", request.operation, attempt + 1);
                }
                let connection = provider
                    .connection()
                    .await
                    .map_err(InvocationFailure::unsent)?;
                connection.send_request(request).await
            })
            .await
    }

    /// Invokes a twoway operation and maps a user exception to
    /// [`ClientError::UserException`].
    pub async fn call(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Encapsulation,
    ) -> Result<Encapsulation, ClientError> {
        let response = self.invoke(operation, mode, params).await?;
        if response.ok {
            Ok(response.params)
        } else {
            Err(ClientError::UserException(response.params))
        }
    }

    /// Checks that the object exists.
    pub async fn ice_ping(&self) -> Result<(), ClientError> {
        self.call("ice_ping", OperationMode::Idempotent, Encapsulation::default())
            .await
            .map(|_| ())
    }

    /// Sends a oneway request. Only a request that never reached the
    /// transport is retried.
    pub async fn invoke_oneway(
        &self,
        operation: &str,
        params: Encapsulation,
    ) -> Result<(), LocalError> {
        let request = &self.request(operation, OperationMode::Normal, params);
        let provider = &self.provider;
        self.runtime
            .invoke(operation, OperationMode::Normal, move |_| async move {
                let connection = provider
                    .connection()
                    .await
                    .map_err(InvocationFailure::unsent)?;
                connection
                    .send_oneway(request)
                    .await
                    .map(|_| ())
                    .map_err(InvocationFailure::unsent)
            })
            .await
    }

    /// Adds a oneway request to the connection's batch queue.
    pub async fn invoke_batch(
        &self,
        operation: &str,
        params: Encapsulation,
    ) -> Result<(), LocalError> {
        let request = self.request(operation, OperationMode::Normal, params);
        let connection = self.provider.connection().await?;
        connection.enqueue_batch(&request).await
    }

    /// Sends the queued batch requests.
    pub async fn flush_batch(&self) -> Result<(), LocalError> {
        let connection = self.provider.connection().await?;
        connection.flush_batch().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::TcpConnector;
    use rpcwire_core::{
        Config, Current, DispatchError, DispatchResult, Dispatcher, ErrorKind, StatsObserver,
    };
    use rpcwire_protocol::ENCODING_1_1;
    use rpcwire_server::{Echo, OperationTable, ServantMap, Server, ServerConfig};
    use std::sync::atomic::Ordering;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn serve(servants: ServantMap) -> (Arc<Server>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(Server::new(
            ServerConfig::default(),
            Runtime::new(Config::default()),
            Arc::new(servants),
        ));
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    fn proxy(name: &str, endpoint: &str, runtime: Arc<Runtime>) -> Proxy {
        let connector = Arc::new(TcpConnector::new(runtime.clone(), endpoint));
        Proxy::new(Identity::new(name), connector, runtime)
    }

    #[tokio::test]
    async fn test_invoke_echo_and_user_exception() {
        let servants = ServantMap::new();
        servants.add(Identity::new("echo"), Arc::new(Echo));
        servants.add(
            Identity::new("strict"),
            Arc::new(OperationTable::new("::Demo::Strict").with_operation(
                "reject",
                |_current, params| async move {
                    Err::<Encapsulation, _>(DispatchError::UserException(params))
                },
            )),
        );
        let (server, addr) = serve(servants).await;
        let runtime = Runtime::new(Config::default());

        let echo = proxy("echo", &addr, runtime.clone());
        let params = Encapsulation::build(ENCODING_1_1, |os| os.write_i32(99));
        let out = echo
            .call("anything", OperationMode::Normal, params.clone())
            .await
            .unwrap();
        assert_eq!(out, params);

        let strict = proxy("strict", &addr, runtime.clone());
        strict.ice_ping().await.unwrap();
        let err = strict
            .call("reject", OperationMode::Normal, params.clone())
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::UserException(params));

        let missing = proxy("missing", &addr, runtime);
        let err = missing.ice_ping().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::RequestFailed));

        server.shutdown();
    }

    struct Recorder(mpsc::UnboundedSender<String>);

    #[async_trait::async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(&self, current: &Current, _params: Encapsulation) -> DispatchResult {
            let _ = self.0.send(current.operation.clone());
            Ok(Encapsulation::default())
        }
    }

    #[tokio::test]
    async fn test_oneway_and_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let servants = ServantMap::new();
        servants.add(Identity::new("log"), Arc::new(Recorder(tx)));
        let (server, addr) = serve(servants).await;

        let log = proxy("log", &addr, Runtime::new(Config::default()));
        log.invoke_oneway("first", Encapsulation::default())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "first");

        log.invoke_batch("b1", Encapsulation::default()).await.unwrap();
        log.invoke_batch("b2", Encapsulation::default()).await.unwrap();
        log.flush_batch().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "b1");
        assert_eq!(rx.recv().await.unwrap(), "b2");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_idempotent_call_retries_then_fails() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let mut config = Config::default();
        config.retry.base_interval_ms = 1;
        config.retry.max_interval_ms = 4;
        let stats = Arc::new(StatsObserver::default());
        let runtime = Runtime::with_observer(config, stats.clone());
        let target = proxy("gone", &dead_addr, runtime);

        let err = target.ice_ping().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Transport));
        assert_eq!(
            stats.retries_total.load(Ordering::Relaxed),
            Config::default().retry.max_attempts as u64
        );
        assert_eq!(stats.failures_total.load(Ordering::Relaxed), 1);
    }
}
