//! TCP server implementation.

use crate::error::ServerError;
use dashmap::DashMap;
use rpcwire_core::config::NetworkConfig;
use rpcwire_core::{CloseMode, Connection, ErrorKind, Runtime, ServantLocator};
use rpcwire_protocol::DEFAULT_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Name reported to servants in each connection's info.
    pub adapter_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
            adapter_name: "adapter".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            max_connections: network.max_connections,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_adapter_name(mut self, name: impl Into<String>) -> Self {
        self.adapter_name = name.into();
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Accepts TCP connections and serves requests through a servant locator.
pub struct Server {
    config: ServerConfig,
    runtime: Arc<Runtime>,
    locator: Arc<dyn ServantLocator>,
    connections: Arc<DashMap<Uuid, Connection>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, runtime: Arc<Runtime>, locator: Arc<dyn ServantLocator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            runtime,
            locator,
            connections: Arc::new(DashMap::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener until
    /// [`Server::shutdown`] is called, then closes every connection
    /// gracefully.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        tracing::info!(
            "Server listening on {} (adapter '{}')",
            listener.local_addr()?,
            self.config.adapter_name
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            tcp_stream.set_nodelay(true).ok();

                            let runtime = self.runtime.clone();
                            let locator = self.locator.clone();
                            let connections = self.connections.clone();
                            let stats = self.stats.clone();
                            let adapter_name = self.config.adapter_name.clone();

                            tokio::spawn(async move {
                                match Connection::incoming(tcp_stream, runtime, &adapter_name, Some(locator)).await {
                                    Ok(connection) => {
                                        let id = connection.info().connection_id;
                                        connections.insert(id, connection.clone());
                                        tracing::info!("Client connected: {}", addr);

                                        let reason = connection.wait_closed().await;
                                        connections.remove(&id);
                                        if reason.kind() == ErrorKind::Protocol {
                                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                        }
                                        tracing::info!("Client disconnected: {} ({})", addr, reason);
                                    }
                                    Err(e) => {
                                        tracing::warn!("[{}] Validation failed: {}", addr, e);
                                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        drop(listener);
        let open: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in open {
            connection.close(CloseMode::Gracefully).await;
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }
}
