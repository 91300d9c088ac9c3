//! rpcwire - binary RPC middleware server
//!
//! Serves an echo object over TCP until interrupted.

use clap::Parser;
use rpcwire_core::{Config, Runtime, StatsObserver};
use rpcwire_protocol::Identity;
use rpcwire_server::{Echo, ServantMap, Server, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rpcwire", version, about = "Binary RPC middleware server")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "RPCWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the configuration)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Identity the echo servant is registered under
    #[arg(long, default_value = "echo")]
    identity: String,

    /// Object adapter name
    #[arg(long, default_value = "adapter")]
    adapter: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load_from(args.config.as_deref()) {
        Ok(c) => {
            if let Some(path) = &args.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(bind) = args.bind {
        config.network.bind_addr = bind;
    }

    tracing::info!("Starting rpcwire server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max message size: {} bytes", config.protocol.max_message_size);
    tracing::info!("  Idle timeout: {:?}", config.connection.idle_timeout());
    tracing::info!(
        "  Retries: {} (base {:?}, max {:?})",
        config.retry.max_attempts,
        config.retry.base_interval(),
        config.retry.max_interval()
    );

    let stats = Arc::new(StatsObserver::default());
    let server_config = ServerConfig::from_network(&config.network).with_adapter_name(&args.adapter);
    let runtime = Runtime::with_observer(config, stats.clone());

    let servants = Arc::new(ServantMap::new());
    servants.add(Identity::new(args.identity.as_str()), Arc::new(Echo));
    tracing::info!("Serving echo object '{}'", args.identity);

    let server = Arc::new(Server::new(server_config, runtime.clone(), servants));

    // Handle shutdown signal
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        shutdown_server.shutdown();
    });

    server.run().await?;
    runtime.destroy().await;

    tracing::info!(
        "Served {} connections, {} messages received, {} sent",
        stats.connections_total.load(Ordering::Relaxed),
        stats.messages_received.load(Ordering::Relaxed),
        stats.messages_sent.load(Ordering::Relaxed)
    );
    tracing::info!("Server stopped");
    Ok(())
}
