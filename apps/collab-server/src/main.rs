//! Collaboration WebSocket server
//! Maps each socket onto a participant of a session in the registry

use clap::Parser;
use collaboration::SessionRegistry;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod connection;

use config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter)?)
        .init();

    let addr = config.bind;
    let sweep_interval = config.sweep_interval();
    let registry = SessionRegistry::new(config.into_collaboration_config());

    let listener = TcpListener::bind(addr).await?;
    info!("Collaboration server listening on: {}", addr);

    tokio::spawn(sweep_sessions(registry.clone(), sweep_interval));

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("New connection from: {}", peer);
        tokio::spawn(connection::handle_connection(stream, peer, registry.clone()));
    }
}

/// Periodically disconnect silent participants and forget archived sessions
async fn sweep_sessions(registry: SessionRegistry, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let swept = registry.sweep_idle().await;
        let pruned = registry.prune_archived().await;
        if !swept.is_empty() || pruned > 0 {
            debug!(
                "Sweep: {} participants disconnected, {} sessions pruned",
                swept.len(),
                pruned
            );
        }
    }
}
