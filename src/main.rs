//! connmon - Connectivity Monitor
//!
//! Polls hosts over TCP, UDP, ICMP and RPC, groups the results per device and
//! alerts when a device stays unreachable.

mod alert;
mod config;
mod coordinator;
mod db;
mod entity;
mod flow;
mod mac;
mod probe;
mod web;

use alert::Notifier;
use config::ServerConfig;
use coordinator::Coordinator;
use db::Store;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("connmon=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting connmon on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    if cfg.notify_groups.is_empty() {
        tracing::info!("No notify groups configured; alerts are only logged");
    } else {
        tracing::info!("Notify groups: {:?}", cfg.notify_groups.keys().collect::<Vec<_>>());
    }

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let notifier = Notifier::new(cfg.notify_groups.clone());

    // Start coordinator with the stored devices
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        notifier.clone(),
        cfg.probe_timeouts(),
        cfg.history_retention,
    ));
    coordinator.start().await?;

    // Start web server
    let server = Server::new(cfg, store, coordinator.clone(), notifier);
    server.start(shutdown_signal()).await?;

    coordinator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
