//! Demo coordinator - main entry point
//!
//! Shared-terminal session coordinator: queue, invites, and the auth
//! sub-request endpoints for the fronting reverse proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use demo_coordinator::{http, Config, Coordinator, Metrics, RedisStore};

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Load and log configuration
    let config = Config::from_env();
    config.log_startup();

    let store = match RedisStore::connect(&config.redis_url).await {
        Ok(store) => store,
        Err(e) => {
            error!(
                "failed to connect to key-value store at {}: {}",
                config.redis_url, e
            );
            std::process::exit(1);
        }
    };

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        Arc::new(Metrics::new()),
        Arc::new(store),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listener");
    info!("coordinator listening on {}", addr);

    // Graceful shutdown: end the active session before the listener goes.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let shutdown_coord = Arc::clone(&coordinator);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown_coord.shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    http::run(listener, coordinator, shutdown_rx).await;
    info!("coordinator stopped");
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
