// dispatcher: request/response multiplexer of the activity-streams bus.

use std::env;
use std::path::Path;
use std::sync::Arc;

use dispatcher::queue::MemoryQueue;
use dispatcher::{Dispatcher, catalog, config, ws};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "dispatcher starting");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/sockethub/dispatcher.toml".to_owned());
    let config = match config::load_config_from_path(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        sockethub_id = %config.dispatcher.sockethub_id,
        platforms = ?config.dispatcher.platforms,
        "config loaded"
    );

    let registry = match catalog::load_catalog(Path::new(&config.dispatcher.catalog_path)) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("FATAL: failed to load catalog: {}", e);
            std::process::exit(1);
        }
    };

    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = Dispatcher::new(&config.dispatcher, registry, queue);

    // Readiness is advisory: requests for silent platforms are rejected at
    // ingress, so a failed init leaves the dispatcher serving.
    if let Err(e) = dispatcher.init().await {
        warn!(error = %e, "liveness init failed, continuing");
    } else {
        info!("all platform listeners live");
    }

    let router = ws::build_router(dispatcher.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .expect("failed to bind");
    info!(addr = %config.server.bind, "dispatcher listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    dispatcher.shutdown().await;
    info!("dispatcher shut down");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
