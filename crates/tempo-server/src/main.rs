mod config;
mod logger;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tempo_core::admission::AdmissionController;
use tempo_core::registry::ActiveRunRegistry;
use tempo_core::store::Store;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Args, Config};
use crate::state::AppState;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::resolve(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    logger::init_logging(false);

    let store = match Store::open(&config.db_path).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("failed to open store at {}: {err}", config.db_path.display());
            std::process::exit(1);
        }
    };
    let registry = Arc::new(ActiveRunRegistry::new());
    let admission = Arc::new(AdmissionController::new());
    let shutdown = CancellationToken::new();
    admission.spawn_pruner(shutdown.clone());

    let app = routes::router(AppState {
        store,
        registry: Arc::clone(&registry),
        admission,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "tempo-server listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
    {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }

    // §5: graceful shutdown must cancel every run and finalize within 30s
    // before the process exits.
    shutdown.cancel();
    registry.cancel_all().await;
    wait_for_drain(&registry, Duration::from_secs(30)).await;
}

/// Resolves once Ctrl-C arrives, also tripping `shutdown` so collaborators
/// sharing it (e.g. the admission pruner) wind down alongside the server.
async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    shutdown.cancel();
}

/// Polls the registry until every run has finalized or `timeout` elapses.
async fn wait_for_drain(registry: &ActiveRunRegistry, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !registry.is_empty().await {
        if tokio::time::Instant::now() >= deadline {
            warn!(remaining = registry.len().await, "shutdown timed out waiting for runs to finalize");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
