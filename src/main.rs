// Control-plane server binary.
//
// Binds the HTTP/WebSocket API and waits; monitoring runs start via
// POST /api/start-monitoring. Exit code 0 on clean shutdown; startup
// (config/storage/bind) failures exit non-zero.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use votefleet::{router, AppState, ConfigStore, ObservationBus, SessionStore, VoteLog};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    // Modules on the log facade (proxy broker) still reach stderr.
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();

    let storage_root = match std::env::var("VOTEFLEET_ROOT") {
        Ok(root) => PathBuf::from(root),
        Err(_) => std::env::current_dir().context("resolve working directory")?,
    };
    let storage_root = if storage_root.is_absolute() {
        storage_root
    } else {
        std::env::current_dir()
            .context("resolve working directory")?
            .join(storage_root)
    };
    info!(root = %storage_root.display(), "storage root");

    let config_store = Arc::new(ConfigStore::open(&storage_root)?);
    let log = VoteLog::open(&storage_root.join("vote_log.csv"))
        .await
        .context("open vote log")?;
    let store = SessionStore::open(&storage_root)
        .await
        .context("open session store")?;
    let bus = ObservationBus::new(1024, 1000);

    let headless = std::env::var("VOTEFLEET_HEADFUL").is_err();
    let state = Arc::new(AppState {
        storage_root,
        config_store,
        bus,
        log,
        store,
        headless,
        monitor: tokio::sync::Mutex::new(None),
    });

    let addr: SocketAddr = std::env::var("VOTEFLEET_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()
        .context("parse VOTEFLEET_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control plane on {addr}"))?;
    info!(addr = %addr, "control plane listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("shutdown signal received");
            if let Some(supervisor) = shutdown_state.monitor.lock().await.take() {
                supervisor.stop().await;
            }
        })
        .await
        .context("control plane server error")?;

    info!("clean shutdown");
    Ok(())
}
