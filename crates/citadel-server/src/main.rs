//! Citadel server entry point.
//!
//! Bootstraps storage, the core, and the background workers (lease
//! expiration, HA heartbeat), then serves HTTP with graceful shutdown.
//!
//! Exit codes: 0 clean shutdown, 1 startup error (bad config, storage
//! unavailable), 2 runtime integrity failure (handled where detected).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use citadel_core::crypto::EncryptionKey;
use citadel_core::seal::AeadKeyWrapper;
use citadel_core::{Core, CoreConfig, SealProvider};
use citadel_raft::{Fsm, RaftStore};
use citadel_storage::{MemoryBackend, RedbBackend, StorageBackend};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use citadel_server::config::{SealStanza, ServerConfig, StorageBackendType};
use citadel_server::state::AppState;

fn main() {
    if let Err(err) = run() {
        eprintln!("citadel-server startup failed: {err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage, node_id = %config.node_id, "citadel starting");

    let storage = build_storage(&config).context("unable to open storage")?;
    let seal = build_seal(&config).context("invalid seal configuration")?;

    let core = Core::new(
        storage,
        seal,
        CoreConfig {
            node_id: config.node_id.clone(),
            api_addr: config.api_addr.clone(),
            default_lease_ttl: config.default_lease_ttl,
            max_lease_ttl: config.max_lease_ttl,
            request_timeout_secs: config.request_timeout_secs,
            ..CoreConfig::default()
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("core construction failed: {e}"))?;

    // Auto-unseal providers open the barrier at startup when possible.
    if !matches!(config.seal, SealStanza::Shamir) {
        match core.auto_unseal().await {
            Ok(()) => info!("auto-unseal complete"),
            Err(e) => warn!(error = %e, "auto-unseal not performed"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Lease expiration loop.
    let expiration_handle = tokio::spawn(
        Arc::clone(core.expiration()).run(shutdown_rx.clone(), config.expiration_interval_secs),
    );

    // HA heartbeat / promotion loop.
    let ha_handle = {
        let core = Arc::clone(&core);
        let mut shutdown = shutdown_rx.clone();
        let interval_secs = config.ha_tick_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = core.ha_tick().await {
                            warn!(error = %e, "ha tick failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    };

    let app = citadel_server::build_router(AppState {
        core: Arc::clone(&core),
    })
    .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "citadel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers");
    let _ = tokio::time::timeout(Duration::from_secs(10), expiration_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), ha_handle).await;

    // Seal on the way out so key material does not outlive the process.
    if let Err(e) = core.seal_core().await {
        warn!(error = %e, "final seal failed");
    }

    info!("citadel stopped");
    Ok(())
}

fn build_storage(config: &ServerConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    Ok(match &config.storage {
        StorageBackendType::Memory => {
            warn!("using in-memory storage; data will not survive restart");
            Arc::new(MemoryBackend::new())
        }
        StorageBackendType::Redb { path } => {
            std::fs::create_dir_all(path)
                .with_context(|| format!("creating storage dir {path}"))?;
            let file = std::path::Path::new(path).join("citadel.redb");
            Arc::new(RedbBackend::open(&file).map_err(|e| anyhow::anyhow!("{e}"))?)
        }
        StorageBackendType::Raft { path } => {
            std::fs::create_dir_all(path)
                .with_context(|| format!("creating storage dir {path}"))?;
            let file = std::path::Path::new(path).join("fsm.redb");
            let fsm = Fsm::open(&file).map_err(|e| anyhow::anyhow!("{e}"))?;
            Arc::new(RaftStore::new(Arc::new(fsm)))
        }
    })
}

fn build_seal(config: &ServerConfig) -> anyhow::Result<SealProvider> {
    Ok(match &config.seal {
        SealStanza::Shamir => SealProvider::Shamir,
        SealStanza::Static { key_hex } => {
            let bytes = hex::decode(key_hex).context("CITADEL_SEAL_KEY is not valid hex")?;
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("CITADEL_SEAL_KEY must be 32 bytes of hex"))?;
            SealProvider::Static(EncryptionKey::from_bytes(arr))
        }
        SealStanza::Kms { key_hex, key_id } => {
            let bytes = hex::decode(key_hex).context("CITADEL_SEAL_KEY is not valid hex")?;
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("CITADEL_SEAL_KEY must be 32 bytes of hex"))?;
            SealProvider::External(Arc::new(AeadKeyWrapper::new(
                EncryptionKey::from_bytes(arr),
                key_id.clone(),
            )))
        }
    })
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
