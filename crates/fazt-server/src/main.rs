//! Fazt server entry point.
//!
//! Bootstraps the storage backend, capacity probe, write queue, core
//! stores, and system apps, then starts the Axum server with graceful
//! shutdown. Background workers (telemetry flusher, session sweeper,
//! limiter GC) run alongside and are cancelled on shutdown; the write
//! queue drains last so every ack'd write is durable at exit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use fazt_core::alias::{AliasResolver, refresh_wildcard_domain};
use fazt_core::apikeys::ApiKeyStore;
use fazt_core::apps::AppStore;
use fazt_core::blobs::BlobStore;
use fazt_core::capacity::{CapacityHandle, CapacityStore};
use fazt_core::deploy::Deployer;
use fazt_core::docs::DocStore;
use fazt_core::kv::KvStore;
use fazt_core::queue::WriteQueue;
use fazt_core::sessions::SessionStore;
use fazt_core::telemetry::{TelemetryBuffer, run_flusher};
use fazt_core::users::UserStore;
use fazt_core::vfs::Vfs;
use fazt_storage::{MemoryBackend, RedbBackend, StorageBackend};

use fazt_server::assets;
use fazt_server::config::{ServerConfig, StorageBackendType};
use fazt_server::dispatch;
use fazt_server::limits::Limits;
use fazt_server::routes;
use fazt_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, domain = %config.domain, "Fazt starting");

    let storage: Arc<dyn StorageBackend> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        StorageBackendType::Redb { path } => {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            info!(path = %path, "using redb storage");
            Arc::new(RedbBackend::open(path).context("failed to open redb storage")?)
        }
    };

    // Probe capacity (reads only — the queue is sized from it), then start
    // the queue and persist the record through it.
    let capacity_store = CapacityStore::new(Arc::clone(&storage));
    let (boot_capacity, overrides) = capacity_store
        .load_or_probe()
        .await
        .context("failed to load capacity")?;
    let queue = WriteQueue::start(boot_capacity.write_queue_depth as usize);
    let capacity = capacity_store
        .recalibrate(&queue, overrides.clone())
        .await
        .context("failed to persist capacity")?;
    info!(
        ram_bytes = capacity.effective_ram_bytes,
        cpus = capacity.cpus,
        cache_bytes = capacity.vfs_cache_bytes,
        queue_depth = capacity.write_queue_depth,
        "capacity derived"
    );

    // Core stores.
    let vfs = Arc::new(Vfs::new(
        Arc::clone(&storage),
        Arc::clone(&queue),
        capacity.vfs_cache_bytes,
        capacity.big_file_threshold_bytes,
    ));
    let aliases = Arc::new(AliasResolver::new(
        Arc::clone(&storage),
        Arc::clone(&queue),
        &config.domain,
    ));
    aliases.load().await.context("failed to load aliases")?;

    // Wildcard DNS domains carry the bound IP; refresh it when it went stale.
    if let Some(local_ip) = detect_local_ip() {
        if let Some(refreshed) = refresh_wildcard_domain(&config.domain, &local_ip) {
            info!(old = %config.domain, new = %refreshed, "wildcard domain refreshed");
            aliases.set_base_domain(&refreshed).await;
        }
    }

    let apps = Arc::new(AppStore::new(Arc::clone(&storage), Arc::clone(&queue)));
    let users = Arc::new(UserStore::new(Arc::clone(&storage), Arc::clone(&queue)));
    let sessions = Arc::new(SessionStore::new(Arc::clone(&storage), Arc::clone(&queue)));
    let apikeys = Arc::new(ApiKeyStore::new(Arc::clone(&storage), Arc::clone(&queue)));
    let kv = Arc::new(KvStore::new(Arc::clone(&storage), Arc::clone(&queue)));
    let docs = Arc::new(DocStore::new(Arc::clone(&storage), Arc::clone(&queue)));
    let blobs = Arc::new(BlobStore::new(Arc::clone(&storage), Arc::clone(&queue)));
    let deployer = Deployer::new(
        Arc::clone(&storage),
        Arc::clone(&queue),
        Arc::clone(&apps),
        Arc::clone(&vfs),
    );
    let telemetry = Arc::new(TelemetryBuffer::new(8, 1000, 100_000));
    let limits = Limits::new(
        capacity.rate_per_second,
        capacity.rate_burst,
        capacity.max_connections_per_ip,
    );

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&storage),
        Arc::clone(&queue),
        CapacityHandle::new(capacity.clone()),
        capacity_store,
        Arc::clone(&vfs),
        aliases,
        Arc::clone(&apps),
        users,
        sessions,
        Arc::clone(&apikeys),
        kv,
        docs,
        blobs,
        deployer,
        Arc::clone(&telemetry),
        limits,
    ));
    state.set_overrides(overrides);

    // System apps installed and pinned before the first request.
    assets::bootstrap(&apps, &vfs)
        .await
        .context("failed to bootstrap system apps")?;

    issue_bootstrap_key(&state).await?;

    let max_body = usize::try_from(capacity.max_upload_bytes).unwrap_or(usize::MAX);
    state.install_admin_router(routes::admin_router(Arc::clone(&state), max_body));

    let app = Router::new()
        .fallback(dispatch::dispatch)
        .layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            dispatch::limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(Arc::clone(&state));

    // Shutdown signal channel + background workers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let flusher = tokio::spawn(run_flusher(
        Arc::clone(&telemetry),
        Arc::clone(&storage),
        Arc::clone(&queue),
        Duration::from_secs(config.telemetry_flush_secs),
        shutdown_rx.clone(),
    ));
    let sweeper = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            sweep_worker(&state, &mut rx).await;
        })
    };

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Fazt listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    // In-flight requests have drained. Final telemetry flush, then drain
    // the write queue so every ack'd write is on disk.
    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), flusher).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), sweeper).await;
    state.queue.drain().await;

    info!("Fazt stopped");
    Ok(())
}

/// First boot: mint the owner bootstrap API key and log it once.
async fn issue_bootstrap_key(state: &Arc<AppState>) -> anyhow::Result<()> {
    const MARKER: &str = "sys/owner-bootstrap";
    if state
        .storage
        .get(MARKER)
        .await
        .context("bootstrap marker read failed")?
        .is_some()
    {
        return Ok(());
    }

    let (_, plaintext) = state
        .apikeys
        .create("owner", vec!["admin".to_owned()])
        .await
        .context("bootstrap key creation failed")?;

    let storage = Arc::clone(&state.storage);
    state
        .queue
        .submit(move || async move { storage.put(MARKER, b"1").await })
        .await
        .context("bootstrap marker queue failed")?
        .context("bootstrap marker write failed")?;

    info!(key = %plaintext, "owner bootstrap API key issued — shown once, store it now");
    Ok(())
}

/// Session expiry sweep and limiter GC on fixed cadences.
async fn sweep_worker(state: &Arc<AppState>, shutdown: &mut watch::Receiver<bool>) {
    let mut session_tick = tokio::time::interval(Duration::from_secs(600));
    let mut limiter_tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = session_tick.tick() => {
                match state.sessions.sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "expired sessions swept"),
                    Err(e) => warn!(error = %e, "session sweep failed"),
                }
            }
            _ = limiter_tick.tick() => {
                state.limits.sweep_idle();
            }
            _ = shutdown.changed() => {
                info!("sweep worker shutting down");
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
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

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}

/// The local IP a wildcard DNS domain should embed.
fn detect_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
