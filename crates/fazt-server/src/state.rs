//! Shared application state.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! handlers via `Arc`. It holds the storage backend, the write queue, every
//! core store, the limiter tables, and the maintenance circuit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};

use axum::Router;
use tracing::error;

use fazt_core::alias::AliasResolver;
use fazt_core::apikeys::ApiKeyStore;
use fazt_core::apps::AppStore;
use fazt_core::blobs::BlobStore;
use fazt_core::capacity::{CapacityHandle, CapacityOverrides, CapacityStore};
use fazt_core::deploy::Deployer;
use fazt_core::docs::DocStore;
use fazt_core::kv::KvStore;
use fazt_core::queue::WriteQueue;
use fazt_core::sessions::SessionStore;
use fazt_core::telemetry::TelemetryBuffer;
use fazt_core::users::UserStore;
use fazt_core::vfs::Vfs;
use fazt_storage::StorageBackend;

use crate::config::ServerConfig;
use crate::limits::Limits;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<dyn StorageBackend>,
    pub queue: Arc<WriteQueue>,
    pub capacity: CapacityHandle,
    pub capacity_store: CapacityStore,
    pub vfs: Arc<Vfs>,
    pub aliases: Arc<AliasResolver>,
    pub apps: Arc<AppStore>,
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionStore>,
    pub apikeys: Arc<ApiKeyStore>,
    pub kv: Arc<KvStore>,
    pub docs: Arc<DocStore>,
    pub blobs: Arc<BlobStore>,
    pub deployer: Deployer,
    pub telemetry: Arc<TelemetryBuffer>,
    pub limits: Limits,
    /// Pooled client for script outbound HTTP.
    pub http: reqwest::Client,
    /// Inner router for the reserved `admin`/`api` hosts, installed after
    /// state construction (it needs the state itself).
    admin_router: OnceLock<Router>,
    /// Maintenance mode: only the pinned admin surface answers.
    maintenance: AtomicBool,
    /// Consecutive internal errors feeding the maintenance circuit.
    circuit: AtomicU32,
    /// Operator overrides currently applied on top of derived capacity.
    overrides: RwLock<CapacityOverrides>,
}

impl AppState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn StorageBackend>,
        queue: Arc<WriteQueue>,
        capacity: CapacityHandle,
        capacity_store: CapacityStore,
        vfs: Arc<Vfs>,
        aliases: Arc<AliasResolver>,
        apps: Arc<AppStore>,
        users: Arc<UserStore>,
        sessions: Arc<SessionStore>,
        apikeys: Arc<ApiKeyStore>,
        kv: Arc<KvStore>,
        docs: Arc<DocStore>,
        blobs: Arc<BlobStore>,
        deployer: Deployer,
        telemetry: Arc<TelemetryBuffer>,
        limits: Limits,
    ) -> Self {
        Self {
            config,
            storage,
            queue,
            capacity,
            capacity_store,
            vfs,
            aliases,
            apps,
            users,
            sessions,
            apikeys,
            kv,
            docs,
            blobs,
            deployer,
            telemetry,
            limits,
            http: reqwest::Client::new(),
            admin_router: OnceLock::new(),
            maintenance: AtomicBool::new(false),
            circuit: AtomicU32::new(0),
            overrides: RwLock::new(CapacityOverrides::default()),
        }
    }

    /// Operator overrides currently in effect.
    #[must_use]
    pub fn overrides(&self) -> CapacityOverrides {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_overrides(&self, overrides: CapacityOverrides) {
        *self
            .overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner) = overrides;
    }

    /// Install the inner admin router (once, at boot).
    pub fn install_admin_router(&self, router: Router) {
        let _ = self.admin_router.set(router);
    }

    /// The inner admin router, if installed.
    #[must_use]
    pub fn admin_router(&self) -> Option<Router> {
        self.admin_router.get().cloned()
    }

    /// Whether maintenance mode is active.
    #[must_use]
    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Relaxed)
    }

    /// Flip maintenance mode explicitly (admin API).
    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::Relaxed);
        if !on {
            self.circuit.store(0, Ordering::Relaxed);
        }
    }

    /// Count an `INTERNAL` result toward the circuit; trips maintenance
    /// mode past the threshold.
    pub fn record_internal(&self) {
        let count = self.circuit.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.config.circuit_threshold && !self.in_maintenance() {
            error!(count, "internal error circuit tripped, entering maintenance mode");
            self.maintenance.store(true, Ordering::Relaxed);
        }
    }

    /// A successful request decays the circuit.
    pub fn record_success(&self) {
        let current = self.circuit.load(Ordering::Relaxed);
        if current > 0 {
            let _ = self.circuit.compare_exchange(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    /// Current circuit counter (stats endpoint).
    #[must_use]
    pub fn circuit_count(&self) -> u32 {
        self.circuit.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
