//! Capacity probe and tunables.
//!
//! At boot (and on an explicit recalibrate) the probe inspects the
//! container memory limit — cgroup v2 first, then v1, then total system
//! memory — and the CPU count, and derives the cache budget, concurrency
//! ceilings, queue depth, and upload ceiling from them. The derived values
//! plus any operator overrides are persisted at `sys/capacity` so they
//! survive restarts and can be inspected via the admin API.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use fazt_storage::StorageBackend;

use crate::error::CapacityError;
use crate::queue::WriteQueue;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Storage key for the persisted tunables.
const CAPACITY_KEY: &str = "sys/capacity";

/// Hard cap on script wall-clock time, milliseconds.
pub const MAX_EXECUTION_MS: u64 = 100;

/// Hard cap on per-invocation VM memory, bytes.
pub const MAX_EXECUTION_MEMORY_BYTES: u64 = 50 * MIB;

/// Files larger than this bypass the VFS cache and stream from storage.
pub const BIG_FILE_THRESHOLD_BYTES: u64 = 5 * MIB;

/// The complete set of derived tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Effective RAM the process may assume (cgroup limit or system total).
    pub effective_ram_bytes: u64,
    /// Logical CPU count.
    pub cpus: u32,
    /// Byte budget for the VFS LRU cache (pinned region excluded).
    pub vfs_cache_bytes: u64,
    /// Ceiling on concurrently dispatched requests.
    pub max_concurrent_requests: u32,
    /// Ceiling on request bodies and individual blob/file uploads.
    pub max_upload_bytes: u64,
    /// Write queue depth.
    pub write_queue_depth: u32,
    /// Script wall-clock budget, milliseconds.
    pub max_execution_ms: u64,
    /// Script memory budget, bytes.
    pub max_execution_memory_bytes: u64,
    /// End-to-end request deadline, milliseconds.
    pub request_deadline_ms: u64,
    /// Sustained per-IP request rate, per second.
    pub rate_per_second: u32,
    /// Per-IP burst allowance.
    pub rate_burst: u32,
    /// Per-IP concurrent connection cap.
    pub max_connections_per_ip: u32,
    /// Big-file cache bypass threshold, bytes.
    pub big_file_threshold_bytes: u64,
}

/// Operator overrides, applied on top of the derived values and preserved
/// across recalibration. `None` means "use the derived value".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityOverrides {
    pub vfs_cache_bytes: Option<u64>,
    pub max_concurrent_requests: Option<u32>,
    pub max_upload_bytes: Option<u64>,
    pub write_queue_depth: Option<u32>,
    pub request_deadline_ms: Option<u64>,
    pub rate_per_second: Option<u32>,
    pub rate_burst: Option<u32>,
    pub max_connections_per_ip: Option<u32>,
}

/// What the persisted record holds: last derived values plus overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedCapacity {
    derived: Capacity,
    overrides: CapacityOverrides,
}

/// Result of a hardware probe.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub effective_ram_bytes: u64,
    pub cpus: u32,
}

/// Inspect the host: cgroup v2 `memory.max`, cgroup v1
/// `memory.limit_in_bytes`, then total system memory; CPU count from the
/// runtime.
#[must_use]
pub fn probe() -> Probe {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    #[allow(clippy::cast_possible_truncation)]
    let cpus = cpus as u32;

    let ram = cgroup_memory_limit().unwrap_or_else(system_total_memory);
    Probe {
        effective_ram_bytes: ram,
        cpus,
    }
}

/// Read the container memory limit from cgroups, if one is set.
fn cgroup_memory_limit() -> Option<u64> {
    read_limit_file("/sys/fs/cgroup/memory.max")
        .or_else(|| read_limit_file("/sys/fs/cgroup/memory/memory.limit_in_bytes"))
}

/// Parse a cgroup limit file. "max" and implausibly large sentinel values
/// mean "no limit".
fn read_limit_file(path: &str) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();
    if trimmed == "max" {
        return None;
    }
    let value: u64 = trimmed.parse().ok()?;
    // cgroup v1 reports a page-rounded i64::MAX when unlimited.
    if value >= 1 << 60 {
        return None;
    }
    Some(value)
}

fn system_total_memory() -> u64 {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::nothing()
            .with_memory(sysinfo::MemoryRefreshKind::nothing().with_ram()),
    );
    let total = sys.total_memory();
    if total == 0 { GIB } else { total }
}

/// Derive the tunables from a probe result.
#[must_use]
pub fn derive(probe: Probe) -> Capacity {
    let ram = probe.effective_ram_bytes;
    Capacity {
        effective_ram_bytes: ram,
        cpus: probe.cpus,
        vfs_cache_bytes: ram / 4,
        max_concurrent_requests: probe.cpus.saturating_mul(250),
        max_upload_bytes: (ram / 10).min(100 * MIB),
        write_queue_depth: 1000 * u32::try_from(ram.div_ceil(GIB)).unwrap_or(u32::MAX / 1000),
        max_execution_ms: MAX_EXECUTION_MS,
        max_execution_memory_bytes: MAX_EXECUTION_MEMORY_BYTES,
        request_deadline_ms: 5000,
        rate_per_second: 500,
        rate_burst: 1000,
        max_connections_per_ip: 200,
        big_file_threshold_bytes: BIG_FILE_THRESHOLD_BYTES,
    }
}

/// Apply overrides on top of derived values.
#[must_use]
pub fn apply_overrides(derived: &Capacity, overrides: &CapacityOverrides) -> Capacity {
    let mut cap = derived.clone();
    if let Some(v) = overrides.vfs_cache_bytes {
        cap.vfs_cache_bytes = v;
    }
    if let Some(v) = overrides.max_concurrent_requests {
        cap.max_concurrent_requests = v;
    }
    if let Some(v) = overrides.max_upload_bytes {
        cap.max_upload_bytes = v;
    }
    if let Some(v) = overrides.write_queue_depth {
        cap.write_queue_depth = v;
    }
    if let Some(v) = overrides.request_deadline_ms {
        cap.request_deadline_ms = v;
    }
    if let Some(v) = overrides.rate_per_second {
        cap.rate_per_second = v;
    }
    if let Some(v) = overrides.rate_burst {
        cap.rate_burst = v;
    }
    if let Some(v) = overrides.max_connections_per_ip {
        cap.max_connections_per_ip = v;
    }
    cap
}

/// Shared handle to the currently effective tunables.
///
/// Readers clone the snapshot; recalibration and overrides replace it.
#[derive(Clone)]
pub struct CapacityHandle {
    inner: Arc<RwLock<Capacity>>,
}

impl CapacityHandle {
    #[must_use]
    pub fn new(capacity: Capacity) -> Self {
        Self {
            inner: Arc::new(RwLock::new(capacity)),
        }
    }

    /// Snapshot the current tunables.
    #[must_use]
    pub fn get(&self) -> Capacity {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            // A poisoned lock still holds a valid snapshot.
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, capacity: Capacity) {
        match self.inner.write() {
            Ok(mut guard) => *guard = capacity,
            Err(poisoned) => *poisoned.into_inner() = capacity,
        }
    }
}

impl std::fmt::Debug for CapacityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityHandle").finish_non_exhaustive()
    }
}

/// Loads and persists the tunables record.
pub struct CapacityStore {
    storage: Arc<dyn StorageBackend>,
}

impl CapacityStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Load the persisted record, or probe and derive a fresh one.
    ///
    /// Returns the effective capacity (overrides applied) and the overrides
    /// themselves. Does not persist — boot persists once the queue is up.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::Storage`] or [`CapacityError::Corrupt`].
    pub async fn load_or_probe(&self) -> Result<(Capacity, CapacityOverrides), CapacityError> {
        match self.storage.get(CAPACITY_KEY).await? {
            Some(bytes) => {
                let record: PersistedCapacity =
                    serde_json::from_slice(&bytes).map_err(|e| CapacityError::Corrupt {
                        reason: e.to_string(),
                    })?;
                Ok((
                    apply_overrides(&record.derived, &record.overrides),
                    record.overrides,
                ))
            }
            None => {
                let derived = derive(probe());
                info!(
                    ram_bytes = derived.effective_ram_bytes,
                    cpus = derived.cpus,
                    "no persisted capacity, probed fresh"
                );
                Ok((derived, CapacityOverrides::default()))
            }
        }
    }

    /// Re-probe the host, apply the given overrides, persist, and return
    /// the new effective tunables.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::Queue`] when the persist job is rejected.
    pub async fn recalibrate(
        &self,
        queue: &WriteQueue,
        overrides: CapacityOverrides,
    ) -> Result<Capacity, CapacityError> {
        let derived = derive(probe());
        let effective = apply_overrides(&derived, &overrides);
        self.persist(queue, derived, overrides).await?;
        Ok(effective)
    }

    /// Persist derived values + overrides through the write queue.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::Queue`] or [`CapacityError::Storage`].
    pub async fn persist(
        &self,
        queue: &WriteQueue,
        derived: Capacity,
        overrides: CapacityOverrides,
    ) -> Result<(), CapacityError> {
        let record = PersistedCapacity { derived, overrides };
        let bytes = serde_json::to_vec(&record).map_err(|e| CapacityError::Corrupt {
            reason: e.to_string(),
        })?;
        let storage = Arc::clone(&self.storage);
        queue
            .submit(move || async move { storage.put(CAPACITY_KEY, &bytes).await })
            .await??;
        Ok(())
    }
}

impl std::fmt::Debug for CapacityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityStore").finish_non_exhaustive()
    }
}
