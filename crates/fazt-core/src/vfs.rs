//! Virtual filesystem: `(app_id, path)` → bytes + metadata.
//!
//! Fronts the storage backend with a byte-bounded LRU cache and a separate
//! pinned region. Pinned entries hold the reserved system apps (admin,
//! landing, 404) so the operator surface stays servable even when user-app
//! traffic thrashes the cache; they are loaded at boot, never evicted, and
//! do not count against the byte budget. Files above the big-file threshold
//! bypass the cache entirely and stream from storage on every read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use fazt_storage::StorageBackend;

use crate::error::VfsError;
use crate::queue::WriteQueue;

/// The app root document, protected from eviction while its app is hot.
const ROOT_DOCUMENT: &str = "index.html";

/// How long an app counts as "receiving traffic" after its last root read.
const HOT_WINDOW: Duration = Duration::from_secs(60);

/// Stored file metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub mime: String,
    pub size: u64,
    /// SHA-256 of the content, hex. Doubles as the ETag.
    pub hash: String,
}

/// A resident file: metadata plus shared bytes.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub meta: FileMeta,
    pub bytes: Arc<Vec<u8>>,
}

/// Compute metadata for raw content.
#[must_use]
pub fn meta_for(path: &str, bytes: &[u8]) -> FileMeta {
    FileMeta {
        mime: mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned(),
        size: bytes.len() as u64,
        hash: hex::encode(Sha256::digest(bytes)),
    }
}

type Key = (String, String);

struct CacheInner {
    lru: LruCache<Key, Arc<FileEntry>>,
    resident_bytes: u64,
    /// app_id → last time its root document was read.
    hot_roots: HashMap<String, Instant>,
}

/// Counters exposed via the admin stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct VfsStats {
    pub resident_bytes: u64,
    pub budget_bytes: u64,
    pub entries: usize,
    pub pinned_entries: usize,
    pub pinned_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

/// The virtual filesystem.
pub struct Vfs {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
    pinned: RwLock<HashMap<Key, Arc<FileEntry>>>,
    inner: Mutex<CacheInner>,
    budget_bytes: AtomicU64,
    big_file_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Vfs {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        queue: Arc<WriteQueue>,
        budget_bytes: u64,
        big_file_bytes: u64,
    ) -> Self {
        Self {
            storage,
            queue,
            pinned: RwLock::new(HashMap::new()),
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                resident_bytes: 0,
                hot_roots: HashMap::new(),
            }),
            budget_bytes: AtomicU64::new(budget_bytes),
            big_file_bytes: AtomicU64::new(big_file_bytes),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a file. Pinned region first, then the LRU, then storage.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::Storage`] or [`VfsError::Corrupt`].
    pub async fn get(&self, app_id: &str, path: &str) -> Result<Option<Arc<FileEntry>>, VfsError> {
        let key = (app_id.to_owned(), path.to_owned());

        if let Some(entry) = self.read_pinned(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry));
        }

        {
            let mut inner = self.lock();
            if path == ROOT_DOCUMENT {
                inner.hot_roots.insert(app_id.to_owned(), Instant::now());
            }
            if let Some(entry) = inner.lru.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(Arc::clone(entry)));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let Some(entry) = self.read_storage(app_id, path).await? else {
            return Ok(None);
        };
        let entry = Arc::new(entry);

        if entry.meta.size <= self.big_file_bytes.load(Ordering::Relaxed) {
            let mut inner = self.lock();
            if inner.lru.peek(&key).is_none() {
                inner.resident_bytes += entry.meta.size;
                inner.lru.put(key, Arc::clone(&entry));
                self.evict_locked(&mut inner);
            }
        }

        Ok(Some(entry))
    }

    fn read_pinned(&self, key: &Key) -> Option<Arc<FileEntry>> {
        let pinned = self
            .pinned
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        pinned.get(key).cloned()
    }

    async fn read_storage(&self, app_id: &str, path: &str) -> Result<Option<FileEntry>, VfsError> {
        let meta_key = format!("vfsmeta/{app_id}/{path}");
        let Some(meta_bytes) = self.storage.get(&meta_key).await? else {
            return Ok(None);
        };
        let meta: FileMeta = serde_json::from_slice(&meta_bytes).map_err(|e| VfsError::Corrupt {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        let data_key = format!("vfsdata/{app_id}/{path}");
        let data = self
            .storage
            .get(&data_key)
            .await?
            .ok_or_else(|| VfsError::Corrupt {
                path: path.to_owned(),
                reason: "metadata present but content missing".to_owned(),
            })?;
        Ok(Some(FileEntry {
            meta,
            bytes: Arc::new(data),
        }))
    }

    /// Evict LRU entries until resident bytes fit the budget. Root documents
    /// of apps that served traffic inside the hot window are spared when
    /// they still fit after the rest of the eviction round.
    fn evict_locked(&self, inner: &mut CacheInner) {
        let budget = self.budget_bytes.load(Ordering::Relaxed);
        let now = Instant::now();
        let mut spared: Vec<(Key, Arc<FileEntry>)> = Vec::new();
        let mut spared_bytes: u64 = 0;

        loop {
            // Bytes reserved for spared roots shrink the budget for the rest,
            // so sparing a root evicts the next LRU entry instead.
            if inner.resident_bytes <= budget.saturating_sub(spared_bytes) {
                break;
            }
            let Some((key, entry)) = inner.lru.pop_lru() else {
                break;
            };
            inner.resident_bytes = inner.resident_bytes.saturating_sub(entry.meta.size);

            let is_hot_root = key.1 == ROOT_DOCUMENT
                && entry.meta.size <= budget
                && inner
                    .hot_roots
                    .get(&key.0)
                    .is_some_and(|t| now.duration_since(*t) < HOT_WINDOW);
            if is_hot_root {
                spared_bytes += entry.meta.size;
                spared.push((key, entry));
            }
        }

        for (key, entry) in spared {
            if inner.resident_bytes + entry.meta.size <= budget {
                inner.resident_bytes += entry.meta.size;
                inner.lru.put(key, entry);
            }
        }
    }

    /// Write one file (metadata + content in a single transaction) through
    /// the write queue, then refresh the cache entry.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::Queue`] or [`VfsError::Storage`].
    pub async fn put_file(
        &self,
        app_id: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<FileMeta, VfsError> {
        let meta = meta_for(path, &bytes);
        let meta_bytes = serde_json::to_vec(&meta).map_err(|e| VfsError::Corrupt {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        let storage = Arc::clone(&self.storage);
        let meta_key = format!("vfsmeta/{app_id}/{path}");
        let data_key = format!("vfsdata/{app_id}/{path}");
        self.queue
            .submit(move || async move {
                storage
                    .put_batch(vec![(meta_key, Some(meta_bytes)), (data_key, Some(bytes))])
                    .await
            })
            .await??;
        self.invalidate(app_id, path);
        Ok(meta)
    }

    /// Drop a single cached entry (pinned entries are untouched).
    pub fn invalidate(&self, app_id: &str, path: &str) {
        let key = (app_id.to_owned(), path.to_owned());
        let mut inner = self.lock();
        if let Some(entry) = inner.lru.pop(&key) {
            inner.resident_bytes = inner.resident_bytes.saturating_sub(entry.meta.size);
        }
    }

    /// Drop every cached entry belonging to an app. Called after deploys
    /// and app deletion.
    pub fn invalidate_app(&self, app_id: &str) {
        let mut inner = self.lock();
        let doomed: Vec<Key> = inner
            .lru
            .iter()
            .filter(|((id, _), _)| id == app_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(entry) = inner.lru.pop(&key) {
                inner.resident_bytes = inner.resident_bytes.saturating_sub(entry.meta.size);
            }
        }
        inner.hot_roots.remove(app_id);
        debug!(app_id, "vfs cache invalidated for app");
    }

    /// Load every file of an app into the pinned region. Pinned entries are
    /// replaced wholesale for the app, never evicted, and excluded from the
    /// byte budget.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::Storage`] or [`VfsError::Corrupt`].
    pub async fn pin_app(&self, app_id: &str) -> Result<usize, VfsError> {
        let prefix = format!("vfsmeta/{app_id}/");
        let keys = self.storage.list(&prefix).await?;
        let mut loaded = Vec::with_capacity(keys.len());
        for meta_key in keys {
            let Some(path) = meta_key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(entry) = self.read_storage(app_id, path).await? {
                loaded.push(((app_id.to_owned(), path.to_owned()), Arc::new(entry)));
            }
        }
        let count = loaded.len();
        let mut pinned = self
            .pinned
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        pinned.retain(|(id, _), _| id != app_id);
        pinned.extend(loaded);
        info!(app_id, files = count, "app pinned");
        Ok(count)
    }

    /// Replace the LRU byte budget (recalibration) and evict down to it.
    pub fn set_budget(&self, budget_bytes: u64) {
        self.budget_bytes.store(budget_bytes, Ordering::Relaxed);
        let mut inner = self.lock();
        self.evict_locked(&mut inner);
    }

    /// Cache counters for the stats endpoint.
    #[must_use]
    pub fn stats(&self) -> VfsStats {
        let inner = self.lock();
        let pinned = self
            .pinned
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        VfsStats {
            resident_bytes: inner.resident_bytes,
            budget_bytes: self.budget_bytes.load(Ordering::Relaxed),
            entries: inner.lru.len(),
            pinned_entries: pinned.len(),
            pinned_bytes: pinned.values().map(|e| e.meta.size).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    async fn vfs_with(budget: u64, big_file: u64) -> Vfs {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        Vfs::new(storage, queue, budget, big_file)
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let vfs = vfs_with(1024, 512).await;
        vfs.put_file("app1", "index.html", b"HELLO".to_vec())
            .await
            .unwrap();

        let entry = vfs.get("app1", "index.html").await.unwrap().unwrap();
        assert_eq!(entry.bytes.as_slice(), b"HELLO");
        assert_eq!(entry.meta.mime, "text/html");
        assert_eq!(entry.meta.size, 5);
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let vfs = vfs_with(1024, 512).await;
        assert!(vfs.get("app1", "nope.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let vfs = vfs_with(1024, 512).await;
        vfs.put_file("app1", "index.html", b"HELLO".to_vec())
            .await
            .unwrap();

        vfs.get("app1", "index.html").await.unwrap().unwrap();
        let misses_after_first = vfs.stats().misses;
        vfs.get("app1", "index.html").await.unwrap().unwrap();
        assert_eq!(vfs.stats().misses, misses_after_first);
        assert!(vfs.stats().hits >= 1);
    }

    #[tokio::test]
    async fn resident_bytes_never_exceed_budget() {
        let vfs = vfs_with(100, 512).await;
        for i in 0..10 {
            vfs.put_file("app1", &format!("f{i}.txt"), vec![b'x'; 30])
                .await
                .unwrap();
            vfs.get("app1", &format!("f{i}.txt")).await.unwrap();
            assert!(vfs.stats().resident_bytes <= 100);
        }
    }

    #[tokio::test]
    async fn big_files_bypass_the_cache() {
        let vfs = vfs_with(10_000, 100).await;
        vfs.put_file("app1", "big.bin", vec![0u8; 500])
            .await
            .unwrap();

        vfs.get("app1", "big.bin").await.unwrap().unwrap();
        vfs.get("app1", "big.bin").await.unwrap().unwrap();
        // Both reads hit storage; nothing resident.
        assert_eq!(vfs.stats().entries, 0);
        assert_eq!(vfs.stats().misses, 2);
    }

    #[tokio::test]
    async fn pinned_entries_survive_eviction_pressure() {
        let vfs = vfs_with(60, 512).await;
        vfs.put_file("sys-admin", "index.html", b"<h1>admin</h1>".to_vec())
            .await
            .unwrap();
        vfs.pin_app("sys-admin").await.unwrap();

        // Thrash the LRU well past its budget.
        for i in 0..20 {
            vfs.put_file("user", &format!("f{i}.txt"), vec![b'x'; 50])
                .await
                .unwrap();
            vfs.get("user", &format!("f{i}.txt")).await.unwrap();
        }

        let misses_before = vfs.stats().misses;
        let entry = vfs.get("sys-admin", "index.html").await.unwrap().unwrap();
        assert_eq!(entry.bytes.as_slice(), b"<h1>admin</h1>");
        // Served from the pinned region — no storage read.
        assert_eq!(vfs.stats().misses, misses_before);
    }

    #[tokio::test]
    async fn pinned_bytes_do_not_count_against_budget() {
        let vfs = vfs_with(100, 512).await;
        vfs.put_file("sys-admin", "index.html", vec![b'a'; 90])
            .await
            .unwrap();
        vfs.pin_app("sys-admin").await.unwrap();

        vfs.put_file("user", "a.txt", vec![b'x'; 80]).await.unwrap();
        vfs.get("user", "a.txt").await.unwrap();
        // The user file fits the budget on its own.
        assert_eq!(vfs.stats().resident_bytes, 80);
        assert_eq!(vfs.stats().pinned_bytes, 90);
    }

    #[tokio::test]
    async fn hot_root_document_survives_thrash_when_it_fits() {
        let vfs = vfs_with(100, 512).await;
        vfs.put_file("app1", "index.html", vec![b'r'; 40])
            .await
            .unwrap();
        // Read it so the app counts as hot.
        vfs.get("app1", "index.html").await.unwrap();

        for i in 0..10 {
            vfs.put_file("app2", &format!("f{i}.txt"), vec![b'x'; 35])
                .await
                .unwrap();
            vfs.get("app2", &format!("f{i}.txt")).await.unwrap();
        }

        let misses_before = vfs.stats().misses;
        vfs.get("app1", "index.html").await.unwrap().unwrap();
        assert_eq!(vfs.stats().misses, misses_before, "hot root was evicted");
    }

    #[tokio::test]
    async fn invalidate_app_drops_cached_entries() {
        let vfs = vfs_with(1024, 512).await;
        vfs.put_file("app1", "index.html", b"v1".to_vec())
            .await
            .unwrap();
        vfs.get("app1", "index.html").await.unwrap();

        vfs.invalidate_app("app1");
        assert_eq!(vfs.stats().entries, 0);
        assert_eq!(vfs.stats().resident_bytes, 0);
    }

    #[tokio::test]
    async fn shrinking_budget_evicts_down() {
        let vfs = vfs_with(200, 512).await;
        for i in 0..4 {
            vfs.put_file("app1", &format!("f{i}.txt"), vec![b'x'; 40])
                .await
                .unwrap();
            vfs.get("app1", &format!("f{i}.txt")).await.unwrap();
        }
        assert!(vfs.stats().resident_bytes <= 200);

        vfs.set_budget(50);
        assert!(vfs.stats().resident_bytes <= 50);
    }
}
