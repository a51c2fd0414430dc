//! The key-value capability.
//!
//! App-scoped cells live under `kv/{app_id}/`; user-scoped cells under
//! `kvu/{app_id}/{user_id}/` — separate keyspaces, so the same key set by
//! two users (or by the app and a user) never collides. TTLs are stored as
//! absolute expiry timestamps; an expired cell is invisible to reads and
//! lazily deleted.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use fazt_storage::StorageBackend;

use crate::error::KvError;
use crate::queue::WriteQueue;
use crate::scope::Scope;

/// A stored cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvCell {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// App- and user-scoped key-value storage.
pub struct KvStore {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
}

impl KvStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, queue: Arc<WriteQueue>) -> Self {
        Self { storage, queue }
    }

    /// Set a cell, optionally with a TTL in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Queue`] or [`KvError::Storage`].
    pub async fn set(
        &self,
        scope: &Scope,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
    ) -> Result<(), KvError> {
        let expires_at = ttl_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .map(|ms| Utc::now() + Duration::milliseconds(ms));
        let cell = KvCell {
            value: value.to_owned(),
            expires_at,
        };
        let bytes = serde_json::to_vec(&cell).map_err(|e| KvError::Corrupt {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;
        let storage = Arc::clone(&self.storage);
        let storage_key = format!("{}{key}", scope.kv_prefix());
        self.queue
            .submit(move || async move { storage.put(&storage_key, &bytes).await })
            .await??;
        Ok(())
    }

    /// Read a cell. Expired cells read as `None` and are deleted
    /// best-effort in the background.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Storage`] or [`KvError::Corrupt`].
    pub async fn get(&self, scope: &Scope, key: &str) -> Result<Option<String>, KvError> {
        let storage_key = format!("{}{key}", scope.kv_prefix());
        let Some(bytes) = self.storage.get(&storage_key).await? else {
            return Ok(None);
        };
        let cell: KvCell = serde_json::from_slice(&bytes).map_err(|e| KvError::Corrupt {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        if cell.expires_at.is_some_and(|at| Utc::now() > at) {
            // Lazy expiry: reclaim the cell without delaying this read.
            let queue = Arc::clone(&self.queue);
            let storage = Arc::clone(&self.storage);
            tokio::spawn(async move {
                let _ = queue
                    .submit(move || async move { storage.delete(&storage_key).await })
                    .await;
            });
            return Ok(None);
        }
        Ok(Some(cell.value))
    }

    /// Delete a cell. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Queue`] or [`KvError::Storage`].
    pub async fn delete(&self, scope: &Scope, key: &str) -> Result<(), KvError> {
        let storage = Arc::clone(&self.storage);
        let storage_key = format!("{}{key}", scope.kv_prefix());
        self.queue
            .submit(move || async move { storage.delete(&storage_key).await })
            .await??;
        Ok(())
    }

    /// List keys under a prefix, relative to the scope. Expired cells are
    /// filtered out.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Storage`] or [`KvError::Corrupt`].
    pub async fn list(&self, scope: &Scope, key_prefix: &str) -> Result<Vec<String>, KvError> {
        let scope_prefix = scope.kv_prefix();
        let full_prefix = format!("{scope_prefix}{key_prefix}");
        let pairs = self.storage.scan(&full_prefix).await?;
        let now = Utc::now();
        let mut keys = Vec::with_capacity(pairs.len());
        for (storage_key, bytes) in pairs {
            let cell: KvCell = serde_json::from_slice(&bytes).map_err(|e| KvError::Corrupt {
                key: storage_key.clone(),
                reason: e.to_string(),
            })?;
            if cell.expires_at.is_some_and(|at| now > at) {
                continue;
            }
            if let Some(rest) = storage_key.strip_prefix(&scope_prefix) {
                keys.push(rest.to_owned());
            }
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").finish_non_exhaustive()
    }
}
