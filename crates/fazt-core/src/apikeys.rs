//! API keys.
//!
//! Keys authenticate the CLI and remote peers against the admin API. Only
//! the SHA-256 hash is stored; the plaintext (`fazt_` + 32 hex) is shown
//! once at creation. Scopes are free-form capability strings checked by the
//! server layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use fazt_storage::StorageBackend;

use crate::error::ApiKeyError;
use crate::ids;
use crate::queue::WriteQueue;

const KEY_PREFIX: &str = "apikey/";
const HASH_PREFIX: &str = "apikeyhash/";

/// A stored API key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    /// SHA-256 of the plaintext key (hex).
    pub key_hash: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Does the key carry a scope (or the `admin` catch-all)?
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "admin")
    }
}

/// Manages API key creation, lookup, and revocation.
pub struct ApiKeyStore {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
}

impl ApiKeyStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, queue: Arc<WriteQueue>) -> Self {
        Self { storage, queue }
    }

    /// Create a key. Returns the record and the plaintext key (shown once,
    /// never stored).
    ///
    /// # Errors
    ///
    /// Returns [`ApiKeyError::Queue`] or [`ApiKeyError::Storage`].
    pub async fn create(
        &self,
        name: &str,
        scopes: Vec<String>,
    ) -> Result<(ApiKeyRecord, String), ApiKeyError> {
        let plaintext = format!("fazt_{}", ids::new_id());
        let key_hash = ids::hash_credential(&plaintext);

        let record = ApiKeyRecord {
            id: ids::new_id(),
            name: name.to_owned(),
            key_hash: key_hash.clone(),
            scopes,
            created_at: Utc::now(),
            last_used: None,
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| ApiKeyError::Corrupt {
            reason: e.to_string(),
        })?;

        let storage = Arc::clone(&self.storage);
        let key = format!("{KEY_PREFIX}{}", record.id);
        let hash_key = format!("{HASH_PREFIX}{key_hash}");
        let id_bytes = record.id.clone().into_bytes();
        self.queue
            .submit(move || async move {
                storage
                    .put_batch(vec![(key, Some(bytes)), (hash_key, Some(id_bytes))])
                    .await
            })
            .await??;

        info!(key_id = %record.id, name = %record.name, "api key created");
        Ok((record, plaintext))
    }

    /// Look up a key by its plaintext value, refreshing `last_used`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiKeyError::NotFound`] for unknown or revoked keys.
    pub async fn lookup(&self, plaintext: &str) -> Result<ApiKeyRecord, ApiKeyError> {
        let key_hash = ids::hash_credential(plaintext);
        let hash_key = format!("{HASH_PREFIX}{key_hash}");
        let id_bytes = self
            .storage
            .get(&hash_key)
            .await?
            .ok_or(ApiKeyError::NotFound)?;
        let id = String::from_utf8(id_bytes).map_err(|e| ApiKeyError::Corrupt {
            reason: e.to_string(),
        })?;

        let mut record = self.get(&id).await?;
        record.last_used = Some(Utc::now());
        if let Ok(updated) = serde_json::to_vec(&record) {
            let queue = Arc::clone(&self.queue);
            let storage = Arc::clone(&self.storage);
            let record_key = format!("{KEY_PREFIX}{id}");
            tokio::spawn(async move {
                let _ = queue
                    .submit(move || async move { storage.put(&record_key, &updated).await })
                    .await;
            });
        }
        Ok(record)
    }

    /// Fetch a key record by id.
    ///
    /// # Errors
    ///
    /// Returns [`ApiKeyError::NotFound`] for unknown ids.
    pub async fn get(&self, id: &str) -> Result<ApiKeyRecord, ApiKeyError> {
        let key = format!("{KEY_PREFIX}{id}");
        let bytes = self.storage.get(&key).await?.ok_or(ApiKeyError::NotFound)?;
        serde_json::from_slice(&bytes).map_err(|e| ApiKeyError::Corrupt {
            reason: e.to_string(),
        })
    }

    /// List all keys (hashes included, plaintexts long gone).
    ///
    /// # Errors
    ///
    /// Returns [`ApiKeyError::Storage`] or [`ApiKeyError::Corrupt`].
    pub async fn list(&self) -> Result<Vec<ApiKeyRecord>, ApiKeyError> {
        let pairs = self.storage.scan(KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(pairs.len());
        for (_, bytes) in pairs {
            let record = serde_json::from_slice(&bytes).map_err(|e| ApiKeyError::Corrupt {
                reason: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Revoke a key by id.
    ///
    /// # Errors
    ///
    /// Returns [`ApiKeyError::NotFound`] for unknown ids.
    pub async fn revoke(&self, id: &str) -> Result<(), ApiKeyError> {
        let record = self.get(id).await?;
        let storage = Arc::clone(&self.storage);
        let key = format!("{KEY_PREFIX}{id}");
        let hash_key = format!("{HASH_PREFIX}{}", record.key_hash);
        self.queue
            .submit(move || async move {
                storage
                    .put_batch(vec![(key, None), (hash_key, None)])
                    .await
            })
            .await??;
        info!(key_id = %id, "api key revoked");
        Ok(())
    }
}

impl std::fmt::Debug for ApiKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    fn store() -> ApiKeyStore {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        ApiKeyStore::new(storage, queue)
    }

    #[tokio::test]
    async fn create_then_lookup_by_plaintext() {
        let keys = store();
        let (record, plaintext) = keys
            .create("ci", vec!["deploy".to_owned()])
            .await
            .unwrap();
        assert!(plaintext.starts_with("fazt_"));

        let found = keys.lookup(&plaintext).await.unwrap();
        assert_eq!(found.id, record.id);
        assert!(found.has_scope("deploy"));
        assert!(!found.has_scope("users"));
    }

    #[tokio::test]
    async fn admin_scope_grants_everything() {
        let keys = store();
        let (_, plaintext) = keys.create("root", vec!["admin".to_owned()]).await.unwrap();
        let found = keys.lookup(&plaintext).await.unwrap();
        assert!(found.has_scope("deploy"));
        assert!(found.has_scope("users"));
    }

    #[tokio::test]
    async fn bad_plaintext_is_not_found() {
        let keys = store();
        assert!(matches!(
            keys.lookup("fazt_bogus").await.unwrap_err(),
            ApiKeyError::NotFound
        ));
    }

    #[tokio::test]
    async fn revoked_key_no_longer_authenticates() {
        let keys = store();
        let (record, plaintext) = keys.create("ci", vec![]).await.unwrap();
        keys.revoke(&record.id).await.unwrap();
        assert!(matches!(
            keys.lookup(&plaintext).await.unwrap_err(),
            ApiKeyError::NotFound
        ));
    }

    #[tokio::test]
    async fn list_shows_created_keys() {
        let keys = store();
        keys.create("a", vec![]).await.unwrap();
        keys.create("b", vec![]).await.unwrap();
        assert_eq!(keys.list().await.unwrap().len(), 2);
    }
}
