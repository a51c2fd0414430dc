//! The blob capability.
//!
//! Blobs are opaque byte objects with a caller-supplied mime type, stored
//! under their own namespace (separate from the VFS — deploys never touch
//! blobs, and blobs are never served as static assets). App-scoped and
//! user-scoped variants mirror the KV layout.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use fazt_storage::StorageBackend;

use crate::error::BlobError;
use crate::queue::WriteQueue;
use crate::scope::Scope;

/// Stored blob metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub mime: String,
    pub size: u64,
    /// SHA-256 of the content, hex.
    pub hash: String,
}

/// A fetched blob.
#[derive(Debug, Clone)]
pub struct Blob {
    pub meta: BlobMeta,
    pub bytes: Vec<u8>,
}

/// App- and user-scoped blob storage.
pub struct BlobStore {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
}

impl BlobStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, queue: Arc<WriteQueue>) -> Self {
        Self { storage, queue }
    }

    /// Store a blob. Metadata and content commit together.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::TooLarge`] when the content exceeds
    /// `max_bytes` (the capacity-derived upload ceiling).
    pub async fn put(
        &self,
        scope: &Scope,
        path: &str,
        bytes: Vec<u8>,
        mime: &str,
        max_bytes: u64,
    ) -> Result<BlobMeta, BlobError> {
        let size = bytes.len() as u64;
        if size > max_bytes {
            return Err(BlobError::TooLarge {
                size,
                max: max_bytes,
            });
        }

        let meta = BlobMeta {
            mime: mime.to_owned(),
            size,
            hash: hex::encode(Sha256::digest(&bytes)),
        };
        let meta_bytes = serde_json::to_vec(&meta).map_err(|e| BlobError::Corrupt {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;

        let storage = Arc::clone(&self.storage);
        let meta_key = format!("{}{path}", scope.blob_meta_prefix());
        let data_key = format!("{}{path}", scope.blob_data_prefix());
        self.queue
            .submit(move || async move {
                storage
                    .put_batch(vec![(meta_key, Some(meta_bytes)), (data_key, Some(bytes))])
                    .await
            })
            .await??;
        Ok(meta)
    }

    /// Fetch a blob with its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Storage`] or [`BlobError::Corrupt`].
    pub async fn get(&self, scope: &Scope, path: &str) -> Result<Option<Blob>, BlobError> {
        let meta_key = format!("{}{path}", scope.blob_meta_prefix());
        let Some(meta_bytes) = self.storage.get(&meta_key).await? else {
            return Ok(None);
        };
        let meta: BlobMeta = serde_json::from_slice(&meta_bytes).map_err(|e| BlobError::Corrupt {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        let data_key = format!("{}{path}", scope.blob_data_prefix());
        let bytes = self
            .storage
            .get(&data_key)
            .await?
            .ok_or_else(|| BlobError::Corrupt {
                path: path.to_owned(),
                reason: "metadata present but content missing".to_owned(),
            })?;
        Ok(Some(Blob { meta, bytes }))
    }

    /// Delete a blob. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Queue`] or [`BlobError::Storage`].
    pub async fn delete(&self, scope: &Scope, path: &str) -> Result<(), BlobError> {
        let storage = Arc::clone(&self.storage);
        let meta_key = format!("{}{path}", scope.blob_meta_prefix());
        let data_key = format!("{}{path}", scope.blob_data_prefix());
        self.queue
            .submit(move || async move {
                storage
                    .put_batch(vec![(meta_key, None), (data_key, None)])
                    .await
            })
            .await??;
        Ok(())
    }

    /// List blob paths under a prefix, relative to the scope.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Storage`] on backend failure.
    pub async fn list(&self, scope: &Scope, path_prefix: &str) -> Result<Vec<String>, BlobError> {
        let meta_prefix = scope.blob_meta_prefix();
        let full_prefix = format!("{meta_prefix}{path_prefix}");
        let keys = self.storage.list(&full_prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&meta_prefix).map(String::from))
            .collect())
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    fn store() -> BlobStore {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        BlobStore::new(storage, queue)
    }

    fn app() -> Scope {
        Scope::app("app1")
    }

    #[tokio::test]
    async fn put_get_roundtrip_preserves_bytes_and_mime() {
        let blobs = store();
        blobs
            .put(&app(), "avatars/cat.png", vec![1, 2, 3], "image/png", 1024)
            .await
            .unwrap();

        let blob = blobs.get(&app(), "avatars/cat.png").await.unwrap().unwrap();
        assert_eq!(blob.bytes, vec![1, 2, 3]);
        assert_eq!(blob.meta.mime, "image/png");
        assert_eq!(blob.meta.size, 3);
    }

    #[tokio::test]
    async fn oversized_put_is_rejected() {
        let blobs = store();
        let err = blobs
            .put(&app(), "big.bin", vec![0u8; 11], "application/octet-stream", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::TooLarge { size: 11, max: 10 }));
    }

    #[tokio::test]
    async fn exactly_at_ceiling_succeeds() {
        let blobs = store();
        blobs
            .put(&app(), "fits.bin", vec![0u8; 10], "application/octet-stream", 10)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_then_get_is_none() {
        let blobs = store();
        blobs
            .put(&app(), "x", vec![1], "application/octet-stream", 10)
            .await
            .unwrap();
        blobs.delete(&app(), "x").await.unwrap();
        assert!(blobs.get(&app(), "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let blobs = store();
        blobs
            .put(&app(), "avatars/a.png", vec![1], "image/png", 10)
            .await
            .unwrap();
        blobs
            .put(&app(), "avatars/b.png", vec![2], "image/png", 10)
            .await
            .unwrap();
        blobs
            .put(&app(), "docs/readme.txt", vec![3], "text/plain", 10)
            .await
            .unwrap();

        let listed = blobs.list(&app(), "avatars/").await.unwrap();
        assert_eq!(listed, vec!["avatars/a.png", "avatars/b.png"]);
    }

    #[tokio::test]
    async fn user_scopes_are_isolated() {
        let blobs = store();
        let alice = Scope::user("app1", "alice");
        let bob = Scope::user("app1", "bob");

        blobs
            .put(&alice, "notes.txt", b"mine".to_vec(), "text/plain", 100)
            .await
            .unwrap();

        assert!(blobs.get(&bob, "notes.txt").await.unwrap().is_none());
        assert!(blobs.get(&app(), "notes.txt").await.unwrap().is_none());
        assert!(blobs.get(&alice, "notes.txt").await.unwrap().is_some());
    }
}
