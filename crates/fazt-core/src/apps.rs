//! App records and lifecycle.
//!
//! An app exclusively owns its VFS files, KV cells, documents, and blobs.
//! Deleting an app cascades over every namespace it owns (aliases included);
//! forking creates a new app linked to its source through lineage pointers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use fazt_storage::StorageBackend;

use crate::error::AppError;
use crate::ids;
use crate::queue::WriteQueue;

/// Storage prefix for app records.
const APP_PREFIX: &str = "app/";

/// Who may see an app in listings and reach it without credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
}

/// A stored app record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    /// Stable id, never reused.
    pub id: String,
    /// Human title.
    pub title: String,
    /// Root of the fork lineage (self for originals).
    pub root_ancestor: String,
    /// Immediate fork parent, if any.
    pub parent: Option<String>,
    pub visibility: Visibility,
    /// Where the app came from (`deploy`, `install`, `fork`, `system`).
    pub origin: String,
    /// Serve `index.html` for unmatched extensionless paths.
    pub spa: bool,
    /// Server-side handler entry point, if the app has one.
    pub handler: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-app data namespaces that follow the app through delete and fork.
/// Aliases are handled separately by the resolver (they key on subdomain).
const OWNED_PREFIXES: &[&str] = &[
    "vfsmeta/",
    "vfsdata/",
    "kv/",
    "kvu/",
    "doc/",
    "docu/",
    "docidx/session/",
    "docidxu/session/",
    "blob/",
    "blobu/",
];

/// Manages app creation, lookup, fork, and cascading delete.
pub struct AppStore {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
}

impl AppStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, queue: Arc<WriteQueue>) -> Self {
        Self { storage, queue }
    }

    /// Create a new app.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] or [`AppError::Storage`].
    pub async fn create(&self, title: &str, origin: &str) -> Result<AppRecord, AppError> {
        let now = Utc::now();
        let id = ids::new_id();
        let record = AppRecord {
            id: id.clone(),
            title: title.to_owned(),
            root_ancestor: id.clone(),
            parent: None,
            visibility: Visibility::Unlisted,
            origin: origin.to_owned(),
            spa: false,
            handler: None,
            created_at: now,
            updated_at: now,
        };
        self.put(record.clone()).await?;
        info!(app_id = %record.id, title = %record.title, "app created");
        Ok(record)
    }

    /// Create an app with a caller-chosen id. Used for the reserved system
    /// apps (`sys-admin`, `sys-landing`, `sys-404`) at first boot.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] or [`AppError::Storage`].
    pub async fn create_with_id(
        &self,
        id: &str,
        title: &str,
        origin: &str,
    ) -> Result<AppRecord, AppError> {
        let now = Utc::now();
        let record = AppRecord {
            id: id.to_owned(),
            title: title.to_owned(),
            root_ancestor: id.to_owned(),
            parent: None,
            visibility: Visibility::Private,
            origin: origin.to_owned(),
            spa: false,
            handler: None,
            created_at: now,
            updated_at: now,
        };
        self.put(record.clone()).await?;
        Ok(record)
    }

    /// Fetch an app by id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if the id is unknown.
    pub async fn get(&self, id: &str) -> Result<AppRecord, AppError> {
        let key = format!("{APP_PREFIX}{id}");
        let bytes = self
            .storage
            .get(&key)
            .await?
            .ok_or_else(|| AppError::NotFound { id: id.to_owned() })?;
        serde_json::from_slice(&bytes).map_err(|e| AppError::Corrupt {
            id: id.to_owned(),
            reason: e.to_string(),
        })
    }

    /// List all apps, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] on backend failure.
    pub async fn list(&self) -> Result<Vec<AppRecord>, AppError> {
        let pairs = self.storage.scan(APP_PREFIX).await?;
        let mut apps = Vec::with_capacity(pairs.len());
        for (key, bytes) in pairs {
            let record = serde_json::from_slice(&bytes).map_err(|e| AppError::Corrupt {
                id: key.clone(),
                reason: e.to_string(),
            })?;
            apps.push(record);
        }
        Ok(apps)
    }

    /// Persist a full record (create or replace).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] or [`AppError::Storage`].
    pub async fn put(&self, record: AppRecord) -> Result<(), AppError> {
        let key = format!("{APP_PREFIX}{}", record.id);
        let bytes = serde_json::to_vec(&record).map_err(|e| AppError::Corrupt {
            id: record.id.clone(),
            reason: e.to_string(),
        })?;
        let storage = Arc::clone(&self.storage);
        self.queue
            .submit(move || async move { storage.put(&key, &bytes).await })
            .await??;
        Ok(())
    }

    /// Update deploy-time attributes on an existing app.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if the id is unknown.
    pub async fn set_deploy_attrs(
        &self,
        id: &str,
        spa: bool,
        handler: Option<String>,
    ) -> Result<AppRecord, AppError> {
        let mut record = self.get(id).await?;
        record.spa = spa;
        record.handler = handler;
        record.updated_at = Utc::now();
        self.put(record.clone()).await?;
        Ok(record)
    }

    /// Delete an app and everything it owns, in one queue job.
    ///
    /// The caller (server layer) is responsible for also dropping the app's
    /// aliases from the resolver and invalidating its VFS cache entries.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if the id is unknown.
    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        // Existence check up front so unknown ids 404 instead of no-op.
        let _ = self.get(id).await?;

        let storage = Arc::clone(&self.storage);
        let id = id.to_owned();
        self.queue
            .submit(move || async move {
                let mut batch: Vec<(String, Option<Vec<u8>>)> = Vec::new();
                for prefix in OWNED_PREFIXES {
                    let scoped = format!("{prefix}{id}/");
                    for key in storage.list(&scoped).await? {
                        batch.push((key, None));
                    }
                }
                batch.push((format!("{APP_PREFIX}{id}"), None));
                let removed = batch.len();
                storage.put_batch(batch).await?;
                info!(app_id = %id, keys = removed, "app deleted");
                Ok::<(), fazt_storage::StorageError>(())
            })
            .await??;
        Ok(())
    }

    /// Fork an app: new id, lineage pointers back to the source, metadata
    /// copied, and optionally every owned record duplicated.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if the source is unknown.
    pub async fn fork(
        &self,
        source_id: &str,
        title: Option<String>,
        copy_storage: bool,
    ) -> Result<AppRecord, AppError> {
        let source = self.get(source_id).await?;
        let now = Utc::now();
        let record = AppRecord {
            id: ids::new_id(),
            title: title.unwrap_or_else(|| format!("{} (fork)", source.title)),
            root_ancestor: source.root_ancestor.clone(),
            parent: Some(source.id.clone()),
            visibility: source.visibility,
            origin: "fork".to_owned(),
            spa: source.spa,
            handler: source.handler.clone(),
            created_at: now,
            updated_at: now,
        };

        let key = format!("{APP_PREFIX}{}", record.id);
        let bytes = serde_json::to_vec(&record).map_err(|e| AppError::Corrupt {
            id: record.id.clone(),
            reason: e.to_string(),
        })?;

        let storage = Arc::clone(&self.storage);
        let src = source.id.clone();
        let dst = record.id.clone();
        self.queue
            .submit(move || async move {
                let mut batch: Vec<(String, Option<Vec<u8>>)> = vec![(key, Some(bytes))];
                if copy_storage {
                    for prefix in OWNED_PREFIXES {
                        let scoped = format!("{prefix}{src}/");
                        for (k, v) in storage.scan(&scoped).await? {
                            if let Some(rest) = k.strip_prefix(&scoped) {
                                batch.push((format!("{prefix}{dst}/{rest}"), Some(v)));
                            }
                        }
                    }
                }
                storage.put_batch(batch).await
            })
            .await??;

        info!(app_id = %record.id, parent = %source.id, copy_storage, "app forked");
        Ok(record)
    }
}

impl std::fmt::Debug for AppStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    fn store() -> (AppStore, Arc<dyn StorageBackend>) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        (AppStore::new(Arc::clone(&storage), queue), storage)
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let (apps, _) = store();
        let created = apps.create("blog", "deploy").await.unwrap();
        let fetched = apps.get(&created.id).await.unwrap();
        assert_eq!(fetched.title, "blog");
        assert_eq!(fetched.root_ancestor, created.id);
        assert_eq!(fetched.parent, None);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let (apps, _) = store();
        let err = apps.get("missing").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn fork_links_lineage() {
        let (apps, _) = store();
        let original = apps.create("blog", "deploy").await.unwrap();
        let fork = apps.fork(&original.id, None, false).await.unwrap();
        assert_eq!(fork.parent.as_deref(), Some(original.id.as_str()));
        assert_eq!(fork.root_ancestor, original.id);

        let grandchild = apps.fork(&fork.id, None, false).await.unwrap();
        // Lineage root stays the original, not the intermediate fork.
        assert_eq!(grandchild.root_ancestor, original.id);
        assert_eq!(grandchild.parent.as_deref(), Some(fork.id.as_str()));
    }

    #[tokio::test]
    async fn fork_with_storage_copies_owned_records() {
        let (apps, storage) = store();
        let original = apps.create("blog", "deploy").await.unwrap();
        storage
            .put(&format!("kv/{}/greeting", original.id), b"hello")
            .await
            .unwrap();

        let fork = apps.fork(&original.id, None, true).await.unwrap();
        let copied = storage
            .get(&format!("kv/{}/greeting", fork.id))
            .await
            .unwrap();
        assert_eq!(copied, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn delete_cascades_over_owned_namespaces() {
        let (apps, storage) = store();
        let app = apps.create("blog", "deploy").await.unwrap();
        storage
            .put(&format!("vfsdata/{}/index.html", app.id), b"<p>hi</p>")
            .await
            .unwrap();
        storage
            .put(&format!("doc/{}/notes/1", app.id), b"{}")
            .await
            .unwrap();

        apps.delete(&app.id).await.unwrap();

        assert!(matches!(
            apps.get(&app.id).await.unwrap_err(),
            AppError::NotFound { .. }
        ));
        assert_eq!(
            storage
                .get(&format!("vfsdata/{}/index.html", app.id))
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            storage.get(&format!("doc/{}/notes/1", app.id)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn deploy_attrs_update_record() {
        let (apps, _) = store();
        let app = apps.create("blog", "deploy").await.unwrap();
        let updated = apps
            .set_deploy_attrs(&app.id, true, Some("server.js".to_owned()))
            .await
            .unwrap();
        assert!(updated.spa);
        assert_eq!(updated.handler.as_deref(), Some("server.js"));
    }
}
