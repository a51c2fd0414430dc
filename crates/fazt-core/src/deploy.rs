//! Deploys: replace an app's file tree.
//!
//! A deploy payload is a manifest plus a flat list of base64-encoded files.
//! The whole tree is validated and decoded up front, then swapped in as a
//! single write-queue job — files absent from the new tree are removed in
//! the same transaction, so readers see either the old deploy or the new
//! one. Cache entries for the app are invalidated after commit.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::info;

use fazt_storage::StorageBackend;

use crate::apps::AppStore;
use crate::error::DeployError;
use crate::queue::WriteQueue;
use crate::vfs::{Vfs, meta_for};

/// Files under this subtree are readable only through script capabilities
/// or authenticated `/private/*` requests, never as public static assets.
pub const PRIVATE_SUBTREE: &str = "private/";

/// Default handler entry point when the manifest names none.
const DEFAULT_HANDLER: &str = "server.js";

/// The mandatory top-level manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// App name (display title).
    pub name: String,
    /// Serve the root document for unmatched extensionless paths.
    #[serde(default)]
    pub spa: bool,
    /// Handler entry point. Defaults to `server.js` when that file exists.
    #[serde(default)]
    pub handler: Option<String>,
}

/// One file in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployFile {
    pub path: String,
    /// Base64-encoded content.
    pub content: String,
}

/// The full deploy payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployPayload {
    pub manifest: Manifest,
    pub files: Vec<DeployFile>,
}

/// What a deploy did.
#[derive(Debug, Clone, Serialize)]
pub struct DeploySummary {
    pub app_id: String,
    pub files: usize,
    pub bytes: u64,
    pub removed: usize,
}

/// Validate a deploy path: relative, safe characters, no traversal.
fn validate_path(path: &str) -> Result<(), DeployError> {
    let bad = path.is_empty()
        || path.len() > 512
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains('\0')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        || !path
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/'));
    if bad {
        Err(DeployError::InvalidPath {
            path: path.to_owned(),
        })
    } else {
        Ok(())
    }
}

/// Applies deploy payloads to apps.
pub struct Deployer {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
    apps: Arc<AppStore>,
    vfs: Arc<Vfs>,
}

impl Deployer {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        queue: Arc<WriteQueue>,
        apps: Arc<AppStore>,
        vfs: Arc<Vfs>,
    ) -> Self {
        Self {
            storage,
            queue,
            apps,
            vfs,
        }
    }

    /// Replace the app's tree with the payload.
    ///
    /// # Errors
    ///
    /// - [`DeployError::InvalidManifest`] for an empty name.
    /// - [`DeployError::InvalidPath`] / [`DeployError::Decode`] /
    ///   [`DeployError::TooLarge`] per file.
    /// - [`DeployError::App`] when the app does not exist.
    pub async fn deploy(
        &self,
        app_id: &str,
        payload: DeployPayload,
        max_upload_bytes: u64,
    ) -> Result<DeploySummary, DeployError> {
        if payload.manifest.name.trim().is_empty() {
            return Err(DeployError::InvalidManifest {
                reason: "manifest.name must not be empty".to_owned(),
            });
        }
        let app = self.apps.get(app_id).await?;

        // Decode and validate the whole tree before touching storage.
        let mut decoded: Vec<(String, Vec<u8>)> = Vec::with_capacity(payload.files.len());
        let mut total_bytes = 0u64;
        for file in &payload.files {
            validate_path(&file.path)?;
            let bytes = BASE64
                .decode(file.content.as_bytes())
                .map_err(|_| DeployError::Decode {
                    path: file.path.clone(),
                })?;
            let size = bytes.len() as u64;
            if size > max_upload_bytes {
                return Err(DeployError::TooLarge {
                    path: file.path.clone(),
                    size,
                    max: max_upload_bytes,
                });
            }
            total_bytes += size;
            decoded.push((file.path.clone(), bytes));
        }

        let handler = payload
            .manifest
            .handler
            .clone()
            .or_else(|| {
                decoded
                    .iter()
                    .any(|(p, _)| p == DEFAULT_HANDLER)
                    .then(|| DEFAULT_HANDLER.to_owned())
            });

        // One transaction: write the new tree, drop paths not in it.
        let storage = Arc::clone(&self.storage);
        let app_key = app.id.clone();
        let files = decoded.len();
        let removed = self
            .queue
            .submit(move || async move {
                let meta_prefix = format!("vfsmeta/{app_key}/");
                let existing = storage.list(&meta_prefix).await?;

                let mut batch: Vec<(String, Option<Vec<u8>>)> = Vec::new();
                let mut kept: std::collections::HashSet<String> = std::collections::HashSet::new();
                for (path, bytes) in decoded {
                    let meta = meta_for(&path, &bytes);
                    let meta_bytes = serde_json::to_vec(&meta).unwrap_or_default();
                    batch.push((format!("vfsmeta/{app_key}/{path}"), Some(meta_bytes)));
                    batch.push((format!("vfsdata/{app_key}/{path}"), Some(bytes)));
                    kept.insert(path);
                }

                let mut removed = 0usize;
                for meta_key in existing {
                    if let Some(path) = meta_key.strip_prefix(&meta_prefix) {
                        if !kept.contains(path) {
                            batch.push((meta_key.clone(), None));
                            batch.push((format!("vfsdata/{app_key}/{path}"), None));
                            removed += 1;
                        }
                    }
                }

                storage.put_batch(batch).await?;
                Ok::<usize, fazt_storage::StorageError>(removed)
            })
            .await??;

        self.apps
            .set_deploy_attrs(&app.id, payload.manifest.spa, handler)
            .await?;
        self.vfs.invalidate_app(&app.id);

        info!(app_id = %app.id, files, bytes = total_bytes, removed, "deploy committed");
        Ok(DeploySummary {
            app_id: app.id,
            files,
            bytes: total_bytes,
            removed,
        })
    }
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    struct Fixture {
        deployer: Deployer,
        apps: Arc<AppStore>,
        vfs: Arc<Vfs>,
    }

    fn fixture() -> Fixture {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(256);
        let apps = Arc::new(AppStore::new(Arc::clone(&storage), Arc::clone(&queue)));
        let vfs = Arc::new(Vfs::new(
            Arc::clone(&storage),
            Arc::clone(&queue),
            1024 * 1024,
            512 * 1024,
        ));
        Fixture {
            deployer: Deployer::new(storage, queue, Arc::clone(&apps), Arc::clone(&vfs)),
            apps,
            vfs,
        }
    }

    fn payload(files: &[(&str, &[u8])]) -> DeployPayload {
        DeployPayload {
            manifest: Manifest {
                name: "blog".to_owned(),
                spa: false,
                handler: None,
            },
            files: files
                .iter()
                .map(|(path, bytes)| DeployFile {
                    path: (*path).to_owned(),
                    content: BASE64.encode(bytes),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn deployed_tree_reads_back_exactly() {
        let fx = fixture();
        let app = fx.apps.create("blog", "deploy").await.unwrap();

        let tree: &[(&str, &[u8])] = &[
            ("index.html", b"HELLO"),
            ("css/site.css", b"body{}"),
            ("private/secrets.json", b"{\"k\":1}"),
        ];
        let summary = fx
            .deployer
            .deploy(&app.id, payload(tree), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(summary.files, 3);

        for (path, bytes) in tree {
            let entry = fx.vfs.get(&app.id, path).await.unwrap().unwrap();
            assert_eq!(entry.bytes.as_slice(), *bytes);
        }
    }

    #[tokio::test]
    async fn redeploy_removes_stale_files() {
        let fx = fixture();
        let app = fx.apps.create("blog", "deploy").await.unwrap();

        fx.deployer
            .deploy(
                &app.id,
                payload(&[("index.html", b"v1"), ("old.txt", b"gone soon")]),
                1024,
            )
            .await
            .unwrap();

        let summary = fx
            .deployer
            .deploy(&app.id, payload(&[("index.html", b"v2")]), 1024)
            .await
            .unwrap();
        assert_eq!(summary.removed, 1);

        let index = fx.vfs.get(&app.id, "index.html").await.unwrap().unwrap();
        assert_eq!(index.bytes.as_slice(), b"v2");
        assert!(fx.vfs.get(&app.id, "old.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let fx = fixture();
        let app = fx.apps.create("blog", "deploy").await.unwrap();

        for path in ["../escape.html", "/absolute.html", "a//b.html", "dir/"] {
            let err = fx
                .deployer
                .deploy(&app.id, payload(&[(path, b"x")]), 1024)
                .await
                .unwrap_err();
            assert!(matches!(err, DeployError::InvalidPath { .. }), "{path}");
        }
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let fx = fixture();
        let app = fx.apps.create("blog", "deploy").await.unwrap();

        let err = fx
            .deployer
            .deploy(&app.id, payload(&[("big.bin", &[0u8; 100])]), 99)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn server_js_becomes_default_handler() {
        let fx = fixture();
        let app = fx.apps.create("api", "deploy").await.unwrap();

        fx.deployer
            .deploy(
                &app.id,
                payload(&[("index.html", b"x"), ("server.js", b"respond(200, 'ok')")]),
                1024,
            )
            .await
            .unwrap();

        let updated = fx.apps.get(&app.id).await.unwrap();
        assert_eq!(updated.handler.as_deref(), Some("server.js"));
    }

    #[tokio::test]
    async fn explicit_handler_wins_and_spa_flag_sticks() {
        let fx = fixture();
        let app = fx.apps.create("spa", "deploy").await.unwrap();

        let mut p = payload(&[("index.html", b"x"), ("app.js", b"y")]);
        p.manifest.spa = true;
        p.manifest.handler = Some("app.js".to_owned());
        fx.deployer.deploy(&app.id, p, 1024).await.unwrap();

        let updated = fx.apps.get(&app.id).await.unwrap();
        assert!(updated.spa);
        assert_eq!(updated.handler.as_deref(), Some("app.js"));
    }

    #[tokio::test]
    async fn unknown_app_fails() {
        let fx = fixture();
        let err = fx
            .deployer
            .deploy("missing", payload(&[("index.html", b"x")]), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::App(_)));
    }
}
