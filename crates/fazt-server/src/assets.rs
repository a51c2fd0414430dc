//! Reserved system apps.
//!
//! The `admin`, `landing`, and `404` surfaces ship as embedded assets,
//! written into the VFS at first boot and pinned into the un-evictable
//! cache region at every boot. They must stay servable when user-app
//! traffic thrashes the cache or the maintenance circuit trips.

use std::sync::Arc;

use tracing::info;

use fazt_core::apps::AppStore;
use fazt_core::error::AppError;
use fazt_core::vfs::Vfs;

/// App id of the admin surface.
pub const ADMIN_APP: &str = "sys-admin";
/// App id of the apex landing page.
pub const LANDING_APP: &str = "sys-landing";
/// App id of the 404 page.
pub const NOT_FOUND_APP: &str = "sys-404";

const ADMIN_INDEX: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Fazt Admin</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 3rem auto; max-width: 52rem; color: #1a1a1a; }
    h1 { font-weight: 600; }
    code { background: #f4f4f4; padding: 0.15rem 0.4rem; border-radius: 4px; }
    table { border-collapse: collapse; width: 100%; margin-top: 1rem; }
    td, th { text-align: left; padding: 0.4rem 0.8rem; border-bottom: 1px solid #e4e4e4; }
  </style>
</head>
<body>
  <h1>Fazt Admin</h1>
  <p>This server is managed over the JSON API. Useful endpoints:</p>
  <table>
    <tr><th>Endpoint</th><th>Purpose</th></tr>
    <tr><td><code>GET /api/apps</code></td><td>List apps</td></tr>
    <tr><td><code>GET /api/aliases</code></td><td>Routing table</td></tr>
    <tr><td><code>GET /api/sys/stats</code></td><td>Cache, queue, telemetry counters</td></tr>
    <tr><td><code>GET /api/sys/capacity</code></td><td>Derived tunables</td></tr>
  </table>
  <p>Authenticate with <code>Authorization: Bearer &lt;api key&gt;</code> or a session cookie.</p>
</body>
</html>
"#;

const ADMIN_LOGIN: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Sign in — Fazt</title>
  <style>
    body { font-family: system-ui, sans-serif; display: grid; place-items: center; min-height: 100vh; margin: 0; }
    form { display: grid; gap: 0.75rem; width: 20rem; }
    input, button { padding: 0.6rem; font-size: 1rem; }
  </style>
</head>
<body>
  <form method="post" action="/auth/session">
    <h1>Fazt</h1>
    <input name="key" type="password" placeholder="API key" autofocus>
    <button type="submit">Sign in</button>
  </form>
</body>
</html>
"#;

const LANDING_INDEX: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Fazt</title>
  <style>
    body { font-family: system-ui, sans-serif; display: grid; place-items: center; min-height: 100vh; margin: 0; background: #fafafa; }
    main { text-align: center; }
    h1 { font-size: 2.5rem; margin-bottom: 0.25rem; }
    p { color: #555; }
  </style>
</head>
<body>
  <main>
    <h1>⚡ Fazt</h1>
    <p>A personal platform. Apps live on subdomains.</p>
  </main>
</body>
</html>
"#;

const NOT_FOUND_INDEX: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>404 — Fazt</title>
  <style>
    body { font-family: system-ui, sans-serif; display: grid; place-items: center; min-height: 100vh; margin: 0; }
    main { text-align: center; color: #444; }
  </style>
</head>
<body>
  <main>
    <h1>404</h1>
    <p>Nothing lives at this address.</p>
  </main>
</body>
</html>
"#;

/// Ensure the system apps exist, their assets are stored, and everything
/// is pinned. Idempotent; runs at every boot.
///
/// # Errors
///
/// Returns [`AppError`] when records cannot be created, or the wrapped
/// VFS error string when pinning fails.
pub async fn bootstrap(apps: &Arc<AppStore>, vfs: &Arc<Vfs>) -> Result<(), AppError> {
    let surfaces: &[(&str, &str, &[(&str, &str)])] = &[
        (
            ADMIN_APP,
            "Admin",
            &[("index.html", ADMIN_INDEX), ("login.html", ADMIN_LOGIN)],
        ),
        (LANDING_APP, "Landing", &[("index.html", LANDING_INDEX)]),
        (NOT_FOUND_APP, "Not Found", &[("index.html", NOT_FOUND_INDEX)]),
    ];

    for (id, title, files) in surfaces {
        match apps.get(id).await {
            Ok(_) => {}
            Err(AppError::NotFound { .. }) => {
                apps.create_with_id(id, title, "system").await?;
                for (path, content) in *files {
                    if let Err(e) = vfs.put_file(id, path, content.as_bytes().to_vec()).await {
                        return Err(AppError::Corrupt {
                            id: (*id).to_owned(),
                            reason: format!("system asset write failed: {e}"),
                        });
                    }
                }
                info!(app_id = %id, "system app installed");
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = vfs.pin_app(id).await {
            return Err(AppError::Corrupt {
                id: (*id).to_owned(),
                reason: format!("pinning failed: {e}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_core::queue::WriteQueue;
    use fazt_storage::{MemoryBackend, StorageBackend};

    #[tokio::test]
    async fn bootstrap_installs_and_pins_system_apps() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        let apps = Arc::new(AppStore::new(Arc::clone(&storage), Arc::clone(&queue)));
        let vfs = Arc::new(Vfs::new(Arc::clone(&storage), queue, 1024 * 1024, 512 * 1024));

        bootstrap(&apps, &vfs).await.unwrap();

        assert!(apps.get(ADMIN_APP).await.is_ok());
        assert!(apps.get(LANDING_APP).await.is_ok());
        assert!(apps.get(NOT_FOUND_APP).await.is_ok());

        let stats = vfs.stats();
        assert!(stats.pinned_entries >= 4);

        // Pinned reads never touch storage.
        let misses = vfs.stats().misses;
        let entry = vfs.get(ADMIN_APP, "index.html").await.unwrap().unwrap();
        assert!(entry.bytes.len() > 100);
        assert_eq!(vfs.stats().misses, misses);
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        let apps = Arc::new(AppStore::new(Arc::clone(&storage), Arc::clone(&queue)));
        let vfs = Arc::new(Vfs::new(Arc::clone(&storage), queue, 1024 * 1024, 512 * 1024));

        bootstrap(&apps, &vfs).await.unwrap();
        bootstrap(&apps, &vfs).await.unwrap();
        assert_eq!(apps.list().await.unwrap().len(), 3);
    }
}
