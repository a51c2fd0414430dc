//! VM lifecycle: one QuickJS runtime per invocation.
//!
//! The VM runs on the blocking thread pool. Wall-clock enforcement uses the
//! engine's interrupt handler (checked at bytecode safepoints, so a tight
//! loop cannot outrun it); memory enforcement uses the engine's allocator
//! limit. Either trips the invocation into [`RuntimeError::Budget`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::RuntimeError;
use crate::host::HostEnv;
use crate::request::{ScriptRequest, ScriptResponse};

/// The JS shim defining `request`, `respond`, and the `fazt` namespace.
const PRELUDE: &str = include_str!("prelude.js");

/// Execute a handler script against one request.
///
/// # Errors
///
/// - [`RuntimeError::Budget`] on timeout or memory exhaustion.
/// - [`RuntimeError::Script`] when the script throws (aborts from
///   `require*` calls are not errors — they carry an early response).
pub async fn invoke(
    env: HostEnv,
    script: String,
    request: &ScriptRequest,
) -> Result<ScriptResponse, RuntimeError> {
    let request_json = serde_json::to_string(request).map_err(|e| RuntimeError::Internal {
        reason: format!("request serialization failed: {e}"),
    })?;
    let budget = Duration::from_millis(env.capacity.max_execution_ms);
    let max_memory = usize::try_from(env.capacity.max_execution_memory_bytes).unwrap_or(usize::MAX);

    let env = Arc::new(env);
    let vm_env = Arc::clone(&env);
    tokio::task::spawn_blocking(move || run_vm(&vm_env, &script, &request_json, max_memory, budget))
        .await
        .map_err(|e| RuntimeError::Internal {
            reason: format!("vm task failed: {e}"),
        })?
}

fn run_vm(
    env: &Arc<HostEnv>,
    script: &str,
    request_json: &str,
    max_memory: usize,
    budget: Duration,
) -> Result<ScriptResponse, RuntimeError> {
    let runtime = rquickjs::Runtime::new().map_err(|e| RuntimeError::Internal {
        reason: format!("vm construction failed: {e}"),
    })?;
    runtime.set_memory_limit(max_memory);

    let deadline = Instant::now() + budget;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() > deadline)));

    let context = rquickjs::Context::full(&runtime).map_err(|e| RuntimeError::Internal {
        reason: format!("vm context failed: {e}"),
    })?;

    let eval_result: Result<(), String> = context.with(|ctx| {
        let syscall_env = Arc::clone(env);
        let syscall = rquickjs::function::Func::from(move |name: String, args: String| -> String {
            syscall_env.syscall_json(&name, &args)
        });

        let globals = ctx.globals();
        globals
            .set("__syscall", syscall)
            .map_err(|e| e.to_string())?;
        globals
            .set("__request_json", request_json)
            .map_err(|e| e.to_string())?;

        eval_unit(&ctx, PRELUDE)?;
        eval_unit(&ctx, script)
    });

    match eval_result {
        Ok(()) => Ok(env.take_response().unwrap_or_else(ScriptResponse::empty)),
        Err(message) => {
            // An abort marker (require* calls) finalizes the response
            // before throwing; that is an early exit, not a failure.
            if let Some(response) = env.take_response() {
                debug!(app_id = %env.app.id, "script aborted with early response");
                return Ok(response);
            }
            if Instant::now() > deadline || message.contains("out of memory") {
                return Err(RuntimeError::Budget);
            }
            Err(RuntimeError::Script { message })
        }
    }
}

fn eval_unit(ctx: &rquickjs::Ctx<'_>, code: &str) -> Result<(), String> {
    match ctx.eval::<(), _>(code) {
        Ok(()) => Ok(()),
        Err(rquickjs::Error::Exception) => Err(describe_exception(&ctx.catch())),
        Err(e) => Err(e.to_string()),
    }
}

fn describe_exception(value: &rquickjs::Value<'_>) -> String {
    if let Some(obj) = value.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            return message;
        }
    }
    if let Some(s) = value.as_string() {
        if let Ok(s) = s.to_string() {
            return s;
        }
    }
    "script exception".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::{Value, json};

    use fazt_core::apps::AppStore;
    use fazt_core::blobs::BlobStore;
    use fazt_core::capacity::{Capacity, derive, Probe};
    use fazt_core::docs::DocStore;
    use fazt_core::kv::KvStore;
    use fazt_core::queue::WriteQueue;
    use fazt_core::telemetry::TelemetryBuffer;
    use fazt_core::users::{Role, UserRecord};
    use fazt_core::vfs::Vfs;
    use fazt_storage::{MemoryBackend, StorageBackend};

    use crate::host::HostAuth;

    struct Fixture {
        storage: Arc<dyn StorageBackend>,
        queue: Arc<WriteQueue>,
        kv: Arc<KvStore>,
        docs: Arc<DocStore>,
        blobs: Arc<BlobStore>,
        vfs: Arc<Vfs>,
        telemetry: Arc<TelemetryBuffer>,
        capacity: Capacity,
        app: fazt_core::apps::AppRecord,
    }

    async fn fixture() -> Fixture {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(256);
        let apps = AppStore::new(Arc::clone(&storage), Arc::clone(&queue));
        let app = apps.create("test-app", "deploy").await.unwrap();
        Fixture {
            kv: Arc::new(KvStore::new(Arc::clone(&storage), Arc::clone(&queue))),
            docs: Arc::new(DocStore::new(Arc::clone(&storage), Arc::clone(&queue))),
            blobs: Arc::new(BlobStore::new(Arc::clone(&storage), Arc::clone(&queue))),
            vfs: Arc::new(Vfs::new(
                Arc::clone(&storage),
                Arc::clone(&queue),
                1024 * 1024,
                512 * 1024,
            )),
            telemetry: Arc::new(TelemetryBuffer::new(2, 1000, 10_000)),
            capacity: derive(Probe {
                effective_ram_bytes: 1024 * 1024 * 1024,
                cpus: 2,
            }),
            app,
            storage,
            queue,
        }
    }

    fn env_for(fx: &Fixture, user: Option<UserRecord>, wants_html: bool) -> HostEnv {
        HostEnv::new(
            fx.app.clone(),
            HostAuth { user, wants_html },
            fx.capacity.clone(),
            Arc::clone(&fx.storage),
            Arc::clone(&fx.kv),
            Arc::clone(&fx.docs),
            Arc::clone(&fx.blobs),
            Arc::clone(&fx.vfs),
            Arc::clone(&fx.telemetry),
            reqwest::Client::new(),
        )
    }

    fn get_request(path: &str) -> ScriptRequest {
        ScriptRequest {
            method: "GET".to_owned(),
            path: path.to_owned(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: Value::Null,
            files: Vec::new(),
        }
    }

    fn some_user(role: Role) -> UserRecord {
        let now = chrono::Utc::now();
        UserRecord {
            id: "user1".to_owned(),
            email: "a@example.com".to_owned(),
            name: "A".to_owned(),
            avatar: None,
            provider: "github".to_owned(),
            role,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn respond_with_status_and_body() {
        let fx = fixture().await;
        let response = invoke(
            env_for(&fx, None, false),
            "respond(201, {made: true});".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, json!({"made": true}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_respond_is_ignored() {
        let fx = fixture().await;
        let response = invoke(
            env_for(&fx, None, false),
            "respond(200, 'first'); respond(500, 'second');".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!("first"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_object_is_visible() {
        let fx = fixture().await;
        let mut request = get_request("/api/echo");
        request.query.insert("name".to_owned(), "fazt".to_owned());
        let response = invoke(
            env_for(&fx, None, false),
            "respond(200, {path: request.path, name: request.query.name});".to_owned(),
            &request,
        )
        .await
        .unwrap();
        assert_eq!(response.body, json!({"path": "/api/echo", "name": "fazt"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kv_roundtrip_through_script() {
        let fx = fixture().await;
        invoke(
            env_for(&fx, None, false),
            "kv.set('greeting', 'hello'); respond(200, {v: kv.get('greeting')});".to_owned(),
            &get_request("/"),
        )
        .await
        .map(|r| assert_eq!(r.body, json!({"v": "hello"})))
        .unwrap();

        // And the cell is visible outside the VM.
        let stored = fx
            .kv
            .get(&fazt_core::scope::Scope::app(&fx.app.id), "greeting")
            .await
            .unwrap();
        assert_eq!(stored, Some("hello".to_owned()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ds_insert_and_find_through_script() {
        let fx = fixture().await;
        let script = r#"
            ds.insert('notes', {session_id: request.body.s, text: request.body.text, id: fazt.id()});
            var mine = ds.find('notes', {session_id: request.body.s});
            respond(200, {data: mine});
        "#;
        let mut request = get_request("/api/note");
        request.body = json!({"s": "cedar-blue-river", "text": "hi"});

        let response = invoke(env_for(&fx, None, false), script.to_owned(), &request)
            .await
            .unwrap();
        let data = response.body.get("data").unwrap().as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["text"], "hi");
        assert_eq!(data[0]["session_id"], "cedar-blue-river");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn require_login_redirects_html_requests() {
        let fx = fixture().await;
        let response = invoke(
            env_for(&fx, None, true),
            "auth.requireLogin(); respond(200, 'never');".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 303);
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| k == "location" && v == "/login.html"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn require_login_is_401_for_api_requests() {
        let fx = fixture().await;
        let response = invoke(
            env_for(&fx, None, false),
            "auth.requireLogin(); respond(200, 'never');".to_owned(),
            &get_request("/api/x"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(response.body["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn require_admin_passes_for_admin_user() {
        let fx = fixture().await;
        let response = invoke(
            env_for(&fx, Some(some_user(Role::Admin)), false),
            "auth.requireAdmin(); respond(200, {user: auth.getUser().email});".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["user"], "a@example.com");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn require_admin_rejects_plain_user() {
        let fx = fixture().await;
        let response = invoke(
            env_for(&fx, Some(some_user(Role::User)), false),
            "auth.requireAdmin(); respond(200, 'never');".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 403);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn user_scope_without_user_raises() {
        let fx = fixture().await;
        let script = r#"
            var code = null;
            try { app.user.kv.set('k', 'v'); } catch (e) { code = e.code; }
            respond(200, {code: code});
        "#;
        let response = invoke(env_for(&fx, None, false), script.to_owned(), &get_request("/"))
            .await
            .unwrap();
        assert_eq!(response.body["code"], "UNAUTHORIZED");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn user_scoped_kv_is_isolated_per_user() {
        let fx = fixture().await;
        invoke(
            env_for(&fx, Some(some_user(Role::User)), false),
            "app.user.kv.set('secret', 'mine'); respond(200, null);".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();

        let mut other = some_user(Role::User);
        other.id = "user2".to_owned();
        let response = invoke(
            env_for(&fx, Some(other), false),
            "respond(200, {v: app.user.kv.get('secret') === undefined});".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.body["v"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn private_read_sees_private_subtree() {
        let fx = fixture().await;
        fx.vfs
            .put_file(&fx.app.id, "private/config.json", br#"{"flag": true}"#.to_vec())
            .await
            .unwrap();

        let response = invoke(
            env_for(&fx, None, false),
            "respond(200, {cfg: fazt.private.readJSON('config.json'), missing: fazt.private.exists('nope.txt')});"
                .to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.body["cfg"]["flag"], true);
        assert_eq!(response.body["missing"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn infinite_loop_hits_the_budget() {
        let fx = fixture().await;
        let err = invoke(
            env_for(&fx, None, false),
            "while (true) {}".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Budget));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn script_throw_is_a_script_error() {
        let fx = fixture().await;
        let err = invoke(
            env_for(&fx, None, false),
            "throw new Error('boom');".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Script { message } if message.contains("boom")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn script_without_respond_yields_empty_response() {
        let fx = fixture().await;
        let response = invoke(
            env_for(&fx, None, false),
            "var x = 1 + 1;".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 204);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn id_helpers_generate_identifiers() {
        let fx = fixture().await;
        let response = invoke(
            env_for(&fx, None, false),
            "respond(200, {id: fazt.id(), words: fazt.words(3)});".to_owned(),
            &get_request("/"),
        )
        .await
        .unwrap();
        assert_eq!(response.body["id"].as_str().unwrap().len(), 32);
        assert_eq!(response.body["words"].as_str().unwrap().split('-').count(), 3);
    }
}
