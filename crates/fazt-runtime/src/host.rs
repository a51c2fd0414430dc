//! The host capability surface.
//!
//! Scripts reach the outside world through one syscall: a name plus a JSON
//! argument string, answered with a JSON envelope (`{"ok": ...}` or
//! `{"err": {code, message}}`). The prelude turns host errors back into JS
//! exceptions. Syscalls run synchronously on the VM thread and bridge into
//! the async world with a captured runtime handle — the VM never suspends
//! mid-invocation except inside these calls.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use fazt_core::apps::AppRecord;
use fazt_core::blobs::BlobStore;
use fazt_core::capacity::Capacity;
use fazt_core::docs::DocStore;
use fazt_core::error::{BlobError, DocError, KvError, QueueError};
use fazt_core::ids;
use fazt_core::kv::KvStore;
use fazt_core::scope::Scope;
use fazt_core::telemetry::{OutboundHttpEntry, TelemetryBuffer, TelemetryEvent};
use fazt_core::users::UserRecord;
use fazt_core::vfs::Vfs;
use fazt_storage::StorageBackend;

use crate::request::ScriptResponse;

/// Outbound HTTP timeout for `fazt.http.fetch`.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A syscall failure, surfaced to the script as a thrown `Error` with a
/// stable `code` property.
#[derive(Debug, Clone)]
pub struct SysError {
    pub code: &'static str,
    pub message: String,
}

impl SysError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            code: "VALIDATION_FAILED",
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            code: "UNAUTHORIZED",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "INTERNAL",
            message: message.into(),
        }
    }

    fn overloaded() -> Self {
        Self {
            code: "OVERLOADED",
            message: "write queue is full".to_owned(),
        }
    }
}

impl From<KvError> for SysError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Queue(QueueError::Overloaded) => Self::overloaded(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<DocError> for SysError {
    fn from(err: DocError) -> Self {
        match err {
            DocError::BadOperator { .. }
            | DocError::BadQuery { .. }
            | DocError::BadDocument { .. }
            | DocError::NotNumeric { .. } => Self::validation(err.to_string()),
            DocError::Queue(QueueError::Overloaded) => Self::overloaded(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<BlobError> for SysError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::TooLarge { .. } => Self {
                code: "PAYLOAD_TOO_LARGE",
                message: err.to_string(),
            },
            BlobError::Queue(QueueError::Overloaded) => Self::overloaded(),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Authentication context carried into the invocation.
#[derive(Debug, Clone)]
pub struct HostAuth {
    pub user: Option<UserRecord>,
    /// Whether auth failures should redirect (HTML) instead of 401/403 (API).
    pub wants_html: bool,
}

/// Everything one invocation may touch.
pub struct HostEnv {
    pub app: AppRecord,
    pub auth: HostAuth,
    pub capacity: Capacity,
    storage: Arc<dyn StorageBackend>,
    kv: Arc<KvStore>,
    docs: Arc<DocStore>,
    blobs: Arc<BlobStore>,
    vfs: Arc<Vfs>,
    telemetry: Arc<TelemetryBuffer>,
    http: reqwest::Client,
    handle: tokio::runtime::Handle,
    response: Mutex<Option<ScriptResponse>>,
}

impl HostEnv {
    /// Build the environment. Must be called from within the tokio runtime
    /// (the handle is captured here and used from the VM thread).
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app: AppRecord,
        auth: HostAuth,
        capacity: Capacity,
        storage: Arc<dyn StorageBackend>,
        kv: Arc<KvStore>,
        docs: Arc<DocStore>,
        blobs: Arc<BlobStore>,
        vfs: Arc<Vfs>,
        telemetry: Arc<TelemetryBuffer>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            app,
            auth,
            capacity,
            storage,
            kv,
            docs,
            blobs,
            vfs,
            telemetry,
            http,
            handle: tokio::runtime::Handle::current(),
            response: Mutex::new(None),
        }
    }

    /// The response the script produced, if any.
    #[must_use]
    pub fn take_response(&self) -> Option<ScriptResponse> {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_response_once(&self, response: ScriptResponse) {
        let mut slot = self
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(response);
        }
    }

    /// Whether a response (normal or early) has been finalized.
    #[must_use]
    pub fn has_response(&self) -> bool {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Entry point for the VM: JSON-string in, JSON-envelope out.
    #[must_use]
    pub fn syscall_json(&self, name: &str, args_json: &str) -> String {
        let args: Value = serde_json::from_str(args_json).unwrap_or(Value::Null);
        match self.syscall(name, &args) {
            Ok(value) => json!({ "ok": value }).to_string(),
            Err(err) => {
                json!({ "err": { "code": err.code, "message": err.message } }).to_string()
            }
        }
    }

    fn scope(&self, args: &Value) -> Result<Scope, SysError> {
        match args.get("scope").and_then(Value::as_str) {
            Some("user") => {
                let user = self
                    .auth
                    .user
                    .as_ref()
                    .ok_or_else(|| SysError::unauthorized("user-scoped storage requires a logged-in user"))?;
                Ok(Scope::user(&self.app.id, &user.id))
            }
            _ => Ok(Scope::app(&self.app.id)),
        }
    }

    fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, SysError> {
        args.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| SysError::validation(format!("missing argument '{name}'")))
    }

    #[allow(clippy::too_many_lines)]
    fn syscall(&self, name: &str, args: &Value) -> Result<Value, SysError> {
        match name {
            // ── Response ────────────────────────────────────────────
            "respond" => {
                let status = match args.get("status") {
                    None | Some(Value::Null) => 200,
                    Some(v) => {
                        let s = v.as_u64().ok_or_else(|| {
                            SysError::validation("status must be a number")
                        })?;
                        u16::try_from(s)
                            .ok()
                            .filter(|s| (100..=599).contains(s))
                            .ok_or_else(|| SysError::validation("status out of range"))?
                    }
                };
                let headers = match args.get("headers") {
                    Some(Value::Object(map)) => map
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                        .collect(),
                    _ => Vec::new(),
                };
                self.set_response_once(ScriptResponse {
                    status,
                    body: args.get("body").cloned().unwrap_or(Value::Null),
                    headers,
                });
                Ok(Value::Null)
            }
            "abort" => {
                let kind = Self::str_arg(args, "kind")?;
                self.set_response_once(self.abort_response(kind));
                Ok(Value::Null)
            }

            // ── KV ──────────────────────────────────────────────────
            "kv.set" => {
                let scope = self.scope(args)?;
                let key = Self::str_arg(args, "key")?;
                let value = Self::str_arg(args, "value")?;
                let ttl = args.get("ttl").and_then(Value::as_u64);
                self.handle
                    .block_on(self.kv.set(&scope, key, value, ttl))?;
                Ok(Value::Null)
            }
            "kv.get" => {
                let scope = self.scope(args)?;
                let key = Self::str_arg(args, "key")?;
                let value = self.handle.block_on(self.kv.get(&scope, key))?;
                Ok(json!({ "value": value }))
            }
            "kv.delete" => {
                let scope = self.scope(args)?;
                let key = Self::str_arg(args, "key")?;
                self.handle.block_on(self.kv.delete(&scope, key))?;
                Ok(Value::Null)
            }
            "kv.list" => {
                let scope = self.scope(args)?;
                let prefix = args.get("prefix").and_then(Value::as_str).unwrap_or("");
                let keys = self.handle.block_on(self.kv.list(&scope, prefix))?;
                Ok(json!({ "keys": keys }))
            }

            // ── Documents ───────────────────────────────────────────
            "ds.insert" => {
                let scope = self.scope(args)?;
                let collection = Self::str_arg(args, "collection")?;
                let doc = args.get("doc").cloned().unwrap_or(Value::Null);
                let stored = self
                    .handle
                    .block_on(self.docs.insert(&scope, collection, doc))?;
                Ok(stored)
            }
            "ds.find" => {
                let scope = self.scope(args)?;
                let collection = Self::str_arg(args, "collection")?;
                let query = args.get("query").cloned().unwrap_or_else(|| json!({}));
                let docs = self
                    .handle
                    .block_on(self.docs.find(&scope, collection, &query))?;
                Ok(json!({ "docs": docs }))
            }
            "ds.findOne" => {
                let scope = self.scope(args)?;
                let collection = Self::str_arg(args, "collection")?;
                let query = args.get("query").cloned().unwrap_or_else(|| json!({}));
                let doc = self
                    .handle
                    .block_on(self.docs.find_one(&scope, collection, &query))?;
                Ok(json!({ "doc": doc }))
            }
            "ds.update" => {
                let scope = self.scope(args)?;
                let collection = Self::str_arg(args, "collection")?;
                let query = args.get("query").cloned().unwrap_or_else(|| json!({}));
                let mutation = args.get("mutation").cloned().unwrap_or_else(|| json!({}));
                let count = self
                    .handle
                    .block_on(self.docs.update(&scope, collection, &query, &mutation))?;
                Ok(json!({ "count": count }))
            }
            "ds.delete" => {
                let scope = self.scope(args)?;
                let collection = Self::str_arg(args, "collection")?;
                let query = args.get("query").cloned().unwrap_or_else(|| json!({}));
                let count = self
                    .handle
                    .block_on(self.docs.delete(&scope, collection, &query))?;
                Ok(json!({ "count": count }))
            }

            // ── Blobs ───────────────────────────────────────────────
            "s3.put" => {
                let scope = self.scope(args)?;
                let path = Self::str_arg(args, "path")?;
                let data = Self::str_arg(args, "data")?.as_bytes().to_vec();
                let mime = args
                    .get("mime")
                    .and_then(Value::as_str)
                    .unwrap_or("application/octet-stream");
                let meta = self.handle.block_on(self.blobs.put(
                    &scope,
                    path,
                    data,
                    mime,
                    self.capacity.max_upload_bytes,
                ))?;
                Ok(json!({ "size": meta.size, "hash": meta.hash }))
            }
            "s3.get" => {
                let scope = self.scope(args)?;
                let path = Self::str_arg(args, "path")?;
                match self.handle.block_on(self.blobs.get(&scope, path))? {
                    None => Ok(Value::Null),
                    Some(blob) => {
                        let data = String::from_utf8_lossy(&blob.bytes).into_owned();
                        Ok(json!({
                            "data": data,
                            "mime": blob.meta.mime,
                            "size": blob.meta.size,
                            "hash": blob.meta.hash,
                        }))
                    }
                }
            }
            "s3.delete" => {
                let scope = self.scope(args)?;
                let path = Self::str_arg(args, "path")?;
                self.handle.block_on(self.blobs.delete(&scope, path))?;
                Ok(Value::Null)
            }
            "s3.list" => {
                let scope = self.scope(args)?;
                let prefix = args.get("prefix").and_then(Value::as_str).unwrap_or("");
                let paths = self.handle.block_on(self.blobs.list(&scope, prefix))?;
                Ok(json!({ "paths": paths }))
            }

            // ── Auth introspection ──────────────────────────────────
            "auth.user" => {
                let user = self.auth.user.as_ref().map(|u| {
                    json!({
                        "id": u.id,
                        "email": u.email,
                        "name": u.name,
                        "role": u.role,
                    })
                });
                Ok(json!({ "user": user }))
            }

            // ── Private files ───────────────────────────────────────
            "private.read" => {
                let path = Self::str_arg(args, "path")?;
                let full = private_path(path)?;
                let data = self
                    .handle
                    .block_on(self.vfs.get(&self.app.id, &full))
                    .map_err(|e| SysError::internal(e.to_string()))?
                    .map(|entry| String::from_utf8_lossy(&entry.bytes).into_owned());
                Ok(json!({ "data": data }))
            }
            "private.exists" => {
                let path = Self::str_arg(args, "path")?;
                let full = private_path(path)?;
                let exists = self
                    .handle
                    .block_on(self.vfs.get(&self.app.id, &full))
                    .map_err(|e| SysError::internal(e.to_string()))?
                    .is_some();
                Ok(json!({ "exists": exists }))
            }
            "private.list" => {
                let prefix = format!("vfsmeta/{}/private/", self.app.id);
                let keys = self
                    .handle
                    .block_on(self.storage.list(&prefix))
                    .map_err(|e| SysError::internal(e.to_string()))?;
                let paths: Vec<String> = keys
                    .iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
                    .collect();
                Ok(json!({ "paths": paths }))
            }

            // ── Identity helpers ────────────────────────────────────
            "id.new" => Ok(json!({ "id": ids::new_id() })),
            "id.words" => {
                let n = args
                    .get("n")
                    .and_then(Value::as_u64)
                    .map_or(3, |n| n.clamp(1, 8) as usize);
                Ok(json!({ "words": ids::words(n) }))
            }

            // ── Outbound HTTP ───────────────────────────────────────
            "http.fetch" => self.fetch(args),

            // ── Console ─────────────────────────────────────────────
            "log" => {
                let message = args.get("message").and_then(Value::as_str).unwrap_or("");
                debug!(app_id = %self.app.id, "script: {message}");
                Ok(Value::Null)
            }

            other => Err(SysError::validation(format!("unknown syscall '{other}'"))),
        }
    }

    /// Early response for a failed `require*` call.
    fn abort_response(&self, kind: &str) -> ScriptResponse {
        let login = kind == "login";
        if self.auth.wants_html && login {
            return ScriptResponse {
                status: 303,
                body: Value::Null,
                headers: vec![("location".to_owned(), "/login.html".to_owned())],
            };
        }
        let (status, code, message) = if login {
            (401, "UNAUTHORIZED", "login required")
        } else {
            (403, "FORBIDDEN", "insufficient role")
        };
        ScriptResponse {
            status,
            body: json!({ "error": { "code": code, "message": message } }),
            headers: Vec::new(),
        }
    }

    /// `fazt.http.fetch`: outbound HTTP with a pooled client, 30 s timeout,
    /// and a telemetry log line per call.
    fn fetch(&self, args: &Value) -> Result<Value, SysError> {
        let url = Self::str_arg(args, "url")?.to_owned();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SysError::validation("url must be http(s)"));
        }
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let started = Instant::now();

        let result = self.handle.block_on(async {
            let method = reqwest::Method::from_bytes(method.as_bytes())
                .map_err(|_| SysError::validation("bad method"))?;
            let mut builder = self
                .http
                .request(method, &url)
                .timeout(FETCH_TIMEOUT);
            if let Some(Value::Object(headers)) = args.get("headers") {
                for (k, v) in headers {
                    if let Some(v) = v.as_str() {
                        builder = builder.header(k, v);
                    }
                }
            }
            if let Some(body) = args.get("body") {
                builder = match body {
                    Value::String(s) => builder.body(s.clone()),
                    Value::Null => builder,
                    other => builder.json(other),
                };
            }
            let response = builder
                .send()
                .await
                .map_err(|e| SysError::internal(format!("fetch failed: {e}")))?;
            let status = response.status().as_u16();
            let mut headers = serde_json::Map::new();
            for (k, v) in response.headers() {
                if let Ok(v) = v.to_str() {
                    headers.insert(k.as_str().to_owned(), Value::String(v.to_owned()));
                }
            }
            let body = response
                .text()
                .await
                .map_err(|e| SysError::internal(format!("fetch body failed: {e}")))?;
            Ok::<Value, SysError>(json!({
                "status": status,
                "headers": headers,
                "body": body,
            }))
        });

        self.telemetry
            .record(TelemetryEvent::Http(OutboundHttpEntry {
                ts: Utc::now(),
                app_id: self.app.id.clone(),
                method,
                url,
                status: result
                    .as_ref()
                    .ok()
                    .and_then(|v| v.get("status"))
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok()),
                duration_ms: started.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
            }));
        result
    }
}

/// Resolve a script-supplied private path; traversal is rejected.
fn private_path(path: &str) -> Result<String, SysError> {
    let bad = path.is_empty()
        || path.contains('\0')
        || path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(SysError::validation(format!("bad private path '{path}'")));
    }
    Ok(format!("private/{path}"))
}

impl std::fmt::Debug for HostEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEnv")
            .field("app", &self.app.id)
            .finish_non_exhaustive()
    }
}
