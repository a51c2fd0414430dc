//! The dispatcher: every inbound request walks through here.
//!
//! Order per request: connection slot → rate token → alias resolution →
//! auth gate → static serve from the VFS, or handler invocation in the JS
//! runtime → telemetry. Reserved `admin`/`api` hosts forward to the inner
//! admin router and bypass the limiters; the `404` system app answers
//! unknown aliases and paths; maintenance mode short-circuits everything
//! but the pinned admin surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower::util::ServiceExt;
use tracing::{debug, warn};

use fazt_core::alias::RouteDecision;
use fazt_core::apps::{AppRecord, Visibility};
use fazt_core::telemetry::Actor;
use fazt_core::vfs::FileEntry;
use fazt_runtime::{HostAuth, HostEnv, ScriptResponse, build_request};

use crate::assets::{LANDING_APP, NOT_FOUND_APP};
use crate::auth_gate::{authenticate, client_ip, unauthorized_response, wants_html};
use crate::error::ApiError;
use crate::state::AppState;

/// Limiter middleware: connection cap first, then the token bucket.
/// `/health` and the reserved admin/api hosts bypass both.
pub async fn limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let host = fazt_core::alias::normalize_host(host);
    let bypass = req.uri().path() == "/health"
        || host.starts_with("admin.")
        || host.starts_with("api.");
    if bypass {
        return next.run(req).await;
    }

    let ip = client_ip(req.headers(), peer.ip());

    let Some(_slot) = state.limits.acquire_connection(ip) else {
        return ApiError::Overloaded.into_response();
    };

    if !state.limits.check_rate(ip) {
        let mut response = ApiError::RateLimited.into_response();
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        if let Ok(limit) = HeaderValue::from_str(&state.limits.burst().to_string()) {
            headers.insert("x-ratelimit-limit", limit);
        }
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        return response;
    }

    // The connection slot is held until the response is written.
    next.run(req).await
}

/// The fallback handler owning the full request walk.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let ip = client_ip(req.headers(), peer.ip());
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();

    let decision = state.aliases.resolve(&host).await;

    if state.in_maintenance()
        && !matches!(&decision, RouteDecision::Reserved { label } if label == "admin" || label == "api")
    {
        return ApiError::Overloaded.into_response();
    }

    let deadline = Duration::from_millis(state.capacity.get().request_deadline_ms);
    let response =
        match tokio::time::timeout(deadline, route(Arc::clone(&state), decision, req)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(host = %host, path = %path, "request deadline exceeded");
                ApiError::Timeout.into_response()
            }
        };

    let status = response.status().as_u16();
    if status == 500 {
        state.record_internal();
    } else {
        state.record_success();
    }

    state.telemetry.activity(
        Actor {
            kind: "ip".to_owned(),
            id: ip.to_string(),
        },
        &format!("{host}{path}"),
        &method,
        &status.to_string(),
        0,
    );
    #[allow(clippy::cast_precision_loss)]
    state
        .telemetry
        .metric("request_ms", started.elapsed().as_millis() as f64);

    response
}

/// Route a resolved decision.
async fn route(state: Arc<AppState>, decision: RouteDecision, req: Request) -> Response {
    match decision {
        RouteDecision::Reserved { label } if label == "admin" || label == "api" => {
            match state.admin_router() {
                Some(router) => match router.oneshot(req).await {
                    Ok(response) => response,
                    Err(infallible) => match infallible {},
                },
                None => ApiError::Internal("admin surface not installed".to_owned())
                    .into_response(),
            }
        }
        RouteDecision::Reserved { label } if label == "landing" => {
            serve_static_only(&state, LANDING_APP, req.uri().path()).await
        }
        RouteDecision::Reserved { label } => {
            debug!(label = %label, "reserved alias answered 403");
            ApiError::Forbidden(format!("'{label}' is reserved")).into_response()
        }
        RouteDecision::Redirect { url } => {
            let mut response = StatusCode::FOUND.into_response();
            if let Ok(value) = HeaderValue::from_str(&url) {
                response.headers_mut().insert(header::LOCATION, value);
            }
            response
        }
        RouteDecision::None => not_found(&state).await,
        RouteDecision::Proxy { app_id } => serve_app(state.as_ref(), &app_id, req).await,
    }
}

/// The 404 surface: the reserved `404` system app with status 404.
async fn not_found(state: &AppState) -> Response {
    match state.vfs.get(NOT_FOUND_APP, "index.html").await {
        Ok(Some(entry)) => {
            let mut response = file_response(&entry, None);
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
        _ => ApiError::NotFound("no app at this address".to_owned()).into_response(),
    }
}

/// Serve one app: trailing-slash canonicalization, auth gate, static
/// lookup, handler invocation, SPA fallback, 404.
async fn serve_app(state: &AppState, app_id: &str, req: Request) -> Response {
    let app = match state.apps.get(app_id).await {
        Ok(app) => app,
        Err(_) => return not_found(state).await,
    };

    let uri = req.uri().clone();
    let raw_path = uri.path();

    // Canonical form: no trailing slash on non-root paths (301).
    if raw_path.len() > 1 && raw_path.ends_with('/') {
        let trimmed = raw_path.trim_end_matches('/');
        let location = match uri.query() {
            Some(q) => format!("{trimmed}?{q}"),
            None => trimmed.to_owned(),
        };
        let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
        if let Ok(value) = HeaderValue::from_str(&location) {
            response.headers_mut().insert(header::LOCATION, value);
        }
        return response;
    }

    let rel = raw_path.trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };

    let ctx = authenticate(state, req.headers()).await;
    let is_private_path = rel.starts_with("private/");
    let needs_auth = is_private_path || app.visibility == Visibility::Private;
    if needs_auth && !ctx.is_authenticated() {
        return unauthorized_response(req.headers());
    }

    // Static lookup: exact path, then `.html` for extensionless paths,
    // then a directory index. The handler file itself is never served.
    let last_segment = rel.rsplit('/').next().unwrap_or(rel);
    let mut candidates = vec![rel.to_owned()];
    if !last_segment.contains('.') {
        candidates.push(format!("{rel}.html"));
        candidates.push(format!("{rel}/index.html"));
    }
    for candidate in &candidates {
        if app.handler.as_deref() == Some(candidate.as_str()) {
            continue;
        }
        match state.vfs.get(&app.id, candidate).await {
            Ok(Some(entry)) => {
                let if_none_match = req
                    .headers()
                    .get(header::IF_NONE_MATCH)
                    .and_then(|v| v.to_str().ok())
                    .map(ToOwned::to_owned);
                return file_response(&entry, if_none_match.as_deref());
            }
            Ok(None) => {}
            Err(e) => return ApiError::from(e).into_response(),
        }
    }

    if let Some(handler) = app.handler.clone() {
        return run_handler(state, &app, &handler, ctx.user, req).await;
    }

    // SPA fallback: unmatched extensionless paths serve the root document.
    if app.spa && !last_segment.contains('.') {
        if let Ok(Some(entry)) = state.vfs.get(&app.id, "index.html").await {
            return file_response(&entry, None);
        }
    }

    not_found(state).await
}

/// Serve only static files of a system app (landing page).
async fn serve_static_only(state: &AppState, app_id: &str, raw_path: &str) -> Response {
    let rel = raw_path.trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    match state.vfs.get(app_id, rel).await {
        Ok(Some(entry)) => file_response(&entry, None),
        _ => not_found(state).await,
    }
}

/// Invoke the app's handler script and translate its response.
async fn run_handler(
    state: &AppState,
    app: &AppRecord,
    handler: &str,
    user: Option<fazt_core::users::UserRecord>,
    req: Request,
) -> Response {
    let script = match state.vfs.get(&app.id, handler).await {
        Ok(Some(entry)) => String::from_utf8_lossy(&entry.bytes).into_owned(),
        Ok(None) => {
            warn!(app_id = %app.id, handler, "declared handler missing from tree");
            return ApiError::Internal("handler script not found".to_owned()).into_response();
        }
        Err(e) => return ApiError::from(e).into_response(),
    };

    let capacity = state.capacity.get();
    let html = wants_html(req.headers());
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();

    let query: HashMap<String, String> =
        match Query::<HashMap<String, String>>::try_from_uri(req.uri()) {
            Ok(Query(map)) => map,
            Err(_) => {
                return ApiError::Validation("malformed query string".to_owned()).into_response();
            }
        };

    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_owned(), value.to_owned());
        }
    }
    let content_type = headers.get("content-type").cloned();

    let body = match axum::body::to_bytes(
        req.into_body(),
        usize::try_from(capacity.max_upload_bytes).unwrap_or(usize::MAX),
    )
    .await
    {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return ApiError::PayloadTooLarge("request body exceeds the upload ceiling".to_owned())
                .into_response();
        }
    };

    let request = match build_request(
        &method,
        &path,
        query,
        headers,
        content_type.as_deref(),
        body,
    )
    .await
    {
        Ok(request) => request,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let env = HostEnv::new(
        app.clone(),
        HostAuth {
            user,
            wants_html: html,
        },
        capacity,
        Arc::clone(&state.storage),
        Arc::clone(&state.kv),
        Arc::clone(&state.docs),
        Arc::clone(&state.blobs),
        Arc::clone(&state.vfs),
        Arc::clone(&state.telemetry),
        state.http.clone(),
    );

    match fazt_runtime::invoke(env, script, &request).await {
        Ok(script_response) => script_to_response(script_response),
        Err(e) => {
            warn!(app_id = %app.id, error = %e, "handler invocation failed");
            ApiError::from(e).into_response()
        }
    }
}

/// Translate a script's `respond(...)` into an HTTP response. Strings go
/// out as HTML, everything else as JSON; script headers win.
fn script_to_response(script: ScriptResponse) -> Response {
    let status = StatusCode::from_u16(script.status).unwrap_or(StatusCode::OK);

    let (default_type, body) = match &script.body {
        serde_json::Value::Null => (None, Body::empty()),
        serde_json::Value::String(text) => (
            Some("text/html; charset=utf-8"),
            Body::from(text.clone()),
        ),
        other => (
            Some("application/json"),
            Body::from(other.to_string()),
        ),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Some(default_type) = default_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(default_type));
    }
    for (name, value) in &script.headers {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// A static file with caching headers. The content hash is the ETag.
fn file_response(entry: &FileEntry, if_none_match: Option<&str>) -> Response {
    let etag = format!("\"{}\"", entry.meta.hash);
    if if_none_match.is_some_and(|tag| tag == etag) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        if let Ok(value) = HeaderValue::from_str(&etag) {
            response.headers_mut().insert(header::ETAG, value);
        }
        return response;
    }

    let mut response = Response::new(Body::from(entry.bytes.as_ref().clone()));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&entry.meta.mime) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=60"),
    );
    response
}
