//! The admin JSON API.
//!
//! Mounted on the reserved `admin`/`api` hosts. Success responses wrap
//! payloads as `{"data": ...}`; failures use the `ApiError` envelope. The
//! same API serves the CLI and remote peers.

pub mod aliases;
pub mod apps;
pub mod auth;
pub mod keys;
pub mod logs;
pub mod sys;
pub mod users;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::middleware as axum_mw;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};

use crate::auth_gate::admin_middleware;
use crate::state::AppState;

/// Wrap a payload in the success envelope.
pub fn data<T: Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}

/// Build the inner router for the reserved `admin`/`api` hosts.
#[must_use]
pub fn admin_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    let api = Router::new()
        .merge(apps::router())
        .merge(aliases::router())
        .merge(users::router())
        .merge(keys::router())
        .merge(logs::router())
        .merge(sys::router());

    Router::new()
        .route("/health", get(health))
        .merge(auth::router())
        .nest("/api", api)
        .fallback(admin_static)
        .layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            admin_middleware,
        ))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Liveness. Public, bypasses the limiters.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    data(json!({
        "status": "ok",
        "maintenance": state.in_maintenance(),
    }))
}

/// Static assets of the admin surface, from the pinned region.
async fn admin_static(State(state): State<Arc<AppState>>, req: axum::extract::Request) -> Response {
    let rel = req.uri().path().trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    match state.vfs.get(crate::assets::ADMIN_APP, rel).await {
        Ok(Some(entry)) => {
            let mut response = axum::response::Response::new(axum::body::Body::from(
                entry.bytes.as_ref().clone(),
            ));
            if let Ok(value) = axum::http::HeaderValue::from_str(&entry.meta.mime) {
                response
                    .headers_mut()
                    .insert(axum::http::header::CONTENT_TYPE, value);
            }
            response
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
