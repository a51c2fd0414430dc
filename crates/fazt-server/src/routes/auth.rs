//! Session endpoints: `POST /auth/session`, `POST /auth/logout`.
//!
//! Sessions are minted by exchanging a valid API key — the login form
//! posts it, the CLI sends JSON. The user record behind the session is
//! created on first authentication (the very first becomes the owner).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::post;
use axum::Router;
use chrono::Duration;
use serde_json::json;

use crate::auth_gate::wants_html;
use crate::error::ApiError;
use crate::routes::data;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/session", post(create_session))
        .route("/auth/logout", post(logout))
}

/// Pull the API key out of a JSON (`{"key": ...}`) or form
/// (`key=...`) body.
fn extract_key(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    if content_type.is_some_and(|ct| ct.starts_with("application/json")) {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        return value.get("key").and_then(|v| v.as_str()).map(ToOwned::to_owned);
    }
    // Form-encoded login page post. API keys are URL-safe, no decoding
    // needed.
    let text = std::str::from_utf8(body).ok()?;
    text.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == "key").then(|| value.to_owned())
    })
}

async fn create_session(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let html = wants_html(req.headers());
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let body = match axum::body::to_bytes(req.into_body(), 64 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::PayloadTooLarge("login body too large".to_owned()).into_response();
        }
    };
    let Some(key) = extract_key(content_type.as_deref(), &body) else {
        return ApiError::Validation("missing 'key'".to_owned()).into_response();
    };

    let record = match state.apikeys.lookup(key.trim()).await {
        Ok(record) => record,
        Err(_) => {
            return ApiError::Unauthorized("invalid api key".to_owned()).into_response();
        }
    };

    // Users are created on first authentication; keys act for a synthetic
    // identity named after them.
    let email = format!("{}@fazt.local", record.name);
    let user = match state.users.ensure(&email, &record.name, "apikey").await {
        Ok(user) => user,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let ttl = Duration::hours(state.config.session_ttl_hours);
    let token = match state.sessions.create(&user.id, ttl).await {
        Ok(token) => token,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let cookie = session_cookie(&state, &token, ttl.num_seconds());
    let mut response = if html {
        Redirect::to("/").into_response()
    } else {
        data(json!({
            "user": { "id": user.id, "email": user.email, "role": user.role }
        }))
        .into_response()
    };
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

async fn logout(State(state): State<Arc<AppState>>, req: Request) -> Response {
    if let Some(token) = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            raw.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == state.config.cookie_name).then(|| value.to_owned())
            })
        })
    {
        let _ = state.sessions.delete(&token).await;
    }

    let mut response = data(json!({ "ok": true })).into_response();
    let expired = format!(
        "{}=deleted; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        state.config.cookie_name
    );
    if let Ok(value) = HeaderValue::from_str(&expired) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

fn session_cookie(state: &AppState, token: &str, max_age_secs: i64) -> String {
    let mut cookie = format!(
        "{}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}",
        state.config.cookie_name
    );
    if state.config.tls_active {
        cookie.push_str("; Secure");
    }
    cookie
}
