//! The auth gate.
//!
//! Classifies paths into public / protected / admin-only, validates bearer
//! API keys and session cookies, and derives the client IP from trusted
//! proxy headers. Auth failures on API paths answer 401 JSON; on HTML
//! paths they redirect to the login page.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};

use fazt_core::apikeys::ApiKeyRecord;
use fazt_core::users::UserRecord;

use crate::error::ApiError;
use crate::state::AppState;

/// Path prefixes that never require credentials.
const PUBLIC_PREFIXES: &[&str] = &["/auth/", "/static/", "/webhooks/"];

/// Exact public paths.
const PUBLIC_PATHS: &[&str] = &["/health", "/login.html", "/favicon.ico", "/px.gif"];

/// Who the request is, after the gate.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user: Option<UserRecord>,
    pub key: Option<ApiKeyRecord>,
}

impl AuthContext {
    /// Any valid credential present?
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some() || self.key.is_some()
    }

    /// Admin-level access: an admin/owner user, or an API key carrying the
    /// `admin` scope.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.user.as_ref().is_some_and(|u| u.role.is_admin())
            || self.key.as_ref().is_some_and(|k| k.has_scope("admin"))
    }
}

/// Is the path public (no credentials required)?
#[must_use]
pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path) || PUBLIC_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Does the client prefer HTML (drives redirect-vs-401 on auth failure)?
#[must_use]
pub fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

/// Client IP for limiting and logging only, never for auth identity:
/// first `X-Forwarded-For` entry, else `X-Real-IP`, else the peer address.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
        .unwrap_or(peer)
}

/// Extract the session cookie value, if present.
fn session_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(cookie_name) {
            return parts.next().map(ToOwned::to_owned);
        }
    }
    None
}

/// Validate credentials in precedence order: bearer API key, then session
/// cookie. Invalid credentials yield an empty context, not an error — the
/// caller decides whether the path demanded one.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> AuthContext {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        if let Ok(key) = state.apikeys.lookup(bearer.trim()).await {
            return AuthContext {
                user: None,
                key: Some(key),
            };
        }
    }

    if let Some(token) = session_cookie(headers, &state.config.cookie_name) {
        if let Ok(session) = state.sessions.lookup(&token).await {
            if let Ok(user) = state.users.get(&session.user_id).await {
                return AuthContext {
                    user: Some(user),
                    key: None,
                };
            }
        }
    }

    AuthContext::default()
}

/// The auth failure response for a path: redirect for HTML, 401 JSON for
/// APIs.
#[must_use]
pub fn unauthorized_response(headers: &HeaderMap) -> Response {
    if wants_html(headers) {
        Redirect::to("/login.html").into_response()
    } else {
        ApiError::Unauthorized("missing or invalid credentials".to_owned()).into_response()
    }
}

/// Middleware for the reserved admin/api hosts: public paths pass through,
/// everything else needs credentials, and `/api/*` needs an admin role.
pub async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if is_public_path(&path) {
        return next.run(req).await;
    }

    let ctx = authenticate(&state, req.headers()).await;
    if !ctx.is_authenticated() {
        return unauthorized_response(req.headers());
    }
    if path.starts_with("/api/") && !ctx.is_admin() {
        return ApiError::Forbidden("admin role required".to_owned()).into_response();
    }

    req.extensions_mut().insert(ctx);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn public_paths_are_recognized() {
        assert!(is_public_path("/health"));
        assert!(is_public_path("/login.html"));
        assert!(is_public_path("/auth/session"));
        assert!(is_public_path("/static/app.css"));
        assert!(!is_public_path("/api/apps"));
        assert!(!is_public_path("/"));
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers, peer), "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers, peer), "198.51.100.2".parse::<IpAddr>().unwrap());

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, peer), peer);
    }

    #[test]
    fn malformed_forwarded_header_is_ignored() {
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, peer), peer);
    }

    #[test]
    fn session_cookie_is_extracted_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; fazt_session=tok123; other=1"),
        );
        assert_eq!(
            session_cookie(&headers, "fazt_session").as_deref(),
            Some("tok123")
        );
        assert_eq!(session_cookie(&headers, "missing"), None);
    }

    #[test]
    fn wants_html_reads_accept() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        assert!(wants_html(&headers));

        let mut api = HeaderMap::new();
        api.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!wants_html(&api));
    }
}
