//! Server configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `FAZT_*` environment variables.
//! Capacity tunables are not here — they live in the persisted capacity
//! record (`fazt_core::capacity`) so they survive restarts.

use std::net::SocketAddr;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Base domain apps hang off (`blog.<domain>`).
    pub domain: String,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Session cookie name.
    pub cookie_name: String,
    /// Session lifetime in hours.
    pub session_ttl_hours: i64,
    /// Telemetry flush interval in seconds.
    pub telemetry_flush_secs: u64,
    /// Whether TLS terminates in front of us (drives the `Secure` cookie
    /// attribute).
    pub tls_active: bool,
    /// Consecutive internal errors before maintenance mode engages.
    pub circuit_threshold: u32,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// redb persistent storage.
    Redb { path: String },
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on (binds to `0.0.0.0`)
    /// - `FAZT_BIND_ADDR` — full bind address (overrides `PORT`, default: `127.0.0.1:8080`)
    /// - `FAZT_DOMAIN` — base domain (default: `localhost`)
    /// - `FAZT_STORAGE` — `memory` or `redb` (default: `redb`)
    /// - `FAZT_STORAGE_PATH` — path for the redb file (default: `./data/fazt.redb`)
    /// - `FAZT_LOG_LEVEL` — log filter (default: `info`)
    /// - `FAZT_COOKIE_NAME` — session cookie name (default: `fazt_session`)
    /// - `FAZT_SESSION_TTL_HOURS` — session lifetime (default: `720`)
    /// - `FAZT_TELEMETRY_FLUSH_SECS` — flush cadence (default: `30`)
    /// - `FAZT_TLS` — set when TLS terminates upstream (default: unset)
    /// - `FAZT_CIRCUIT_THRESHOLD` — internal errors before maintenance (default: `25`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("FAZT_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8080);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        };

        let domain = std::env::var("FAZT_DOMAIN").unwrap_or_else(|_| "localhost".to_owned());

        let storage_path = std::env::var("FAZT_STORAGE_PATH")
            .unwrap_or_else(|_| "./data/fazt.redb".to_owned());
        let storage_backend = match std::env::var("FAZT_STORAGE")
            .unwrap_or_else(|_| "redb".to_owned())
            .to_lowercase()
            .as_str()
        {
            "memory" => StorageBackendType::Memory,
            _ => StorageBackendType::Redb { path: storage_path },
        };

        let log_level = std::env::var("FAZT_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let cookie_name =
            std::env::var("FAZT_COOKIE_NAME").unwrap_or_else(|_| "fazt_session".to_owned());

        let session_ttl_hours = std::env::var("FAZT_SESSION_TTL_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(720);

        let telemetry_flush_secs = std::env::var("FAZT_TELEMETRY_FLUSH_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let tls_active = std::env::var("FAZT_TLS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let circuit_threshold = std::env::var("FAZT_CIRCUIT_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(25);

        Self {
            bind_addr,
            domain,
            storage_backend,
            log_level,
            cookie_name,
            session_ttl_hours,
            telemetry_flush_secs,
            tls_active,
            circuit_threshold,
        }
    }
}
