//! Fazt HTTP server.
//!
//! Wires the core engine, the JS runtime, and the storage backend into one
//! Axum server. Every inbound request walks the dispatcher: connection
//! slot, rate token, alias resolution, auth gate, then static serve or
//! handler invocation. The admin surface (reserved `admin`/`api` hosts)
//! runs on an inner router and bypasses the limiters so it stays
//! responsive under overload.

pub mod assets;
pub mod auth_gate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod limits;
pub mod routes;
pub mod state;
