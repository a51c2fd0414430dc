//! Sandboxed JavaScript handler execution.
//!
//! Every non-static request to an app with a handler script spins up a
//! fresh single-threaded QuickJS VM, hands it a `request` object and a
//! `respond` function, and tears it down when the script finishes — or
//! when it exceeds its wall-clock or memory budget. The only side effects
//! a script can cause go through the injected host surface: storage
//! capabilities, auth introspection, private-file reads, outbound HTTP.
//!
//! All host calls cross one JSON-string syscall boundary; a JS prelude
//! builds the ergonomic `fazt.*` API on top and re-throws host errors.

pub mod error;
pub mod host;
pub mod request;
pub mod vm;

pub use error::RuntimeError;
pub use host::{HostAuth, HostEnv};
pub use request::{ScriptFile, ScriptRequest, ScriptResponse, build_request};
pub use vm::invoke;
