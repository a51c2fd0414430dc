//! Core library for Fazt.
//!
//! Everything between the HTTP front and the storage backend lives here:
//! the single-worker write queue, the capacity probe that sizes caches and
//! ceilings from the host, the byte-bounded VFS cache with its pinned
//! region, alias routing, the app/user/session/key stores, the storage
//! capabilities handed to handler scripts (KV, documents, blobs), the
//! buffered telemetry pipeline, and deploys.
//!
//! The crate is transport-agnostic: it never sees an HTTP request. The
//! server crate owns dispatch and translates core errors into responses.

pub mod alias;
pub mod apikeys;
pub mod apps;
pub mod blobs;
pub mod capacity;
pub mod deploy;
pub mod docs;
pub mod error;
pub mod ids;
pub mod kv;
pub mod queue;
pub mod scope;
pub mod sessions;
pub mod telemetry;
pub mod users;
pub mod vfs;
