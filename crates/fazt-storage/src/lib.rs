//! Storage backend abstraction for Fazt.
//!
//! This crate defines the [`StorageBackend`] trait — a pure key-value storage
//! interface that knows nothing about apps, aliases, or the write queue. All
//! higher-level state (VFS files, KV cells, documents, blobs, users,
//! sessions, logs) lives in one store behind this trait, namespaced by key
//! prefix.
//!
//! Two implementations are provided:
//!
//! - [`RedbBackend`] — production default, backed by redb (pure Rust,
//!   transactional B-tree)
//! - [`MemoryBackend`] — in-memory, for testing only
//!
//! Mutations are expected to arrive serialized through the core write queue;
//! backends must nevertheless be safe for concurrent use, since reads run in
//! parallel with the single writer.

mod error;
mod memory;
mod redb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
pub use redb_backend::RedbBackend;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `app/8f2c...`,
/// `vfsdata/8f2c.../index.html`). Values are opaque byte arrays.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Store several key-value pairs in one transaction.
    ///
    /// Pairs with a `None` value are deleted. Used by deploys (replace a
    /// whole file tree) and telemetry flushes (one batch per flush); either
    /// the entire batch commits or none of it does.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] or [`StorageError::Transaction`] if
    /// the underlying backend fails.
    async fn put_batch(&self, pairs: Vec<(String, Option<Vec<u8>>)>) -> Result<(), StorageError>;

    /// Delete a key. This is idempotent — deleting a non-existent key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix.
    ///
    /// Returns keys only, not values. This is a metadata operation used for
    /// directory-style listing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Fetch all key-value pairs under a prefix, in key order.
    ///
    /// The document store and deploy inspection use this for collection
    /// scans; prefer [`list`](StorageBackend::list) when values are not
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Check whether a key exists in storage.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and checks
    /// for `Some`. Backends may override this with a more efficient check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
