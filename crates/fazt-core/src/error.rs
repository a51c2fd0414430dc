//! Error types for `fazt-core`.
//!
//! One enum per subsystem. Each error variant carries enough context to
//! diagnose the problem without a debugger. Serialization failures of
//! persisted records surface as `Corrupt` variants — they indicate a bug or
//! on-disk damage, never user input.

use fazt_storage::StorageError;

/// Errors from the write queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is full — the caller should back off and retry.
    #[error("write queue is full")]
    Overloaded,

    /// The worker stopped before acknowledging the job (shutdown race).
    #[error("write queue worker is gone")]
    WorkerGone,

    /// The queue has been shut down and accepts no further jobs.
    #[error("write queue is shut down")]
    ShutDown,
}

/// Errors from the capacity probe and tunables store.
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    /// Persisted tunables could not be decoded.
    #[error("corrupt capacity record: {reason}")]
    Corrupt { reason: String },

    /// The underlying storage backend returned an error.
    #[error("capacity storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the persist job.
    #[error("capacity queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from the virtual filesystem.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    /// Stored file metadata could not be decoded.
    #[error("corrupt file metadata for '{path}': {reason}")]
    Corrupt { path: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("vfs storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("vfs queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from alias routing operations.
#[derive(Debug, thiserror::Error)]
pub enum AliasError {
    /// The requested alias was not found.
    #[error("alias not found: {subdomain}")]
    NotFound { subdomain: String },

    /// The subdomain is reserved and cannot be claimed.
    #[error("subdomain is reserved: {subdomain}")]
    Reserved { subdomain: String },

    /// The alias record is invalid (bad weights, missing target).
    #[error("invalid alias: {reason}")]
    Invalid { reason: String },

    /// Swap requires two proxy aliases.
    #[error("cannot swap '{subdomain}': not a proxy alias")]
    NotSwappable { subdomain: String },

    /// A stored alias record could not be decoded.
    #[error("corrupt alias record for '{subdomain}': {reason}")]
    Corrupt { subdomain: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("alias storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("alias queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from the app store.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The requested app was not found.
    #[error("app not found: {id}")]
    NotFound { id: String },

    /// A stored app record could not be decoded.
    #[error("corrupt app record for '{id}': {reason}")]
    Corrupt { id: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("app storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("app queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from the key-value capability.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// A stored cell could not be decoded.
    #[error("corrupt kv cell for '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("kv storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("kv queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from the document capability.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    /// A query used an operator the store does not implement.
    #[error("unknown query operator: {op}")]
    BadOperator { op: String },

    /// The query shape is invalid (non-object, bad operand).
    #[error("invalid query: {reason}")]
    BadQuery { reason: String },

    /// The document or mutation shape is invalid.
    #[error("invalid document: {reason}")]
    BadDocument { reason: String },

    /// `$inc` targeted a field holding a non-numeric value.
    #[error("field '{field}' is not numeric")]
    NotNumeric { field: String },

    /// A stored document could not be decoded.
    #[error("corrupt document at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("document storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("document queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from the blob capability.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The blob exceeds the configured upload ceiling.
    #[error("blob of {size} bytes exceeds ceiling of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    /// Stored blob metadata could not be decoded.
    #[error("corrupt blob metadata for '{path}': {reason}")]
    Corrupt { path: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("blob storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("blob queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from the user store.
#[derive(Debug, thiserror::Error)]
pub enum UserError {
    /// The requested user was not found.
    #[error("user not found: {id}")]
    NotFound { id: String },

    /// Only one owner may exist.
    #[error("an owner already exists")]
    OwnerExists,

    /// The owner's role cannot be taken away.
    #[error("the owner role is preserved across role edits")]
    OwnerImmutable,

    /// A stored user record could not be decoded.
    #[error("corrupt user record for '{id}': {reason}")]
    Corrupt { id: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("user storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("user queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session token was not found.
    #[error("session not found")]
    NotFound,

    /// The session has expired.
    #[error("session expired at {expired_at}")]
    Expired { expired_at: String },

    /// A stored session record could not be decoded.
    #[error("corrupt session record: {reason}")]
    Corrupt { reason: String },

    /// The underlying storage backend returned an error.
    #[error("session storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("session queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from API key operations.
#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    /// The key was not found (or has been revoked).
    #[error("api key not found")]
    NotFound,

    /// A stored key record could not be decoded.
    #[error("corrupt api key record: {reason}")]
    Corrupt { reason: String },

    /// The underlying storage backend returned an error.
    #[error("api key storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("api key queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from deploy operations.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// A file path escaped the app root or contained bad segments.
    #[error("invalid deploy path: {path}")]
    InvalidPath { path: String },

    /// The manifest is missing or malformed.
    #[error("invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// File content was not valid base64.
    #[error("undecodable content for '{path}'")]
    Decode { path: String },

    /// A file exceeds the upload ceiling.
    #[error("file '{path}' of {size} bytes exceeds ceiling of {max} bytes")]
    TooLarge { path: String, size: u64, max: u64 },

    /// The target app does not exist.
    #[error(transparent)]
    App(#[from] AppError),

    /// The underlying storage backend returned an error.
    #[error("deploy storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("deploy queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from the telemetry pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A stored log entry could not be decoded.
    #[error("corrupt log entry at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("telemetry storage error: {0}")]
    Storage(#[from] StorageError),

    /// The write queue rejected or lost the job.
    #[error("telemetry queue error: {0}")]
    Queue(#[from] QueueError),
}
