//! Error types for the runtime shim.

/// Errors from handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The script exceeded its wall-clock or memory budget and was
    /// terminated.
    #[error("script exceeded its execution budget")]
    Budget,

    /// The script threw or failed to parse.
    #[error("script error: {message}")]
    Script { message: String },

    /// The app declares a handler but the file is missing from its tree.
    #[error("handler script not found: {path}")]
    MissingHandler { path: String },

    /// The request body could not be parsed into the script input shape.
    #[error("bad request body: {reason}")]
    BadRequest { reason: String },

    /// VM construction or host plumbing failed.
    #[error("runtime internal error: {reason}")]
    Internal { reason: String },
}
