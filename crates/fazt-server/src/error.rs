//! HTTP error types for the Fazt server.
//!
//! Maps domain errors from `fazt-core` and `fazt-runtime` into the stable
//! JSON envelope:
//!
//! ```text
//! { "error": { "code": "<STABLE_CODE>", "message": "<human>", "details": ... } }
//! ```
//!
//! Queue overload surfaces as 503 with a `Retry-After: 1` hint wherever it
//! bubbles up from.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use fazt_core::error::{
    AliasError, ApiKeyError, AppError, BlobError, CapacityError, DeployError, DocError, KvError,
    QueueError, SessionError, TelemetryError, UserError, VfsError,
};
use fazt_runtime::RuntimeError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed body, bad query operator, missing required field.
    Validation(String),
    /// Unknown alias, path, or resource.
    NotFound(String),
    /// Missing or invalid credentials.
    Unauthorized(String),
    /// Authenticated but insufficient role.
    Forbidden(String),
    /// Token bucket empty.
    RateLimited,
    /// Write queue full or connection cap hit.
    Overloaded,
    /// Body exceeds the upload ceiling.
    PayloadTooLarge(String),
    /// Request deadline exceeded.
    Timeout,
    /// Script crash, persistence error, telemetry failure.
    Internal(String),
}

impl ApiError {
    /// The stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::Overloaded => "OVERLOADED",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Timeout => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Validation(m)
            | Self::NotFound(m)
            | Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::PayloadTooLarge(m)
            | Self::Internal(m) => m.clone(),
            Self::RateLimited => "rate limit exceeded".to_owned(),
            Self::Overloaded => "server overloaded, retry shortly".to_owned(),
            Self::Timeout => "request deadline exceeded".to_owned(),
        }
    }

    /// The JSON envelope body.
    #[must_use]
    pub fn body(&self) -> Value {
        json!({ "error": { "code": self.code(), "message": self.message() } })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status(), axum::Json(self.body())).into_response();
        if matches!(self, Self::RateLimited | Self::Overloaded) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

fn queue_error(err: &QueueError) -> ApiError {
    match err {
        QueueError::Overloaded => ApiError::Overloaded,
        QueueError::WorkerGone | QueueError::ShutDown => {
            ApiError::Internal("write queue unavailable".to_owned())
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        queue_error(&err)
    }
}

impl From<AliasError> for ApiError {
    fn from(err: AliasError) -> Self {
        match err {
            AliasError::NotFound { .. } => Self::NotFound(err.to_string()),
            AliasError::Reserved { .. }
            | AliasError::Invalid { .. }
            | AliasError::NotSwappable { .. } => Self::Validation(err.to_string()),
            AliasError::Queue(ref inner) => queue_error(inner),
            AliasError::Corrupt { .. } | AliasError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound { .. } => Self::NotFound(err.to_string()),
            AppError::Queue(ref inner) => queue_error(inner),
            AppError::Corrupt { .. } | AppError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<UserError> for ApiError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound { .. } => Self::NotFound(err.to_string()),
            UserError::OwnerExists | UserError::OwnerImmutable => {
                Self::Validation(err.to_string())
            }
            UserError::Queue(ref inner) => queue_error(inner),
            UserError::Corrupt { .. } | UserError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound | SessionError::Expired { .. } => {
                Self::Unauthorized(err.to_string())
            }
            SessionError::Queue(ref inner) => queue_error(inner),
            SessionError::Corrupt { .. } | SessionError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<ApiKeyError> for ApiError {
    fn from(err: ApiKeyError) -> Self {
        match err {
            ApiKeyError::NotFound => Self::NotFound(err.to_string()),
            ApiKeyError::Queue(ref inner) => queue_error(inner),
            ApiKeyError::Corrupt { .. } | ApiKeyError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Queue(ref inner) => queue_error(inner),
            KvError::Corrupt { .. } | KvError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<DocError> for ApiError {
    fn from(err: DocError) -> Self {
        match err {
            DocError::BadOperator { .. }
            | DocError::BadQuery { .. }
            | DocError::BadDocument { .. }
            | DocError::NotNumeric { .. } => Self::Validation(err.to_string()),
            DocError::Queue(ref inner) => queue_error(inner),
            DocError::Corrupt { .. } | DocError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::TooLarge { .. } => Self::PayloadTooLarge(err.to_string()),
            BlobError::Queue(ref inner) => queue_error(inner),
            BlobError::Corrupt { .. } | BlobError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<VfsError> for ApiError {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::Queue(ref inner) => queue_error(inner),
            VfsError::Corrupt { .. } | VfsError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::InvalidPath { .. }
            | DeployError::InvalidManifest { .. }
            | DeployError::Decode { .. } => Self::Validation(err.to_string()),
            DeployError::TooLarge { .. } => Self::PayloadTooLarge(err.to_string()),
            DeployError::App(inner) => inner.into(),
            DeployError::Queue(ref inner) => queue_error(inner),
            DeployError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<CapacityError> for ApiError {
    fn from(err: CapacityError) -> Self {
        match err {
            CapacityError::Queue(ref inner) => queue_error(inner),
            CapacityError::Corrupt { .. } | CapacityError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<TelemetryError> for ApiError {
    fn from(err: TelemetryError) -> Self {
        match err {
            TelemetryError::Queue(ref inner) => queue_error(inner),
            TelemetryError::Corrupt { .. } | TelemetryError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::BadRequest { .. } => Self::Validation(err.to_string()),
            RuntimeError::Budget
            | RuntimeError::Script { .. }
            | RuntimeError::MissingHandler { .. }
            | RuntimeError::Internal { .. } => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::Validation(String::new()).code(), "VALIDATION_FAILED");
        assert_eq!(ApiError::Overloaded.code(), "OVERLOADED");
        assert_eq!(ApiError::Timeout.code(), "TIMEOUT");
    }

    #[test]
    fn overload_maps_through_nested_errors() {
        let err: ApiError = KvError::Queue(QueueError::Overloaded).into();
        assert!(matches!(err, ApiError::Overloaded));

        let err: ApiError = DocError::Queue(QueueError::Overloaded).into();
        assert!(matches!(err, ApiError::Overloaded));
    }

    #[test]
    fn bad_operator_is_a_validation_failure() {
        let err: ApiError = DocError::BadOperator {
            op: "$regex".to_owned(),
        }
        .into();
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn envelope_shape() {
        let body = ApiError::NotFound("no such app".to_owned()).body();
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["message"], "no such app");
    }
}
