//! Error taxonomy used across the bridge, with HTTP status mapping for the inbox server.

use http::StatusCode;

/// Errors returned by bridge components.
///
/// Every variant carries a stable [`Error::code`] string for log aggregation, and maps to an
/// HTTP status code when it needs to be externalized from the inbox server (§7).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Required configuration was missing or invalid; the process should abort startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Transient or constraint-violating database failure.
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    /// Failed to acquire a pooled database connection.
    #[error("database pool error: {0}")]
    DatabasePool(#[from] diesel::r2d2::PoolError),
    /// HTTP signature could not be verified. Never retried; caller evicts the cached key.
    #[error("signature verification failed")]
    SignatureInvalid,
    /// Incoming request's `Date` header is outside the allowed clock skew.
    #[error("clock skew exceeds allowed window")]
    ClockSkew,
    /// `Digest` header did not match the request body.
    #[error("body digest mismatch")]
    DigestInvalid,
    /// Outbound or inbound federation request failed (5xx / network error).
    #[error("federation request failed: {0}")]
    Federation(String),
    /// Remote host responded 429; caller should honor `Retry-After`.
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited {
        /// Seconds to wait, if the remote host specified one.
        retry_after_secs: Option<u64>,
    },
    /// Malformed or semantically invalid input; never retried.
    #[error("validation error: {0}")]
    Validation(String),
    /// Referenced object does not exist locally or remotely.
    #[error("not found")]
    NotFound,
    /// Caller is not authorized to perform the requested operation.
    #[error("not authorized")]
    Authorization,
    /// Ingress/egress target is blocked by policy (§4.8). Dropped silently at ingress.
    #[error("blocked instance or user")]
    BlockedInstance,
    /// The per-host circuit breaker is open.
    #[error("circuit open for host, resets at {opens_until_unix_secs}")]
    CircuitOpen {
        /// Unix timestamp (seconds) at which the circuit will move to half-open.
        opens_until_unix_secs: i64,
    },
    /// Fetch budget for a single inbound request was exceeded (recursive object guard).
    #[error("request limit reached while dereferencing object")]
    RequestLimit,
    /// Remote object was reported gone (HTTP 410 / AP `Tombstone`).
    #[error("object was deleted")]
    ObjectDeleted,
    /// Webfinger discovery failed to resolve a handle.
    #[error("failed to resolve actor via webfinger")]
    WebfingerResolveFailed,
    /// Media did not satisfy the configured MIME allow-list.
    #[error("media type not allowed: {0}")]
    MediaTypeNotAllowed(String),
    /// Fallback for unexpected failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Stable code string for log aggregation and bot-visible status messages (§7).
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Database(_) | Error::DatabasePool(_) => "database",
            Error::SignatureInvalid | Error::ClockSkew | Error::DigestInvalid => "signature",
            Error::Federation(_) => "federation",
            Error::RateLimited { .. } => "rate_limit",
            Error::Validation(_) => "validation",
            Error::NotFound => "not_found",
            Error::Authorization => "authorization",
            Error::BlockedInstance => "blocked_instance",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::RequestLimit => "request_limit",
            Error::ObjectDeleted => "object_deleted",
            Error::WebfingerResolveFailed => "webfinger_resolve_failed",
            Error::MediaTypeNotAllowed(_) => "media_type_not_allowed",
            Error::Other(_) => "internal",
        }
    }

    /// HTTP status this error should be externalized as, per §7's taxonomy table.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Configuration(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(_) | Error::DatabasePool(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::SignatureInvalid | Error::ClockSkew | Error::DigestInvalid => {
                StatusCode::UNAUTHORIZED
            }
            Error::Federation(_) => StatusCode::BAD_GATEWAY,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Validation(_) | Error::MediaTypeNotAllowed(_) => StatusCode::BAD_REQUEST,
            Error::NotFound | Error::WebfingerResolveFailed => StatusCode::NOT_FOUND,
            Error::Authorization => StatusCode::FORBIDDEN,
            Error::BlockedInstance => StatusCode::FORBIDDEN,
            Error::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::RequestLimit => StatusCode::TOO_MANY_REQUESTS,
            Error::ObjectDeleted => StatusCode::GONE,
        }
    }

    /// True if retrying this operation might succeed later (§7 propagation policy).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Federation(_) | Error::Database(_) | Error::DatabasePool(_)
        )
    }

    pub(crate) fn other<T: Into<anyhow::Error>>(error: T) -> Self {
        Error::Other(error.into())
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
