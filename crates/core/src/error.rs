//! Unified error types for harbor.
//!
//! Every failure the resilience layer can observe is one of these variants.
//! The transport classifies HTTP failures into network/server/client, the
//! store maps SQLite failures onto [`Error::StorageUnavailable`] where the
//! caller is expected to degrade, and the retry/breaker machinery wraps the
//! rest.

use std::time::Duration;

use tokio_rusqlite::rusqlite::{self, ErrorCode};

/// Maximum length for response bodies embedded in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Coarse classification used by retry conditions and the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection refused, DNS failure, timeout.
    Network,
    /// 5xx responses.
    Server,
    /// 4xx responses.
    Client,
    /// Rejected by an open circuit breaker.
    Circuit,
    /// Cache or queue storage failed.
    Storage,
    Other,
}

/// Unified error type for the harbor resilience layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport-level failure (connection refused, DNS, reset).
    #[error("NETWORK_ERROR: {0}")]
    Network(String),

    /// An attempt did not finish before its deadline.
    #[error("TIMEOUT: operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The upstream answered with a 5xx status.
    #[error("SERVER_ERROR: status {status}: {message}")]
    Server { status: u16, message: String },

    /// The upstream answered with a 4xx status.
    #[error("CLIENT_ERROR: status {status}: {message}")]
    Client { status: u16, message: String },

    /// Cache or queue storage could not be written or read.
    #[error("STORAGE_UNAVAILABLE: {0}")]
    StorageUnavailable(String),

    /// Call short-circuited by an open breaker; no attempt was made.
    #[error("CIRCUIT_OPEN: {dependency} is failing fast for another {}ms", .retry_in.as_millis())]
    CircuitOpen { dependency: String, retry_in: Duration },

    /// The retry budget ran out.
    #[error("RETRY_EXHAUSTED: failed after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// A queued mutation will not be replayed again and needs manual resolution.
    #[error("REPLAY_FAILED: queued request {id} failed permanently after {attempts} attempts: {reason}")]
    ReplayFailed { id: i64, attempts: u32, reason: String },

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Stored headers or payload could not be (de)serialized.
    #[error("SERIALIZATION_ERROR: {0}")]
    Serialization(String),

    /// Invalid input parameters (e.g., unsupported method).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// No queue entry with the given id.
    #[error("QUEUE_ENTRY_NOT_FOUND: {0}")]
    QueueEntryNotFound(i64),
}

impl Error {
    /// Truncate a response body to avoid logging excessive data.
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Build an error from a non-success HTTP status and its body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = Self::truncate_body(body);
        match status {
            500..=599 => Error::Server { status, message },
            _ => Error::Client { status, message },
        }
    }

    /// Classify this error. `RetryExhausted` reports the class of its last cause.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Network(_) | Error::Timeout(_) => ErrorClass::Network,
            Error::Server { .. } => ErrorClass::Server,
            Error::Client { .. } => ErrorClass::Client,
            Error::CircuitOpen { .. } => ErrorClass::Circuit,
            Error::StorageUnavailable(_) | Error::Database(_) | Error::MigrationFailed(_) => ErrorClass::Storage,
            Error::RetryExhausted { last, .. } => last.class(),
            Error::ReplayFailed { .. }
            | Error::Serialization(_)
            | Error::InvalidInput(_)
            | Error::InvalidUrl(_)
            | Error::QueueEntryNotFound(_) => ErrorClass::Other,
        }
    }

    /// Whether a fresh attempt could plausibly succeed right away.
    ///
    /// Network and server failures are transient. So are 408 and 429, which
    /// sit in the 4xx range but describe the server's state, not the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Client { status, .. } => matches!(status, 408 | 429),
            Error::RetryExhausted { .. } => false,
            other => matches!(other.class(), ErrorClass::Network | ErrorClass::Server),
        }
    }

    /// Whether callers should degrade to pass-through instead of failing.
    pub fn is_storage_unavailable(&self) -> bool {
        self.class() == ErrorClass::Storage
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Server { status, .. } | Error::Client { status, .. } => Some(*status),
            Error::RetryExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// SQLite result codes that mean "the store is unusable right now".
fn is_unavailable_code(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::DiskFull
            | ErrorCode::ReadOnly
            | ErrorCode::CannotOpen
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::OutOfMemory
            | ErrorCode::PermissionDenied
    )
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::StorageUnavailable("connection closed".into()),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::StorageUnavailable("connection closed".into()),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => Error::from(e),
            other => Error::Database(other),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) if is_unavailable_code(failure.code) => {
                Error::StorageUnavailable(err.to_string())
            }
            _ => Error::Database(tokio_rusqlite::Error::Error(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
