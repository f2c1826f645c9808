//! Shared error taxonomy. Crate-local error enums (`PoolError` lives in
//! `persona-pool`, `SecretError` in `persona-secret`, `AuthError` in
//! `persona-auth`) compose with these where a boundary is crossed.

use thiserror::Error;

/// Errors from the persistence contract (§6: opaque key-value store).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend is unreachable or returned a transport-level failure.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A write raced with another writer and lost (used by CAS-style
    /// status transitions such as event pending -> processing).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Catch-all.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors from the Dispatcher (§4.3, §7).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No token was available when dispatch attempted to assign a worker.
    #[error("no credential token available")]
    NoToken,

    /// The assign frame failed to send to the chosen worker.
    #[error("assign send failed for worker {0}")]
    AssignFailed(String),

    /// Catch-all.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors from event-subscription matching and the Event Processor tick
/// (§4.6, §4.8). Matching itself is a pure function and cannot fail;
/// this covers the surrounding tick machinery.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum MatchError {
    /// The subscription payload could not be parsed as JSON and no
    /// fallback wrapping applies.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The persona referenced by a subscription does not exist.
    #[error("persona not found: {0}")]
    PersonaNotFound(String),
}
