//! Shared error taxonomy.
//!
//! Every component defines its own `thiserror` error enum at its boundary,
//! but the dispatcher (retry vs. dead-letter), the HA coordinator (idempotent
//! retry) and the control API (HTTP status mapping) all need one shared
//! notion of *what kind* of failure they are looking at. `ErrorKind` is that
//! shared vocabulary; component errors implement `Classify` to report which
//! kind they are without duplicating match arms everywhere.

use axum::http::StatusCode;

/// Recovery category for a failure, independent of which component raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; reject, no retry, no state mutation.
    Validation,
    /// External dependency hiccup; retry with backoff.
    TransientExternal,
    /// External dependency says this will never work; fail permanently.
    PermanentExternal,
    /// Optimistic-concurrency conflict; retry with a fresh read.
    Conflict,
    /// Blocked by a policy budget (e.g. cost); signal upstream, don't retry blindly.
    Quota,
    /// Invariant violation; operator intervention required.
    FatalInternal,
}

impl ErrorKind {
    /// Whether the surrounding operation should be retried automatically.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientExternal | ErrorKind::Conflict)
    }

    /// HTTP status a control-API handler should map this kind to.
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::TransientExternal => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::PermanentExternal => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Quota => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::FatalInternal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Implemented by every component error enum so callers can classify a
/// failure without matching on the concrete error type.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
