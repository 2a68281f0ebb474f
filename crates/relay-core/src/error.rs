//! Error taxonomy — §7.
//!
//! `RelayError` is the single error enum threaded through the relay-services
//! engines. `relay-api` is the only crate that knows how to turn a variant
//! into bytes on the wire — and it does so through one responder, so every
//! reject branch reaches the same indistinguishable 404 unless the variant
//! is one of the handful the spec calls out as operationally distinguishable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Token absent/invalid/scope-mismatched/binding-mismatched/expired/revoked.
    #[error("unauthorized")]
    Unauthorized,

    /// Resource absent.
    #[error("not found")]
    NotFound,

    /// A quota cap would be exceeded.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// Per-window request limit exceeded.
    #[error("rate limited")]
    RateLimited,

    /// Same offset, different bytes than what was already written.
    #[error("chunk conflict")]
    ChunkConflict,

    /// Malformed JSON/header — structural, checked before authorization.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// TURN requested but not configured — operational, distinguishable.
    #[error("turn unavailable")]
    TurnUnavailable,

    /// Approval attempted before both SAS confirmations are true.
    #[error("sas required")]
    SasRequired,

    /// Storage fault or invariant breach. Never leaks details to the client.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// The wire error code used in `{"error": "<code>"}` bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Unauthorized | RelayError::NotFound | RelayError::QuotaExceeded => {
                "not_found"
            }
            RelayError::RateLimited => "rate_limited",
            RelayError::ChunkConflict => "chunk_conflict",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::TurnUnavailable => "turn_unavailable",
            RelayError::SasRequired => "sas_required",
            RelayError::Internal(_) => "not_found", // never leaked as distinct
        }
    }
}
