//! Error taxonomy shared by every subsystem.
//!
//! Handlers never throw; they return a [`RelayError`] which the caller
//! turns into a wire `ERROR` frame via [`RelayError::code`]. Connection-fatal
//! conditions (oversize frame, pre-auth rate overflow) bypass this taxonomy
//! entirely and close the socket directly from `main.rs`'s read loop.

use thiserror::Error;

/// One categorised failure kind per `spec.md` §7. Several kinds cover more
/// than one `spec.md` §6 wire code depending on what specifically failed
/// (e.g. `NotFound` covers both `AGENT_NOT_FOUND` and `CHANNEL_NOT_FOUND`),
/// so those variants carry the exact code alongside the human-readable
/// message rather than deriving one default code per kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("rate limited: {0}")]
    RateExceeded(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("not authorized: {0}")]
    AuthorizationFailure(String, &'static str),

    #[error("not found: {0}")]
    NotFound(String, &'static str),

    #[error("state conflict: {0}")]
    StateConflict(String, &'static str),

    #[error("invariant violated: {0}")]
    InvariantViolation(String, &'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl RelayError {
    /// Stable wire code, matching the error-code vocabulary of `spec.md` §6.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::ProtocolViolation(_) => "INVALID_MSG",
            RelayError::RateExceeded(_) => "RATE_LIMITED",
            RelayError::AuthFailure(_) => "INVALID_SIGNATURE",
            RelayError::AuthorizationFailure(_, code) => code,
            RelayError::NotFound(_, code) => code,
            RelayError::StateConflict(_, code) => code,
            RelayError::InvariantViolation(_, code) => code,
            RelayError::ResourceExhausted(_) => "INSUFFICIENT_REPUTATION",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
