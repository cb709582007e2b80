//! Error types for the session layer.

use tether_protocol::{CorrelationId, Role};

use crate::{Nonce, SessionState};

/// Errors that can occur while pairing, authenticating, or correlating
/// within a session.
///
/// These are also what a pending caller observes when its request fails,
/// so the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session was ever issued for this nonce (or it has been purged).
    #[error("session not found: {0}")]
    NotFound(Nonce),

    /// The agent's authentication response failed validation.
    #[error("invalid authentication token: {0}")]
    InvalidToken(String),

    /// The credential capability was unreachable or failed.
    #[error("credential capability failed: {0}")]
    Capability(String),

    /// The session has been torn down.
    #[error("session {0} is closed")]
    SessionClosed(Nonce),

    /// No response arrived for a correlated request in time.
    #[error("request {0} timed out")]
    Timeout(CorrelationId),

    /// A pending request was released because its session went away.
    #[error("request {0} was cancelled")]
    Cancelled(CorrelationId),

    /// The peer tried something its session isn't ready for, e.g.
    /// relaying before the agent authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Session state only moves forward.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// A second connection tried to take a slot that is in use.
    #[error("a {0} is already attached to this session")]
    PeerAlreadyAttached(Role),

    /// The caller reused an id that is still pending in this session.
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(CorrelationId),
}

impl SessionError {
    /// HTTP-style status code used on `error` envelopes.
    pub fn code(&self) -> u16 {
        match self {
            SessionError::NotFound(_) => 404,
            SessionError::InvalidToken(_) => 401,
            SessionError::Capability(_) => 502,
            SessionError::SessionClosed(_) => 410,
            SessionError::Timeout(_) => 504,
            SessionError::Cancelled(_) => 499,
            SessionError::Unauthorized(_) => 403,
            SessionError::InvalidTransition { .. }
            | SessionError::PeerAlreadyAttached(_)
            | SessionError::DuplicateCorrelationId(_) => 409,
        }
    }
}
