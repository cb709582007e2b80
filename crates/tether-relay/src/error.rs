//! Error types for the relay layer.

use tether_protocol::ProtocolError;
use tether_session::SessionError;

/// Errors surfaced by [`Broker`](crate::Broker) and
/// [`RelayEngine`](crate::RelayEngine).
///
/// Almost everything the relay can report is a session-level condition;
/// the only thing it adds is a frame that could not be decoded where an
/// envelope was required.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl RelayError {
    /// Status code carried on the `error` envelope sent back to a peer.
    pub fn code(&self) -> u16 {
        match self {
            RelayError::Session(e) => e.code(),
            RelayError::Protocol(_) => 400,
        }
    }
}
