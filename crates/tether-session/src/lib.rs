//! Session management, pairing, and agent authentication for Tether.
//!
//! This crate owns everything the broker knows about a rendezvous:
//!
//! 1. **Store** — every live session keyed by its nonce ([`SessionStore`])
//! 2. **Pairing** — attaching the frontend and agent, validating the agent's
//!    challenge response, tearing down on disconnect ([`Pairing`])
//! 3. **Pending requests** — the per-session table of correlated calls
//!    waiting for an answer ([`PendingRequests`])
//! 4. **Credentials** — the capability the broker delegates identity to
//!    ([`CredentialCapability`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Relay Layer (above)    ← moves messages once a session is Established
//!     ↕
//! Session Layer (this crate)  ← nonce, state machine, peer slots
//!     ↕
//! Protocol / Transport (below) ← Role, Envelope, ConnectionId
//! ```

mod credential;
mod error;
mod pairing;
mod pending;
mod session;
mod store;
#[cfg(test)]
mod test_support;

pub use credential::{ChallengeToken, CredentialCapability, CredentialError, KeyRef, TransformOp};
pub use error::SessionError;
pub use pairing::Pairing;
pub use pending::{PendingRequests, PendingResult};
pub use session::{
    CloseReason, Nonce, PeerHandle, Session, SessionConfig, SessionPatch,
    SessionSnapshot, SessionState,
};
pub use store::SessionStore;
