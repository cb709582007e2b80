//! Relay, correlation, and the broker facade for Tether.
//!
//! Once a session is `Established`, this crate moves frames between its two
//! peers:
//!
//! 1. **Relay engine** — pass-through forwarding plus correlated requests
//!    with a pending-response table ([`RelayEngine`], [`PendingResponse`])
//! 2. **Broker** — the calls a transport adapter makes: create a session,
//!    connect, message, disconnect, send ([`Broker`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Server / adapter (above)  ← sockets, routes, outbound queues
//!     ↕
//! Relay Layer (this crate)  ← Broker, RelayEngine
//!     ↕
//! Session Layer (below)     ← SessionStore, Pairing, CredentialCapability
//! ```

mod broker;
mod engine;
mod error;

pub use broker::{Attachment, Broker, ConnectionHandle, SweepReport};
pub use engine::{Dispatch, PendingResponse, RelayEngine};
pub use error::RelayError;
