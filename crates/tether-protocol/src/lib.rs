//! Wire protocol for Tether.
//!
//! This crate defines what the frontend, the agent and the broker say to
//! each other:
//!
//! - **Types** ([`Envelope`], [`MessageKind`], [`Role`],
//!   [`CorrelationId`], [`SessionTicket`]) — the structures on the wire.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how they become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Session (nonce, state)
//! ```
//!
//! The protocol layer knows nothing about sessions or sockets. Payloads are
//! opaque strings: tokens, ciphertext, or application JSON that the broker
//! relays without interpreting.

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{CorrelationId, Envelope, MessageKind, Role, SessionTicket};
