//! Error types for the protocol layer.
//!
//! Each crate in Tether defines its own error enum, so a `ProtocolError`
//! always means the problem is in (de)serialization, not in networking or
//! session state.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing required fields,
    /// wrong data types, or a truncated message.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message decoded but violates protocol rules, e.g. an
    /// `authResponse` with an empty payload.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
