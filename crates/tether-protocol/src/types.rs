//! Core protocol types for Tether's wire format.
//!
//! Every message between a peer and the broker is an [`Envelope`]:
//!
//! ```text
//! { "correlationId": "abc", "kind": "encrypt", "payload": "..." }
//! ```
//!
//! `correlationId` is optional, `kind` defaults to `message` and `payload`
//! defaults to the empty string, so an agent can answer a request with as
//! little as `{"correlationId":"abc","payload":"..."}`.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier linking a relayed request to its eventual response.
///
/// Chosen by the caller (or assigned by the broker when the caller leaves
/// it out). Only unique within one session.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wraps a caller-supplied id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of a session a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// The unauthenticated side (e.g. a browser). Knowing the nonce is its
    /// only credential.
    Frontend,
    /// The side that must prove possession of a credential (e.g. a wallet).
    Agent,
}

impl Role {
    /// The other side of the session.
    pub fn counterpart(self) -> Role {
        match self {
            Role::Frontend => Role::Agent,
            Role::Agent => Role::Frontend,
        }
    }

    /// The path segment used for this role in join addresses.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Frontend => "frontend",
            Role::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// What an envelope is for.
///
/// Serialized in camelCase (`"authResponse"`, `"encrypt"`, ...). An
/// envelope without a `kind` is a plain [`MessageKind::Message`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Broker → agent: the challenge to answer.
    AuthRequest,
    /// Agent → broker: the answer to the challenge.
    AuthResponse,
    /// Broker → both peers: the agent proved its credential.
    Authenticated,
    /// Frontend → agent: payload is encrypted by the credential
    /// capability before delivery; correlated.
    Encrypt,
    /// Frontend → agent: payload is decrypted by the credential
    /// capability before delivery; correlated.
    Decrypt,
    /// Frontend → agent: correlated request relayed without a transform.
    Request,
    /// Counterpart reply to a correlated request, or the resolution the
    /// broker hands back to the original caller.
    Response,
    /// Plain relay traffic.
    #[default]
    Message,
    /// Something went wrong; `code` says what.
    Error,
    /// Either peer: close the session. Broker: the session was closed.
    Close,
}

impl MessageKind {
    /// Whether this kind opens a correlated request that waits for a
    /// response from the counterpart.
    pub fn is_correlated_request(self) -> bool {
        matches!(
            self,
            MessageKind::Encrypt | MessageKind::Decrypt | MessageKind::Request
        )
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The top-level message wrapper. Every broker-level message on the wire is
/// an `Envelope`; pass-through relay forwards the original bytes untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Links a request to its response. Absent on uncorrelated traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// What this envelope is for.
    #[serde(default)]
    pub kind: MessageKind,

    /// Opaque content: a token, ciphertext, or application data.
    #[serde(default)]
    pub payload: String,

    /// HTTP-style status on `error` envelopes (404 unknown session, 410
    /// closed, 504 timeout, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl Envelope {
    /// An uncorrelated envelope.
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            kind,
            payload: payload.into(),
            code: None,
        }
    }

    /// A correlated request (`encrypt`, `decrypt`, `request`).
    pub fn request(kind: MessageKind, id: CorrelationId, payload: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(id),
            ..Self::new(kind, payload)
        }
    }

    /// The response to the request tagged `id`.
    pub fn response(id: CorrelationId, payload: impl Into<String>) -> Self {
        Self::request(MessageKind::Response, id, payload)
    }

    /// An error, optionally tied to the request that caused it.
    pub fn error(code: u16, message: impl Into<String>, id: Option<CorrelationId>) -> Self {
        Self {
            correlation_id: id,
            kind: MessageKind::Error,
            payload: message.into(),
            code: Some(code),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionTicket
// ---------------------------------------------------------------------------

/// What the creator of a session gets back: the nonce, the challenge the
/// agent will have to answer, and where each peer should connect.
///
/// Sent once over the rendezvous connection, then never again. Anyone who
/// sees a ticket can join the session as the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    /// The session's nonce (join secret).
    pub nonce: String,
    /// The challenge token issued for this session.
    pub challenge: String,
    /// WebSocket address the agent joins.
    pub agent_join_address: String,
    /// WebSocket address the frontend joins.
    pub frontend_join_address: String,
}

// =========================================================================
// Tests
// =========================================================================
