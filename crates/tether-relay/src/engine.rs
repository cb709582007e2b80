//! Relay & correlation engine: moves traffic between established peers.
//!
//! Two paths, chosen per frame:
//!
//! - **Pass-through** — anything that isn't a correlated request (or a
//!   reply to one) is forwarded to the counterpart byte-for-byte. If the
//!   counterpart isn't attached the frame is dropped and the sender is not
//!   told.
//! - **Correlated request** — `encrypt`, `decrypt` and `request` envelopes
//!   get a correlation id (the caller's, or a fresh one), have their payload
//!   transformed by the credential capability, are recorded in the session's
//!   pending table, and are forwarded. The counterpart's envelope carrying
//!   the same id resolves the waiting caller.
//!
//! Frames from one connection are relayed in the order they are handed in.
//! Only waiting for a response happens off the connection's path (see
//! [`PendingResponse`]), so a slow answer never holds up later frames.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tether_protocol::{Codec, CorrelationId, Envelope, JsonCodec, MessageKind, Role};
use tether_session::{
    CredentialCapability, Nonce, Session, SessionError, SessionState,
    SessionStore, TransformOp,
};
use tokio::sync::oneshot;

use crate::RelayError;

/// What happened to a frame handed to the broker.
#[derive(Debug)]
pub enum Dispatch {
    /// The agent's challenge response was accepted; the session is now
    /// `Established`.
    Authenticated,
    /// Delivered to the counterpart's outbound queue.
    Forwarded,
    /// The counterpart isn't attached; the frame was discarded.
    Dropped,
    /// The frame answered a pending request.
    Resolved(CorrelationId),
    /// A correlated request was forwarded; the caller should await it.
    Awaiting(PendingResponse),
    /// The session was closed at the sender's request.
    Closed,
}

/// Relays frames for established sessions.
pub struct RelayEngine<C> {
    store: Arc<SessionStore>,
    credentials: Arc<C>,
    codec: JsonCodec,
    request_timeout: Duration,
}

impl<C: CredentialCapability> RelayEngine<C> {
    pub fn new(store: Arc<SessionStore>, credentials: Arc<C>, request_timeout: Duration) -> Self {
        Self {
            store,
            credentials,
            codec: JsonCodec,
            request_timeout,
        }
    }

    /// Relays one frame from `from`.
    ///
    /// `envelope` is the frame decoded, if it decodes at all. Frames that
    /// aren't envelopes are still relayed: pass-through doesn't care what
    /// the peers say to each other.
    pub async fn relay(
        &self,
        nonce: &Nonce,
        from: Role,
        bytes: &[u8],
        envelope: Option<Envelope>,
    ) -> Result<Dispatch, RelayError> {
        match envelope {
            Some(envelope) if envelope.kind.is_correlated_request() => {
                let pending = self.submit(nonce, from, envelope).await?;
                Ok(Dispatch::Awaiting(pending))
            }
            Some(Envelope {
                correlation_id: Some(id),
                kind: MessageKind::Response | MessageKind::Message,
                payload,
                ..
            }) => {
                let resolved = self.store.update_with(nonce, |session| {
                    ensure_established(session)?;
                    session.touch();
                    Ok(session.pending_mut().resolve(&id, from, payload))
                })?;
                if resolved {
                    tracing::debug!(%nonce, %id, "pending request resolved");
                    return Ok(Dispatch::Resolved(id));
                }
                // Nothing this peer may answer is pending under the id: an
                // unsolicited push.
                self.forward(nonce, from, bytes)
            }
            _ => self.forward(nonce, from, bytes),
        }
    }

    /// Opens a correlated request from `from` to its counterpart.
    ///
    /// The returned [`PendingResponse`] is already registered and the
    /// request already forwarded when this returns, so requests reach the
    /// counterpart in the order they were submitted.
    ///
    /// # Errors
    /// - [`SessionError::Unauthorized`] — the session isn't established
    /// - [`SessionError::DuplicateCorrelationId`] — `id` is already pending
    /// - [`SessionError::Capability`] — the transform failed; nothing was
    ///   registered or forwarded
    pub async fn submit(
        &self,
        nonce: &Nonce,
        from: Role,
        envelope: Envelope,
    ) -> Result<PendingResponse, RelayError> {
        let Envelope {
            correlation_id,
            kind,
            payload,
            ..
        } = envelope;
        let id = correlation_id.unwrap_or_else(generate_correlation_id);

        let key = self.store.update_with(nonce, |session| {
            ensure_established(session)?;
            session.touch();
            if session.pending().contains(&id) {
                return Err(SessionError::DuplicateCorrelationId(id.clone()));
            }
            session.agent_key().cloned().ok_or_else(|| {
                SessionError::Unauthorized("no key bound to session".into())
            })
        })?;

        let payload = match transform_op(kind) {
            Some(op) => self
                .credentials
                .transform(op, &payload, &key)
                .await
                .map_err(|e| {
                    tracing::warn!(%nonce, %id, error = %e, "transform failed");
                    SessionError::Capability(e.to_string())
                })?,
            None => payload,
        };

        let forwarded = self
            .codec
            .encode(&Envelope::request(kind, id.clone(), payload))?;
        let to = from.counterpart();

        let rx = self.store.update_with(nonce, |session| {
            // The transform was a suspension point; the session may have
            // closed, or another request claimed the id, in the meantime.
            ensure_established(session)?;
            let rx = session.pending_mut().insert(id.clone(), from)?;
            if !session.send_to(to, forwarded) {
                tracing::debug!(%nonce, %id, %to, "counterpart absent, request will time out");
            }
            Ok(rx)
        })?;

        tracing::debug!(%nonce, %id, ?kind, %from, "correlated request forwarded");
        Ok(PendingResponse {
            id,
            nonce: nonce.clone(),
            rx,
            timeout: self.request_timeout,
            store: Arc::clone(&self.store),
        })
    }

    fn forward(&self, nonce: &Nonce, from: Role, bytes: &[u8]) -> Result<Dispatch, RelayError> {
        let to = from.counterpart();
        let delivered = self.store.update_with(nonce, |session| {
            ensure_established(session)?;
            session.touch();
            Ok(session.send_to(to, bytes.to_vec()))
        })?;

        if delivered {
            tracing::debug!(%nonce, %from, %to, len = bytes.len(), "frame forwarded");
            Ok(Dispatch::Forwarded)
        } else {
            tracing::debug!(%nonce, %from, %to, "counterpart absent, frame dropped");
            Ok(Dispatch::Dropped)
        }
    }
}

/// A correlated request waiting for the counterpart's answer.
///
/// Resolves exactly once: with the response payload, with
/// [`SessionError::Timeout`] (after which the entry is gone from the
/// pending table), or with [`SessionError::Cancelled`] if the session
/// closes first.
#[derive(Debug)]
pub struct PendingResponse {
    id: CorrelationId,
    nonce: Nonce,
    rx: oneshot::Receiver<Result<String, SessionError>>,
    timeout: Duration,
    store: Arc<SessionStore>,
}

impl PendingResponse {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Waits for the response, up to the request timeout.
    pub async fn wait(self) -> Result<String, SessionError> {
        let Self {
            id,
            nonce,
            rx,
            timeout,
            store,
        } = self;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // The sender went away without a value: the session was
            // removed outright.
            Ok(Err(_)) => Err(SessionError::Cancelled(id)),
            Err(_) => {
                let _ = store.update_with(&nonce, |session| {
                    Ok(session.pending_mut().abandon(&id))
                });
                tracing::debug!(%nonce, %id, ?timeout, "pending request timed out");
                Err(SessionError::Timeout(id))
            }
        }
    }
}

fn ensure_established(session: &Session) -> Result<(), SessionError> {
    session.ensure_open()?;
    if session.state() != SessionState::Established {
        return Err(SessionError::Unauthorized(
            "session is not established".into(),
        ));
    }
    Ok(())
}

fn transform_op(kind: MessageKind) -> Option<TransformOp> {
    match kind {
        MessageKind::Encrypt => Some(TransformOp::Encrypt),
        MessageKind::Decrypt => Some(TransformOp::Decrypt),
        _ => None,
    }
}

fn generate_correlation_id() -> CorrelationId {
    let bytes: [u8; 8] = rand::rng().random();
    CorrelationId::new(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_op_only_for_crypto_kinds() {
        assert_eq!(transform_op(MessageKind::Encrypt), Some(TransformOp::Encrypt));
        assert_eq!(transform_op(MessageKind::Decrypt), Some(TransformOp::Decrypt));
        assert_eq!(transform_op(MessageKind::Request), None);
        assert_eq!(transform_op(MessageKind::Message), None);
    }

    #[test]
    fn test_generated_correlation_ids_are_hex_and_distinct() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
