//! The pairing and authentication protocol.
//!
//! Drives a session from `Created` to `Established`:
//!
//! 1. a peer presents a nonce → [`Pairing::attach`] puts its handle in the
//!    matching slot (the agent's first attach moves the session to
//!    `AgentAuthenticating`);
//! 2. the agent's first message is its answer to the challenge →
//!    [`Pairing::authenticate`] hands it to the credential capability and,
//!    on success, establishes the session;
//! 3. a peer drops → [`Pairing::detach`] decides whether the session
//!    survives.
//!
//! Only the agent authenticates. The frontend's sole credential is the
//! nonce, which it received once over the creation response.

use std::sync::Arc;

use tether_protocol::Role;
use tether_transport::ConnectionId;

use crate::{
    CloseReason, CredentialCapability, CredentialError, Nonce, PeerHandle,
    SessionConfig, SessionError, SessionPatch, SessionSnapshot, SessionState,
    SessionStore,
};

/// Pairing protocol bound to a store and a credential capability.
pub struct Pairing<C> {
    store: Arc<SessionStore>,
    credentials: Arc<C>,
    config: SessionConfig,
}

impl<C: CredentialCapability> Pairing<C> {
    pub fn new(store: Arc<SessionStore>, credentials: Arc<C>, config: SessionConfig) -> Self {
        Self {
            store,
            credentials,
            config,
        }
    }

    /// Attaches `handle` as `role` on the session named by `nonce`.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] — the nonce was never issued
    /// - [`SessionError::SessionClosed`] — the session is torn down
    /// - [`SessionError::PeerAlreadyAttached`] — the slot is taken
    pub fn attach(
        &self,
        nonce: &Nonce,
        role: Role,
        handle: PeerHandle,
    ) -> Result<SessionSnapshot, SessionError> {
        let conn_id = handle.id();
        let snapshot = self
            .store
            .update(nonce, SessionPatch::new().attach(role, handle))?;
        tracing::info!(%nonce, %role, %conn_id, state = ?snapshot.state, "peer attached");
        Ok(snapshot)
    }

    /// Validates the agent's `response` against the session's challenge.
    ///
    /// The session lock is released while the capability runs; the state
    /// is re-checked afterwards, so a session closed mid-validation stays
    /// closed.
    ///
    /// On rejection the failure is counted. When the count reaches
    /// `max_auth_attempts` the session closes.
    ///
    /// # Errors
    /// - [`SessionError::InvalidToken`] — the response was rejected
    /// - [`SessionError::Capability`] — the validator failed (not counted)
    /// - [`SessionError::SessionClosed`] — the session is torn down
    /// - [`SessionError::Unauthorized`] — the agent isn't attached yet, or
    ///   already authenticated
    pub async fn authenticate(
        &self,
        nonce: &Nonce,
        response: &str,
    ) -> Result<SessionSnapshot, SessionError> {
        let challenge = self.store.update_with(nonce, |session| {
            session.ensure_open()?;
            session.touch();
            match session.state() {
                SessionState::AgentAuthenticating => {
                    Ok(session.challenge().clone())
                }
                SessionState::Created => Err(SessionError::Unauthorized(
                    "agent is not attached".into(),
                )),
                SessionState::Established => Err(SessionError::Unauthorized(
                    "agent already authenticated".into(),
                )),
                SessionState::Closed => {
                    Err(SessionError::SessionClosed(nonce.clone()))
                }
            }
        })?;

        let verdict = self
            .credentials
            .validate_response(response, &challenge)
            .await;

        let max_attempts = self.config.max_auth_attempts;
        self.store.update_with(nonce, |session| {
            session.ensure_open()?;
            match verdict {
                Ok(key) => {
                    if session.state() != SessionState::AgentAuthenticating {
                        return Err(SessionError::Unauthorized(
                            "agent already authenticated".into(),
                        ));
                    }
                    tracing::info!(%nonce, %key, "agent authenticated, session established");
                    session.bind_agent_key(key);
                    session.advance(SessionState::Established)?;
                    Ok(session.snapshot())
                }
                Err(CredentialError::Rejected(reason)) => {
                    let failures = session.record_auth_failure();
                    tracing::warn!(
                        %nonce, failures, max_attempts, %reason,
                        "agent authentication rejected"
                    );
                    if failures >= max_attempts {
                        session.close(CloseReason::AuthFailed);
                    }
                    Err(SessionError::InvalidToken(reason))
                }
                Err(CredentialError::Unavailable(reason)) => {
                    tracing::warn!(%nonce, %reason, "credential validator unavailable");
                    Err(SessionError::Capability(reason))
                }
            }
        })
    }

    /// Handles a peer's connection going away.
    ///
    /// - agent → the session closes (its authentication was bound to that
    ///   connection)
    /// - frontend, no grace configured → the session closes
    /// - frontend, grace configured → the slot empties and the sweeper
    ///   closes the session if nobody re-joins in time
    ///
    /// A disconnect for a connection that no longer holds the slot (e.g. a
    /// frontend that was already replaced) changes nothing.
    ///
    /// Returns the close reason if the session was closed by this call.
    pub fn detach(
        &self,
        nonce: &Nonce,
        role: Role,
        conn_id: ConnectionId,
    ) -> Result<Option<CloseReason>, SessionError> {
        let grace = self.config.frontend_reconnect_grace;
        self.store.update_with(nonce, |session| {
            if session.is_closed() || !session.detach(role, conn_id) {
                return Ok(None);
            }
            tracing::info!(%nonce, %role, %conn_id, "peer detached");

            let reason = match role {
                Role::Agent => Some(CloseReason::AgentDisconnected),
                Role::Frontend if grace.is_zero() => {
                    Some(CloseReason::FrontendDisconnected)
                }
                Role::Frontend => None,
            };
            if let Some(reason) = reason {
                session.close(reason);
            }
            Ok(reason)
        })
    }
}

// =========================================================================
// Tests
// =========================================================================
