//! The broker facade: the four calls a transport adapter makes, plus
//! session creation and housekeeping.
//!
//! An adapter (the WebSocket server in the `tether` crate, or a test)
//! drives one [`Broker`] like this:
//!
//! ```text
//! create_session()            → SessionTicket handed to the creator
//! on_connect(nonce, role, id) → Attachment { handle, outbound queue }
//! on_message(&handle, bytes)  → Dispatch (await Awaiting off-path)
//! on_disconnect(&handle)
//! ```
//!
//! Everything a peer should receive, including relayed frames, goes through
//! its outbound queue. The adapter just drains the queue into the socket;
//! when the queue closes, the broker has released the peer and the socket
//! should close too.

use std::sync::Arc;
use std::time::Duration;

use tether_protocol::{Codec, CorrelationId, Envelope, JsonCodec, MessageKind, Role, SessionTicket};
use tether_session::{
    CloseReason, CredentialCapability, Nonce, Pairing, PeerHandle,
    SessionConfig, SessionError, SessionSnapshot, SessionState, SessionStore,
};
use tether_transport::ConnectionId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Dispatch, RelayEngine, RelayError};

/// Identifies one attached connection: which session, which slot, which
/// socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: ConnectionId,
    nonce: Nonce,
    role: Role,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

/// A successful join: the handle to pass back on every later call, and the
/// queue of frames to write to the peer.
#[derive(Debug)]
pub struct Attachment {
    pub handle: ConnectionHandle,
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions closed for idling or an expired frontend grace.
    pub closed: Vec<(Nonce, CloseReason)>,
    /// Closed tombstones removed from the store.
    pub purged: usize,
}

/// Shared broker state. One per process; wrap it in an `Arc` and hand a
/// clone to every connection task.
pub struct Broker<C> {
    store: Arc<SessionStore>,
    credentials: Arc<C>,
    pairing: Pairing<C>,
    engine: RelayEngine<C>,
    config: SessionConfig,
    public_url: String,
    codec: JsonCodec,
}

impl<C: CredentialCapability> Broker<C> {
    /// Creates a broker whose join addresses are rooted at `public_url`
    /// (e.g. `ws://localhost:9000`).
    pub fn new(credentials: C, config: SessionConfig, public_url: impl Into<String>) -> Self {
        let store = Arc::new(SessionStore::new());
        let credentials = Arc::new(credentials);
        let public_url = public_url.into().trim_end_matches('/').to_string();

        Self {
            pairing: Pairing::new(
                Arc::clone(&store),
                Arc::clone(&credentials),
                config.clone(),
            ),
            engine: RelayEngine::new(
                Arc::clone(&store),
                Arc::clone(&credentials),
                config.request_timeout,
            ),
            store,
            credentials,
            config,
            public_url,
            codec: JsonCodec,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// The underlying store, for inspection.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// A snapshot of one session.
    pub fn session(&self, nonce: &Nonce) -> Result<SessionSnapshot, SessionError> {
        self.store.get(nonce)
    }

    /// Where a peer playing `role` joins the session named by `nonce`.
    pub fn join_address(&self, role: Role, nonce: &Nonce) -> String {
        format!("{}/{}/{}", self.public_url, role.as_str(), nonce.as_str())
    }

    /// Creates a session and returns its ticket.
    ///
    /// The challenge is bound to the agent's join address, which is the
    /// address the agent answers on.
    ///
    /// # Errors
    /// [`SessionError::Capability`] if the challenge can't be issued. No
    /// session exists in that case.
    pub async fn create_session(&self) -> Result<SessionTicket, RelayError> {
        let (nonce, challenge) = self
            .store
            .create(self.credentials.as_ref(), |nonce| {
                self.join_address(Role::Agent, nonce)
            })
            .await?;

        Ok(SessionTicket {
            agent_join_address: self.join_address(Role::Agent, &nonce),
            frontend_join_address: self.join_address(Role::Frontend, &nonce),
            nonce: nonce.as_str().to_string(),
            challenge: challenge.as_str().to_string(),
        })
    }

    /// Attaches connection `conn_id` to the session as `role`.
    ///
    /// An agent is sent its `authRequest` right away. A frontend that
    /// arrives after the agent authenticated is sent `authenticated`.
    ///
    /// # Errors
    /// `NotFound`, `SessionClosed`, or `PeerAlreadyAttached`.
    pub fn on_connect(
        &self,
        nonce: Nonce,
        role: Role,
        conn_id: ConnectionId,
    ) -> Result<Attachment, RelayError> {
        let (peer, outbound) = PeerHandle::new(conn_id);
        let snapshot = self.pairing.attach(&nonce, role, peer)?;

        // A frontend joining an established session was already told so by
        // the attach itself.
        if role == Role::Agent {
            let challenge = Envelope::new(MessageKind::AuthRequest, snapshot.challenge.as_str());
            let bytes = self.codec.encode(&challenge)?;
            self.store
                .update_with(&nonce, |session| Ok(session.send_to(role, bytes)))?;
        }

        Ok(Attachment {
            handle: ConnectionHandle {
                id: conn_id,
                nonce,
                role,
            },
            outbound,
        })
    }

    /// Handles one frame from `handle`'s peer.
    ///
    /// Before the session is established the only frame accepted is the
    /// agent's `authResponse`. After that, frames are relayed; see
    /// [`RelayEngine::relay`]. A `close` envelope from either peer closes
    /// the session at any point.
    ///
    /// A returned [`Dispatch::Awaiting`] must be awaited off the
    /// connection's path, so the next frame isn't held up behind it.
    ///
    /// # Errors
    /// Session errors for the frame's sender (their `code()` goes on the
    /// `error` envelope), or [`RelayError::Protocol`] for an agent frame
    /// that should have been an envelope and wasn't.
    pub async fn on_message(
        &self,
        handle: &ConnectionHandle,
        bytes: &[u8],
    ) -> Result<Dispatch, RelayError> {
        let nonce = &handle.nonce;
        let state = self.store.update_with(nonce, |session| {
            session.ensure_open()?;
            match session.peer(handle.role) {
                Some(peer) if peer.id() == handle.id => Ok(session.state()),
                _ => Err(SessionError::Unauthorized(
                    "connection is not attached to this session".into(),
                )),
            }
        })?;

        let envelope = self.codec.decode::<Envelope>(bytes);

        if matches!(&envelope, Ok(e) if e.kind == MessageKind::Close) {
            tracing::info!(%nonce, role = %handle.role, "close requested by peer");
            self.store.close(nonce, CloseReason::Requested)?;
            return Ok(Dispatch::Closed);
        }

        match (state, handle.role) {
            (SessionState::Established, from) => {
                self.engine.relay(nonce, from, bytes, envelope.ok()).await
            }
            (_, Role::Agent) => {
                let envelope = envelope?;
                if envelope.kind != MessageKind::AuthResponse {
                    return Err(SessionError::Unauthorized(
                        "expected authResponse".into(),
                    )
                    .into());
                }
                self.pairing.authenticate(nonce, &envelope.payload).await?;
                Ok(Dispatch::Authenticated)
            }
            (_, Role::Frontend) => Err(SessionError::Unauthorized(
                "session is not established".into(),
            )
            .into()),
        }
    }

    /// Handles `handle`'s connection going away.
    ///
    /// Returns the close reason if this disconnect closed the session.
    pub fn on_disconnect(&self, handle: &ConnectionHandle) -> Option<CloseReason> {
        match self.pairing.detach(&handle.nonce, handle.role, handle.id) {
            Ok(reason) => reason,
            Err(e) => {
                tracing::debug!(
                    nonce = %handle.nonce, conn_id = %handle.id, error = %e,
                    "disconnect for unknown session"
                );
                None
            }
        }
    }

    /// Queues `bytes` for `handle`'s peer.
    ///
    /// Returns `false` if the message was dropped: the session is gone, or
    /// the connection no longer holds its slot.
    pub fn send(&self, handle: &ConnectionHandle, bytes: Vec<u8>) -> bool {
        self.store
            .update_with(&handle.nonce, |session| {
                Ok(match session.peer(handle.role) {
                    Some(peer) if peer.id() == handle.id => peer.send(bytes),
                    _ => false,
                })
            })
            .unwrap_or(false)
    }

    /// Sends a correlated request on behalf of `from` and waits for the
    /// counterpart's answer. For callers that aren't on a socket.
    ///
    /// # Errors
    /// Everything [`RelayEngine::submit`] can return, then `Timeout` or
    /// `Cancelled` while waiting.
    pub async fn request(
        &self,
        nonce: &Nonce,
        from: Role,
        kind: MessageKind,
        correlation_id: Option<CorrelationId>,
        payload: impl Into<String>,
    ) -> Result<String, RelayError> {
        if !kind.is_correlated_request() {
            return Err(tether_protocol::ProtocolError::InvalidMessage(format!(
                "{kind:?} is not a correlated request"
            ))
            .into());
        }
        let envelope = Envelope {
            correlation_id,
            kind,
            payload: payload.into(),
            code: None,
        };
        let pending = self.engine.submit(nonce, from, envelope).await?;
        Ok(pending.wait().await?)
    }

    /// Closes the session named by `nonce`.
    pub fn close(&self, nonce: &Nonce) -> Result<bool, SessionError> {
        self.store.close(nonce, CloseReason::Requested)
    }

    /// One housekeeping pass: close idle sessions and sessions whose
    /// frontend never came back, then purge old tombstones.
    pub fn sweep(&self) -> SweepReport {
        let closed = self.store.expire_idle(&self.config);
        let purged = self.store.cleanup_closed(self.config.closed_linger);
        if !closed.is_empty() || purged > 0 {
            tracing::debug!(closed = closed.len(), purged, "sweep finished");
        }
        SweepReport { closed, purged }
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval` until the
    /// returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                interval.tick().await;
                broker.sweep();
            }
        })
    }

    /// Closes and removes every session. Pending callers are cancelled and
    /// peers are told.
    pub fn shutdown(&self) -> usize {
        let drained = self.store.drain();
        tracing::info!(drained, "broker shut down");
        drained
    }
}
