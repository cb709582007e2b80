//! Session types: the broker's record of one frontend/agent pairing.
//!
//! A session tracks:
//! - WHICH rendezvous it is (`Nonce`, also the join secret)
//! - WHAT the agent has to prove (`ChallengeToken`)
//! - WHERE each peer is (`PeerHandle` per role)
//! - WHICH requests are waiting for an answer (`PendingRequests`)
//! - WHEN it last saw traffic (idle expiry)

use std::fmt;
use std::time::Duration;

use tether_protocol::{Codec, CorrelationId, Envelope, JsonCodec, MessageKind, Role};
use tether_transport::ConnectionId;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{ChallengeToken, KeyRef, PendingRequests, SessionError};

// ---------------------------------------------------------------------------
// Nonce
// ---------------------------------------------------------------------------

/// The session identifier and join secret.
///
/// Anyone holding a nonce can join its session as the frontend, so it is
/// never written to logs in full: `Display` and `Debug` show only the first
/// eight characters.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Nonce(String);

impl Nonce {
    /// Generates a fresh nonce: 256 random bits as 64 lowercase hex chars.
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; 32] = rand::rng().random();
        Self(hex::encode(bytes))
    }

    /// Wraps a nonce received from a peer (e.g. parsed from a join path).
    /// This does not make the session exist; lookups still go through the
    /// store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The full nonce. Only for building join addresses and tickets.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn redacted(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.redacted())
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({}…)", self.redacted())
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Timeouts and limits for sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Failed authentication responses allowed before the session closes.
    pub max_auth_attempts: u32,

    /// How long a correlated request waits for its response.
    pub request_timeout: Duration,

    /// A session with no traffic for this long is closed.
    pub idle_timeout: Duration,

    /// How long a disconnected frontend may take to re-join. Zero closes
    /// the session as soon as the frontend drops.
    pub frontend_reconnect_grace: Duration,

    /// How long a closed session stays visible (so late messages get
    /// `SessionClosed` instead of `NotFound`) before it is purged.
    pub closed_linger: Duration,

    /// How often the sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_auth_attempts: 3,
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            frontend_reconnect_grace: Duration::ZERO,
            closed_linger: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Where a session is in the pairing protocol.
///
/// ```text
///   Created ──(agent attaches)──→ AgentAuthenticating ──(valid response)──→ Established
///      │                                  │                                     │
///      └──────────────(close / disconnect / idle / too many failures)──────────┴──→ Closed
/// ```
///
/// States only move right. `Closed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Nonce and challenge exist; the agent hasn't connected.
    Created,
    /// The agent is attached but hasn't proven its credential yet.
    AgentAuthenticating,
    /// The agent authenticated; relay is open.
    Established,
    /// Torn down. Everything is rejected with `SessionClosed`.
    Closed,
}

/// Why a session was closed. Sent to attached peers in the `close` notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A peer (or the owner) asked for it.
    Requested,
    /// The agent used up its authentication attempts.
    AuthFailed,
    /// The agent's connection dropped.
    AgentDisconnected,
    /// The frontend dropped and didn't come back within the grace period.
    FrontendDisconnected,
    /// No traffic within the idle window.
    Idle,
    /// The broker is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Requested => "closed on request",
            CloseReason::AuthFailed => "authentication attempts exhausted",
            CloseReason::AgentDisconnected => "agent disconnected",
            CloseReason::FrontendDisconnected => "frontend disconnected",
            CloseReason::Idle => "idle timeout",
            CloseReason::Shutdown => "broker shutting down",
        };
        f.write_str(text)
    }
}

// ---------------------------------------------------------------------------
// PeerHandle
// ---------------------------------------------------------------------------

/// A session's reference to a live peer connection.
///
/// The session doesn't own the socket. It owns the sending half of the
/// connection's outbound queue; the transport adapter drains the other half
/// into the socket. Dropping the handle (detach or close) ends that queue,
/// which is the adapter's cue to close the connection.
#[derive(Debug)]
pub struct PeerHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl PeerHandle {
    /// Creates a handle for connection `id` and the receiver the transport
    /// adapter should drain.
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { id, outbound }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `data` for the peer. Returns `false` if the connection is
    /// already gone; callers treat that as a dropped message.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.outbound.send(data).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A single frontend/agent pairing.
///
/// Lives inside the [`SessionStore`](crate::SessionStore) and is only ever
/// touched under its per-entry lock. `nonce` and `challenge` are fixed at
/// creation and have no setters.
#[derive(Debug)]
pub struct Session {
    nonce: Nonce,
    challenge: ChallengeToken,
    state: SessionState,
    frontend: Option<PeerHandle>,
    agent: Option<PeerHandle>,
    agent_key: Option<KeyRef>,
    auth_failures: u32,
    pending: PendingRequests,
    created_at: Instant,
    last_activity: Instant,
    frontend_detached_at: Option<Instant>,
    closed_at: Option<Instant>,
}

impl Session {
    pub(crate) fn new(nonce: Nonce, challenge: ChallengeToken) -> Self {
        let now = Instant::now();
        Self {
            nonce,
            challenge,
            state: SessionState::Created,
            frontend: None,
            agent: None,
            agent_key: None,
            auth_failures: 0,
            pending: PendingRequests::default(),
            created_at: now,
            last_activity: now,
            frontend_detached_at: None,
            closed_at: None,
        }
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn challenge(&self) -> &ChallengeToken {
        &self.challenge
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// The handle attached for `role`, if any.
    pub fn peer(&self, role: Role) -> Option<&PeerHandle> {
        match role {
            Role::Frontend => self.frontend.as_ref(),
            Role::Agent => self.agent.as_ref(),
        }
    }

    /// The key bound by the agent's successful authentication.
    pub fn agent_key(&self) -> Option<&KeyRef> {
        self.agent_key.as_ref()
    }

    pub fn auth_failures(&self) -> u32 {
        self.auth_failures
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingRequests {
        &mut self.pending
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Records traffic, pushing back the idle deadline.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Fails with `SessionClosed` if the session is torn down.
    pub fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed(self.nonce.clone()));
        }
        Ok(())
    }

    /// Moves the session forward to `to`.
    ///
    /// # Errors
    /// - [`SessionError::InvalidTransition`] — `to` is behind the current
    ///   state, or the session is closed
    /// - [`SessionError::Unauthorized`] — `Established` without a key bound
    ///   by a successful validation
    pub fn advance(&mut self, to: SessionState) -> Result<(), SessionError> {
        check_transition(self.state, to, self.agent_key.is_some())?;
        if to != self.state {
            tracing::debug!(nonce = %self.nonce, from = ?self.state, ?to, "session state advanced");
            self.state = to;
            if to == SessionState::Established {
                self.notify_authenticated(Role::Agent);
                self.notify_authenticated(Role::Frontend);
            }
        }
        Ok(())
    }

    /// Attaches a peer connection to its slot.
    ///
    /// The agent's first attach moves a `Created` session to
    /// `AgentAuthenticating`. A frontend joining an `Established` session is
    /// sent `authenticated`; one that was already attached got it when the
    /// session advanced.
    ///
    /// # Errors
    /// - [`SessionError::SessionClosed`] — the session is torn down
    /// - [`SessionError::PeerAlreadyAttached`] — the slot is taken, or an
    ///   agent already joined this session once
    pub fn attach(&mut self, role: Role, handle: PeerHandle) -> Result<(), SessionError> {
        self.ensure_open()?;
        let slot = match role {
            Role::Frontend => &mut self.frontend,
            Role::Agent => &mut self.agent,
        };
        // The agent slot is single-use: only the connection that answers
        // the challenge may ever hold it.
        if slot.is_some() || (role == Role::Agent && self.state != SessionState::Created) {
            return Err(SessionError::PeerAlreadyAttached(role));
        }
        *slot = Some(handle);

        match role {
            Role::Frontend => {
                self.frontend_detached_at = None;
                if self.state == SessionState::Established {
                    self.notify_authenticated(Role::Frontend);
                }
            }
            Role::Agent => {
                if self.state == SessionState::Created {
                    self.advance(SessionState::AgentAuthenticating)?;
                }
            }
        }
        self.touch();
        Ok(())
    }

    /// Empties `role`'s slot if it still holds connection `id`. A stale
    /// disconnect for an older connection leaves a newer one alone.
    pub fn detach(&mut self, role: Role, id: ConnectionId) -> bool {
        let slot = match role {
            Role::Frontend => &mut self.frontend,
            Role::Agent => &mut self.agent,
        };
        if slot.as_ref().is_some_and(|h| h.id() == id) {
            *slot = None;
            if role == Role::Frontend {
                self.frontend_detached_at = Some(Instant::now());
            }
            true
        } else {
            false
        }
    }

    /// Queues `data` for `role`. Returns `false` if nobody is attached
    /// there (the message is dropped).
    pub fn send_to(&self, role: Role, data: Vec<u8>) -> bool {
        self.peer(role).is_some_and(|peer| peer.send(data))
    }

    fn notify_authenticated(&self, role: Role) {
        match JsonCodec.encode(&Envelope::new(MessageKind::Authenticated, "")) {
            Ok(bytes) => {
                self.send_to(role, bytes);
            }
            Err(e) => {
                tracing::warn!(nonce = %self.nonce, error = %e, "failed to encode authenticated notice");
            }
        }
    }

    pub(crate) fn bind_agent_key(&mut self, key: KeyRef) {
        self.agent_key = Some(key);
    }

    pub(crate) fn record_auth_failure(&mut self) -> u32 {
        self.auth_failures += 1;
        self.auth_failures
    }

    /// Tears the session down: cancels every pending request, sends each
    /// attached peer a `close` notice, and releases both handles.
    ///
    /// Returns `false` if it was already closed.
    pub(crate) fn close(&mut self, reason: CloseReason) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SessionState::Closed;
        self.closed_at = Some(Instant::now());

        let cancelled = self.pending.cancel_all();

        let notice = Envelope::new(MessageKind::Close, reason.to_string());
        match JsonCodec.encode(&notice) {
            Ok(bytes) => {
                for peer in [self.frontend.take(), self.agent.take()]
                    .into_iter()
                    .flatten()
                {
                    peer.send(bytes.clone());
                }
            }
            Err(e) => {
                tracing::warn!(nonce = %self.nonce, error = %e, "failed to encode close notice");
                self.frontend = None;
                self.agent = None;
            }
        }

        tracing::info!(nonce = %self.nonce, %reason, cancelled, "session closed");
        true
    }

    /// Whether the idle window has passed without traffic.
    pub(crate) fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.last_activity.elapsed() > idle_timeout
    }

    /// Whether the frontend left and its reconnection grace has run out.
    pub(crate) fn frontend_grace_expired(&self, grace: Duration) -> bool {
        self.frontend.is_none()
            && self
                .frontend_detached_at
                .is_some_and(|since| since.elapsed() >= grace)
    }

    /// Whether a closed session has lingered long enough to purge.
    pub(crate) fn is_purgeable(&self, linger: Duration) -> bool {
        self.closed_at.is_some_and(|at| at.elapsed() >= linger)
    }

    /// A cloneable copy of the observable fields.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            nonce: self.nonce.clone(),
            challenge: self.challenge.clone(),
            state: self.state,
            frontend: self.frontend.as_ref().map(PeerHandle::id),
            agent: self.agent.as_ref().map(PeerHandle::id),
            agent_key: self.agent_key.clone(),
            auth_failures: self.auth_failures,
            pending: self.pending.ids(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionSnapshot / SessionPatch
// ---------------------------------------------------------------------------

/// A point-in-time copy of a session, returned by store reads and updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub nonce: Nonce,
    pub challenge: ChallengeToken,
    pub state: SessionState,
    pub frontend: Option<ConnectionId>,
    pub agent: Option<ConnectionId>,
    pub agent_key: Option<KeyRef>,
    pub auth_failures: u32,
    /// Correlation ids currently waiting for a response, sorted.
    pub pending: Vec<CorrelationId>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

/// Fields to merge into a session with
/// [`SessionStore::update`](crate::SessionStore::update).
///
/// Applied in order: detach, attach, then state. Unset fields are left
/// alone.
#[derive(Debug, Default)]
pub struct SessionPatch {
    state: Option<SessionState>,
    attach: Option<(Role, PeerHandle)>,
    detach: Option<(Role, ConnectionId)>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to `state`.
    pub fn state(mut self, state: SessionState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attach `handle` as `role`.
    pub fn attach(mut self, role: Role, handle: PeerHandle) -> Self {
        self.attach = Some((role, handle));
        self
    }

    /// Detach `role` if it still holds connection `id`.
    pub fn detach(mut self, role: Role, id: ConnectionId) -> Self {
        self.detach = Some((role, id));
        self
    }

    /// Validates the whole patch against `session`, then applies it, so a
    /// rejected patch leaves the session untouched.
    pub(crate) fn apply(self, session: &mut Session) -> Result<(), SessionError> {
        let mut effective = session.state;
        if let Some((role, _)) = &self.attach {
            session.ensure_open()?;
            let freed = self.detach.as_ref().is_some_and(|(r, id)| {
                r == role && session.peer(*r).is_some_and(|h| h.id() == *id)
            });
            let agent_claimed = *role == Role::Agent && effective != SessionState::Created;
            if (session.peer(*role).is_some() && !freed) || agent_claimed {
                return Err(SessionError::PeerAlreadyAttached(*role));
            }
            if *role == Role::Agent && effective == SessionState::Created {
                effective = SessionState::AgentAuthenticating;
            }
        }
        if let Some(to) = self.state {
            check_transition(effective, to, session.agent_key.is_some())?;
        }

        if let Some((role, id)) = self.detach {
            session.detach(role, id);
        }
        if let Some((role, handle)) = self.attach {
            session.attach(role, handle)?;
        }
        if let Some(state) = self.state {
            session.advance(state)?;
        }
        Ok(())
    }
}

/// The forward-only rule shared by [`Session::advance`] and patches.
fn check_transition(
    from: SessionState,
    to: SessionState,
    key_bound: bool,
) -> Result<(), SessionError> {
    if to == from {
        return Ok(());
    }
    if to < from || from == SessionState::Closed {
        return Err(SessionError::InvalidTransition { from, to });
    }
    if to == SessionState::Established && !key_bound {
        return Err(SessionError::Unauthorized("agent has not authenticated".into()));
    }
    Ok(())
}
