//! The session store: every live session, keyed by nonce.
//!
//! This is the only broadly shared mutable state in the broker. Pairing,
//! relay and the sweeper all go through the methods here; nothing else
//! holds a reference into the map.
//!
//! # Concurrency
//!
//! The map is a `DashMap`, so the index is sharded and there is no single
//! global lock. Each entry is guarded by its shard's lock for the duration
//! of one [`update_with`](SessionStore::update_with) closure, which makes
//! every read-modify-write on a session atomic with respect to every other
//! one on the same nonce. Closures must not await and must not call back
//! into the store.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_protocol::Role;

use crate::{
    ChallengeToken, CloseReason, CredentialCapability, Nonce, Session,
    SessionConfig, SessionError, SessionPatch, SessionSnapshot, SessionState,
};

/// Registry of sessions.
///
/// ## Lifecycle
///
/// ```text
/// create() ──→ update()/update_with() ──→ close() ──→ cleanup_closed()
///    │                                       ▲              │
///    │                              expire_idle()           ▼
///    ▼                                                  [removed]
/// [Created] ... [Established]            [Closed]
/// ```
///
/// `remove()` skips the tombstone and deletes right away. `drain()`
/// closes and removes everything at shutdown.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<Nonce, Session>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh nonce, has `credentials` issue a challenge bound to
    /// `callback_for(&nonce)`, and stores a new `Created` session.
    ///
    /// The session only becomes visible once the challenge exists, so a
    /// failed issuance leaves nothing behind.
    ///
    /// # Errors
    /// [`SessionError::Capability`] if challenge issuance fails.
    pub async fn create<C, F>(
        &self,
        credentials: &C,
        callback_for: F,
    ) -> Result<(Nonce, ChallengeToken), SessionError>
    where
        C: CredentialCapability,
        F: Fn(&Nonce) -> String,
    {
        loop {
            let nonce = Nonce::generate();
            if self.sessions.contains_key(&nonce) {
                continue;
            }

            let callback = callback_for(&nonce);
            let challenge = credentials
                .issue_challenge(&callback)
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "challenge issuance failed");
                    SessionError::Capability(e.to_string())
                })?;

            // The nonce was free before the await; re-check on insert.
            match self.sessions.entry(nonce.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(Session::new(nonce.clone(), challenge.clone()));
                    tracing::info!(%nonce, "session created");
                    return Ok((nonce, challenge));
                }
            }
        }
    }

    /// Returns a snapshot of the session.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] for any nonce `create` never returned (or
    /// one that has since been purged).
    pub fn get(&self, nonce: &Nonce) -> Result<SessionSnapshot, SessionError> {
        self.sessions
            .get(nonce)
            .map(|s| s.snapshot())
            .ok_or_else(|| SessionError::NotFound(nonce.clone()))
    }

    /// Merges `patch` into the session atomically and returns the result.
    ///
    /// Either every field in the patch applies or none does.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] — no such session
    /// - whatever the patch violates (`SessionClosed`,
    ///   `PeerAlreadyAttached`, `InvalidTransition`, `Unauthorized`)
    pub fn update(
        &self,
        nonce: &Nonce,
        patch: SessionPatch,
    ) -> Result<SessionSnapshot, SessionError> {
        self.update_with(nonce, |session| {
            patch.apply(session)?;
            Ok(session.snapshot())
        })
    }

    /// Runs `f` on the session under its entry lock.
    ///
    /// This is the primitive every other mutation is built on. `f` must be
    /// quick and synchronous.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the session doesn't exist, otherwise
    /// whatever `f` returns.
    pub fn update_with<T, F>(&self, nonce: &Nonce, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<T, SessionError>,
    {
        let mut entry = self
            .sessions
            .get_mut(nonce)
            .ok_or_else(|| SessionError::NotFound(nonce.clone()))?;
        f(&mut entry)
    }

    /// Closes the session, leaving a `Closed` tombstone until
    /// [`cleanup_closed`](Self::cleanup_closed) purges it.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self, nonce: &Nonce, reason: CloseReason) -> Result<bool, SessionError> {
        self.update_with(nonce, |session| Ok(session.close(reason)))
    }

    /// Deletes the session. Idempotent. Pending callers are cancelled and
    /// attached peers get a `close` notice first.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, nonce: &Nonce) -> bool {
        match self.sessions.remove(nonce) {
            Some((_, mut session)) => {
                session.close(CloseReason::Requested);
                tracing::debug!(%nonce, "session removed");
                true
            }
            None => false,
        }
    }

    /// Closes every open session whose frontend grace ran out or that has
    /// been idle too long. Returns what was closed and why.
    pub fn expire_idle(&self, config: &SessionConfig) -> Vec<(Nonce, CloseReason)> {
        let mut expired = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.is_closed() {
                continue;
            }
            let reason = if session
                .frontend_grace_expired(config.frontend_reconnect_grace)
            {
                CloseReason::FrontendDisconnected
            } else if session.is_idle(config.idle_timeout) {
                CloseReason::Idle
            } else {
                continue;
            };
            session.close(reason);
            expired.push((session.nonce().clone(), reason));
        }

        expired
    }

    /// Removes closed sessions that have lingered at least `linger`.
    /// Returns how many were removed.
    pub fn cleanup_closed(&self, linger: std::time::Duration) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            if session.is_purgeable(linger) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Closes and removes every session. Called once at shutdown.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        self.sessions.retain(|_, session| {
            session.close(CloseReason::Shutdown);
            drained += 1;
            false
        });
        tracing::info!(drained, "session store drained");
        drained
    }

    /// Number of sessions in the store, tombstones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Counts sessions per state; handy for health checks and tests.
    pub fn count_in(&self, state: SessionState) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == state)
            .count()
    }

    /// Whether `role` currently has a connection attached on `nonce`.
    pub fn is_attached(&self, nonce: &Nonce, role: Role) -> bool {
        self.sessions
            .get(nonce)
            .is_some_and(|s| s.peer(role).is_some())
    }
}

// =========================================================================
// Tests
// =========================================================================
