//! The pending-response table: correlated requests waiting for an answer.
//!
//! Each entry owns the sending half of a `oneshot` channel; the caller holds
//! the receiving half. Every way an entry can leave the table sends exactly
//! one value or drops the sender:
//!
//! - [`resolve`](PendingRequests::resolve) → `Ok(payload)`, and only when
//!   the answer comes from the requester's counterpart
//! - [`cancel_all`](PendingRequests::cancel_all) → `Err(Cancelled)`
//! - [`abandon`](PendingRequests::abandon) → nothing (the caller already
//!   gave up, e.g. on timeout)

use std::collections::HashMap;

use tether_protocol::{CorrelationId, Role};
use tokio::sync::oneshot;

use crate::SessionError;

/// What a pending caller eventually receives.
pub type PendingResult = Result<String, SessionError>;

#[derive(Debug)]
struct Waiter {
    requester: Role,
    tx: oneshot::Sender<PendingResult>,
}

/// Correlation id → waiting caller, scoped to one session.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<CorrelationId, Waiter>,
}

impl PendingRequests {
    /// Registers a waiter under `id` on behalf of `requester` and returns
    /// the receiver the caller awaits.
    ///
    /// # Errors
    /// [`SessionError::DuplicateCorrelationId`] if `id` is already pending
    /// in this session. The existing entry is left untouched.
    pub fn insert(
        &mut self,
        id: CorrelationId,
        requester: Role,
    ) -> Result<oneshot::Receiver<PendingResult>, SessionError> {
        if self.entries.contains_key(&id) {
            return Err(SessionError::DuplicateCorrelationId(id));
        }
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, Waiter { requester, tx });
        Ok(rx)
    }

    /// Hands `payload`, sent by `responder`, to the caller waiting on `id`
    /// and removes the entry.
    ///
    /// Returns `false` and leaves the table untouched if nothing is pending
    /// under `id` or if `responder` is not the requester's counterpart; the
    /// message is then an unsolicited push.
    pub fn resolve(&mut self, id: &CorrelationId, responder: Role, payload: String) -> bool {
        if !self.awaits(id, responder) {
            return false;
        }
        match self.entries.remove(id) {
            Some(waiter) => {
                // The receiver may have been dropped by a caller that just
                // timed out. The entry is gone either way.
                let _ = waiter.tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Whether a request is pending under `id` that `responder` may answer.
    pub fn awaits(&self, id: &CorrelationId, responder: Role) -> bool {
        self.entries
            .get(id)
            .is_some_and(|waiter| waiter.requester.counterpart() == responder)
    }

    /// Removes the entry without notifying anyone.
    pub fn abandon(&mut self, id: &CorrelationId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fails every waiter with [`SessionError::Cancelled`] and empties the
    /// table. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        for (id, waiter) in self.entries.drain() {
            let _ = waiter.tx.send(Err(SessionError::Cancelled(id)));
        }
        count
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    /// Pending ids, sorted.
    pub fn ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<_> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
