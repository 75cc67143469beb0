//! Transaction guard over a session.
//!
//! # Invariants
//! - `commit` and `rollback` consume the guard; both are terminal.
//! - A guard dropped while still active rolls its transaction back.

use super::{Session, SessionResult};
use log::warn;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};

/// Lifecycle of one transaction: `Active` then exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// Active transaction on a session.
///
/// Dereferences to the session, so loads, stages and removals are issued
/// through the guard while it is alive.
pub struct Transaction<'s> {
    session: &'s mut Session,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub(super) fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            finished: false,
        }
    }

    /// Flushes staged and detected changes and commits them.
    ///
    /// On failure the transaction is rolled back before the error is returned:
    /// the store is unchanged and attached records are reverted.
    pub fn commit(mut self) -> SessionResult<()> {
        self.finished = true;
        self.session.commit_active()
    }

    /// Discards staged writes and reverts attached records to their snapshots.
    pub fn rollback(mut self) -> SessionResult<()> {
        self.finished = true;
        self.session.rollback_active()
    }
}

impl Deref for Transaction<'_> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished || !self.session.in_transaction() {
            return;
        }
        warn!(
            "event=tx_abandon module=session status=rollback session_id={}",
            self.session.id()
        );
        if let Err(err) = self.session.rollback_active() {
            warn!(
                "event=tx_abandon module=session status=error session_id={} error={}",
                self.session.id(),
                err
            );
        }
    }
}

impl Debug for Transaction<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("session_id", &self.session.id())
            .field("finished", &self.finished)
            .finish()
    }
}
