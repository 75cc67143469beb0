//! Persistence sessions: unit of work over one store connection.
//!
//! # Responsibility
//! - Load, stage and remove records while tracking them in an identity map.
//! - Detect field changes on attached records by diffing against snapshots.
//! - Flush deletes, inserts and detected updates atomically at commit.
//!
//! # Invariants
//! - At most one active transaction per session.
//! - Every operation on a closed session fails with `StateError::Closed`.
//! - Closing (explicitly or on drop) rolls back an active transaction,
//!   detaches every record and releases the connection.

pub mod factory;
mod tracking;
mod transaction;

pub use factory::{global, global_factory, SessionFactory};
pub use transaction::{Transaction, TransactionStatus};

use crate::config::ConfigError;
use crate::model::{Entity, MappingError, ValidationError};
use crate::store::{Isolation, StoreConnection, StoreError};
use log::{debug, error, info, warn};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::time::Instant;
use tracking::Tracker;
use uuid::Uuid;

pub type SessionResult<T> = Result<T, SessionError>;

/// Misuse of the session/transaction lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("session is closed")]
    Closed,
    #[error("a transaction is already active on this session")]
    TransactionActive,
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("`{table}` record is not attached to this session")]
    Detached { table: &'static str },
    #[error("`{table}` record with id {id} is already attached to this session")]
    DuplicateIdentity { table: &'static str, id: i64 },
    #[error("`{table}` record is borrowed by the caller")]
    RecordBorrowed { table: &'static str },
    #[error("`{table}` record identity changed from {expected:?} to {actual:?} while attached")]
    IdentityChanged {
        table: &'static str,
        expected: Option<i64>,
        actual: Option<i64>,
    },
    #[error("tracked `{table}` record has a different type than requested")]
    TypeMismatch { table: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("store unreachable: {0}")]
    Connection(String),
    #[error("`{table}` record with id {id} not found")]
    NotFound { table: &'static str, id: i64 },
    #[error("constraint violation on `{table}`: {message}")]
    Constraint { table: &'static str, message: String },
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid session state: {0}")]
    State(#[from] StateError),
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Connection(message) => Self::Connection(message),
            StoreError::Constraint { table, message } => Self::Constraint { table, message },
            StoreError::Conflict(message) => Self::Conflict(message),
            other => Self::Store(other),
        }
    }
}

/// Shared handle to a record attached to a session.
///
/// Mutations made through `borrow_mut` are picked up by the owning session at
/// the next commit without any explicit re-submission. After the session
/// closes the handle keeps working as a plain detached value.
pub struct Attached<E> {
    inner: Rc<RefCell<E>>,
}

impl<E> Attached<E> {
    fn new(record: E) -> Self {
        Self::from_rc(Rc::new(RefCell::new(record)))
    }

    fn from_rc(inner: Rc<RefCell<E>>) -> Self {
        Self { inner }
    }

    fn rc(&self) -> &Rc<RefCell<E>> {
        &self.inner
    }

    fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.inner) as *const ()
    }

    pub fn borrow(&self) -> Ref<'_, E> {
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, E> {
        self.inner.borrow_mut()
    }

    /// Returns true when both handles refer to the same tracked record.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<E: Clone> Attached<E> {
    /// Copies the current record value out of the handle.
    pub fn get(&self) -> E {
        self.inner.borrow().clone()
    }
}

impl<E> Clone for Attached<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: Debug> Debug for Attached<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(record) => f.debug_tuple("Attached").field(&*record).finish(),
            Err(_) => f.write_str("Attached(<borrowed>)"),
        }
    }
}

/// A unit of work bound to one store connection.
pub struct Session {
    id: Uuid,
    connection: Option<Box<dyn StoreConnection>>,
    isolation: Isolation,
    tracker: Tracker,
    transaction_active: bool,
    last_status: Option<TransactionStatus>,
}

impl Session {
    pub(crate) fn new(connection: Box<dyn StoreConnection>, isolation: Isolation) -> Self {
        let id = Uuid::new_v4();
        info!("event=session_open module=session status=ok session_id={id}");
        Self {
            id,
            connection: Some(connection),
            isolation,
            tracker: Tracker::default(),
            transaction_active: false,
            last_status: None,
        }
    }

    /// Correlation id used in log events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Status of the most recent transaction, if one was ever begun.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.last_status
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_active
    }

    pub fn tracked_count(&self) -> usize {
        self.tracker.len()
    }

    pub fn pending_insert_count(&self) -> usize {
        self.tracker.pending_insert_count()
    }

    pub fn pending_delete_count(&self) -> usize {
        self.tracker.pending_delete_count()
    }

    /// Attached records whose fields changed since their last snapshot.
    pub fn dirty_count(&self) -> usize {
        self.tracker.dirty_count()
    }

    fn connection(&mut self) -> SessionResult<&mut (dyn StoreConnection + 'static)> {
        self.connection
            .as_deref_mut()
            .ok_or(SessionError::State(StateError::Closed))
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SessionError::State(StateError::Closed))
        }
    }

    /// Loads a record by identity, attaching it on first load.
    ///
    /// Returns the already-attached handle when the identity is tracked.
    ///
    /// # Errors
    /// - `NotFound` when no such row exists or the record is staged for deletion.
    pub fn get<E: Entity>(&mut self, id: i64) -> SessionResult<Attached<E>> {
        self.find::<E>(id)?.ok_or(SessionError::NotFound {
            table: E::MAPPING.table,
            id,
        })
    }

    /// Like [`Session::get`] but maps a missing row to `Ok(None)`.
    pub fn find<E: Entity>(&mut self, id: i64) -> SessionResult<Option<Attached<E>>> {
        self.ensure_open()?;
        match self.tracker.lookup::<E>(id) {
            Ok(Some(handle)) => return Ok(Some(handle)),
            Ok(None) => {}
            Err(SessionError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        }

        let session_id = self.id;
        let Some(fields) = self.connection()?.select(E::MAPPING, id)? else {
            debug!(
                "event=session_get module=session status=not_found session_id={} table={} id={}",
                session_id,
                E::MAPPING.table,
                id
            );
            return Ok(None);
        };

        let handle = Attached::new(E::from_fields(id, &fields)?);
        self.tracker.attach_loaded(&handle, id);
        debug!(
            "event=session_get module=session status=ok session_id={} table={} id={}",
            session_id,
            E::MAPPING.table,
            id
        );
        Ok(Some(handle))
    }

    /// Attaches a transient record and stages its insert for the next commit.
    ///
    /// # Errors
    /// - `StateError::DuplicateIdentity` when the record carries an identity
    ///   already attached to this session.
    pub fn persist<E: Entity>(&mut self, record: E) -> SessionResult<Attached<E>> {
        self.ensure_open()?;
        let handle = Attached::new(record);
        self.tracker.stage_insert(&handle)?;
        debug!(
            "event=session_persist module=session status=staged session_id={} table={}",
            self.id,
            E::MAPPING.table
        );
        Ok(handle)
    }

    /// Re-submits an attached record.
    ///
    /// Changes are already detected by snapshot comparison, so this only checks
    /// attachment. A record staged for deletion is un-staged.
    pub fn save<E: Entity>(&mut self, handle: &Attached<E>) -> SessionResult<()> {
        self.ensure_open()?;
        self.tracker.resubmit(handle)
    }

    /// Stages the delete of an attached record.
    ///
    /// A record whose insert is still staged is just dropped from tracking.
    pub fn remove<E: Entity>(&mut self, handle: &Attached<E>) -> SessionResult<()> {
        self.ensure_open()?;
        self.tracker.stage_delete(handle)?;
        debug!(
            "event=session_remove module=session status=staged session_id={} table={}",
            self.id,
            E::MAPPING.table
        );
        Ok(())
    }

    pub fn contains<E: Entity>(&self, handle: &Attached<E>) -> bool {
        self.is_open() && self.tracker.contains(handle)
    }

    /// Begins a transaction on this session.
    ///
    /// # Errors
    /// - `StateError::TransactionActive` when one is already active.
    /// - Store errors when the backend refuses to begin.
    pub fn begin_transaction(&mut self) -> SessionResult<Transaction<'_>> {
        self.ensure_open()?;
        if self.transaction_active {
            return Err(SessionError::State(StateError::TransactionActive));
        }
        let isolation = self.isolation;
        self.connection()?.begin(isolation)?;
        self.transaction_active = true;
        self.last_status = Some(TransactionStatus::Active);
        debug!(
            "event=tx_begin module=session status=ok session_id={} isolation={:?}",
            self.id, isolation
        );
        Ok(Transaction::new(self))
    }

    fn commit_active(&mut self) -> SessionResult<()> {
        self.ensure_open()?;
        if !self.transaction_active {
            return Err(SessionError::State(StateError::NoActiveTransaction));
        }

        let started_at = Instant::now();
        let result = self.flush_and_commit();
        self.transaction_active = false;

        match result {
            Ok((deletes, inserts, updates)) => {
                self.last_status = Some(TransactionStatus::Committed);
                info!(
                    "event=tx_commit module=session status=ok session_id={} deletes={} inserts={} updates={} duration_ms={}",
                    self.id,
                    deletes,
                    inserts,
                    updates,
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "event=tx_commit module=session status=error session_id={} duration_ms={} error={}",
                    self.id,
                    started_at.elapsed().as_millis(),
                    err
                );
                if let Some(connection) = self.connection.as_deref_mut() {
                    if let Err(rollback_err) = connection.rollback() {
                        error!(
                            "event=tx_rollback module=session status=error session_id={} error={}",
                            self.id, rollback_err
                        );
                    }
                }
                if let Err(revert_err) = self.tracker.revert() {
                    error!(
                        "event=tx_revert module=session status=error session_id={} error={}",
                        self.id, revert_err
                    );
                }
                self.last_status = Some(TransactionStatus::RolledBack);
                Err(err)
            }
        }
    }

    /// Sends the flush plan to the store and commits it.
    ///
    /// Returns `(deletes, inserts, updates)` counts.
    fn flush_and_commit(&mut self) -> SessionResult<(usize, usize, usize)> {
        let plan = self.tracker.plan()?;
        let counts = (plan.deletes.len(), plan.inserts.len(), plan.updates.len());
        let connection = self.connection()?;

        for delete in &plan.deletes {
            if !connection.delete(delete.mapping, delete.identity)? {
                return Err(SessionError::Conflict(format!(
                    "`{}` row {} vanished before delete",
                    delete.mapping.table, delete.identity
                )));
            }
        }

        let mut assigned = Vec::with_capacity(plan.inserts.len());
        for insert in &plan.inserts {
            assigned.push(connection.insert(insert.mapping, insert.identity, &insert.fields)?);
        }

        for update in &plan.updates {
            if !connection.update(update.mapping, update.identity, &update.changes)? {
                return Err(SessionError::Conflict(format!(
                    "`{}` row {} vanished before update",
                    update.mapping.table, update.identity
                )));
            }
        }

        connection.commit()?;
        if !plan.is_empty() {
            self.tracker.apply_commit(plan, &assigned);
        }
        Ok(counts)
    }

    fn rollback_active(&mut self) -> SessionResult<()> {
        self.ensure_open()?;
        if !self.transaction_active {
            return Err(SessionError::State(StateError::NoActiveTransaction));
        }

        self.transaction_active = false;
        self.last_status = Some(TransactionStatus::RolledBack);
        let store_result = self.connection()?.rollback();
        let revert_result = self.tracker.revert();
        info!(
            "event=tx_rollback module=session status={} session_id={}",
            if store_result.is_ok() { "ok" } else { "error" },
            self.id
        );
        store_result?;
        revert_result
    }

    /// Rolls back any active transaction, detaches all records and releases
    /// the connection. Calling it again is a no-op.
    pub fn close(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        if self.transaction_active {
            self.transaction_active = false;
            self.last_status = Some(TransactionStatus::RolledBack);
            if let Err(err) = connection.rollback() {
                error!(
                    "event=session_close module=session status=error session_id={} error={}",
                    self.id, err
                );
            }
        }
        let detached = self.tracker.len();
        self.tracker.clear();
        info!(
            "event=session_close module=session status=ok session_id={} detached={}",
            self.id, detached
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("tracked", &self.tracker.len())
            .field("transaction", &self.last_status)
            .finish()
    }
}
