//! Store boundary: the only I/O surface a session talks to.
//!
//! # Responsibility
//! - Define the connection-scoped read/write contract a session flushes into.
//! - Provide a SQLite backend and an in-memory backend behind that contract.
//!
//! # Invariants
//! - One `StoreConnection` serves exactly one session for its lifetime.
//! - At most one store transaction is open per connection.
//! - Writes outside a store transaction are autocommitted.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::db::DbError;
use crate::model::{EntityMapping, Fields};
use serde::{Deserialize, Serialize};

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures raised at the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Connection(String),
    #[error("constraint violation on `{table}`: {message}")]
    Constraint { table: &'static str, message: String },
    #[error("concurrent modification detected: {0}")]
    Conflict(String),
    #[error("table `{0}` is not mapped in this store")]
    UnknownTable(&'static str),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
    #[error("store transaction misuse: {0}")]
    TransactionState(&'static str),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Transaction locking behaviour requested from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Locks are taken on first read/write.
    #[default]
    Deferred,
    /// Write lock taken at begin.
    Immediate,
    /// Exclusive lock taken at begin.
    Exclusive,
}

/// A backing store able to hand out per-session connections.
pub trait Store: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Ensures storage for `mapping` exists and matches its columns.
    fn register(&self, mapping: &'static EntityMapping) -> StoreResult<()>;

    /// Opens a new connection.
    fn connect(&self) -> StoreResult<Box<dyn StoreConnection>>;
}

/// A connection-scoped handle to the store.
pub trait StoreConnection {
    fn begin(&mut self, isolation: Isolation) -> StoreResult<()>;
    fn commit(&mut self) -> StoreResult<()>;
    fn rollback(&mut self) -> StoreResult<()>;
    fn in_transaction(&self) -> bool;

    /// Reads the mapped columns of one row.
    fn select(&mut self, mapping: &'static EntityMapping, identity: i64)
        -> StoreResult<Option<Fields>>;

    /// Inserts one row and returns its identity.
    ///
    /// When `identity` is `None` the store assigns the next identity.
    fn insert(
        &mut self,
        mapping: &'static EntityMapping,
        identity: Option<i64>,
        fields: &Fields,
    ) -> StoreResult<i64>;

    /// Writes `fields` to the row; returns `false` when no such row exists.
    fn update(
        &mut self,
        mapping: &'static EntityMapping,
        identity: i64,
        fields: &Fields,
    ) -> StoreResult<bool>;

    /// Deletes the row; returns `false` when no such row exists.
    fn delete(&mut self, mapping: &'static EntityMapping, identity: i64) -> StoreResult<bool>;
}
