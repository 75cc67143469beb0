//! In-memory store used by tests and the `memory` backend.
//!
//! # Responsibility
//! - Keep mapped tables as ordered maps shared by all connections.
//! - Give each connection snapshot isolation inside a transaction.
//!
//! # Invariants
//! - A transaction's writes become visible to other connections only at commit,
//!   and all at once.
//! - A writing transaction whose base version is stale fails to commit.
//! - Identity sequences never hand out a value twice, even after rollback.

use super::{Isolation, Store, StoreConnection, StoreError, StoreResult};
use crate::model::{EntityMapping, FieldValue, Fields};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<i64, Fields>,
    sequence: i64,
}

#[derive(Debug, Default)]
struct Shared {
    version: u64,
    tables: HashMap<&'static str, Table>,
}

/// Process-local store; clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows in `table`.
    pub fn row_count(&self, table: &str) -> StoreResult<usize> {
        let shared = lock(&self.shared)?;
        Ok(shared.tables.get(table).map_or(0, |table| table.rows.len()))
    }
}

impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn register(&self, mapping: &'static EntityMapping) -> StoreResult<()> {
        let mut shared = lock(&self.shared)?;
        shared.tables.entry(mapping.table).or_default();
        info!(
            "event=store_register module=store status=ok backend=memory table={}",
            mapping.table
        );
        Ok(())
    }

    fn connect(&self) -> StoreResult<Box<dyn StoreConnection>> {
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            working: None,
        }))
    }
}

struct Working {
    base_version: u64,
    tables: HashMap<&'static str, Table>,
    wrote: bool,
}

struct MemoryConnection {
    shared: Arc<Mutex<Shared>>,
    working: Option<Working>,
}

impl MemoryConnection {
    /// Runs `op` against the transaction's private tables, or directly against
    /// the shared tables (autocommit) when no transaction is open.
    fn with_tables<T>(
        &mut self,
        write: bool,
        op: impl FnOnce(&mut HashMap<&'static str, Table>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if let Some(working) = self.working.as_mut() {
            let result = op(&mut working.tables)?;
            working.wrote |= write;
            return Ok(result);
        }

        let mut shared = lock(&self.shared)?;
        let result = op(&mut shared.tables)?;
        if write {
            shared.version += 1;
        }
        Ok(result)
    }
}

impl StoreConnection for MemoryConnection {
    fn begin(&mut self, _isolation: Isolation) -> StoreResult<()> {
        if self.working.is_some() {
            return Err(StoreError::TransactionState("transaction already open"));
        }
        let shared = lock(&self.shared)?;
        self.working = Some(Working {
            base_version: shared.version,
            tables: shared.tables.clone(),
            wrote: false,
        });
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let working = self
            .working
            .take()
            .ok_or(StoreError::TransactionState("no open transaction to commit"))?;
        if !working.wrote {
            return Ok(());
        }

        let mut shared = lock(&self.shared)?;
        if shared.version != working.base_version {
            return Err(StoreError::Conflict(format!(
                "store advanced from version {} to {} during the transaction",
                working.base_version, shared.version
            )));
        }
        shared.tables = working.tables;
        shared.version += 1;
        debug!("event=store_commit module=store backend=memory version={}", shared.version);
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let Some(working) = self.working.take() else {
            return Ok(());
        };
        // Sequence advances survive rollback so identities are never reused.
        let mut shared = lock(&self.shared)?;
        for (name, table) in working.tables {
            if let Some(committed) = shared.tables.get_mut(name) {
                committed.sequence = committed.sequence.max(table.sequence);
            }
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.working.is_some()
    }

    fn select(
        &mut self,
        mapping: &'static EntityMapping,
        identity: i64,
    ) -> StoreResult<Option<Fields>> {
        self.with_tables(false, |tables| {
            let table = table_mut(tables, mapping)?;
            Ok(table.rows.get(&identity).cloned())
        })
    }

    fn insert(
        &mut self,
        mapping: &'static EntityMapping,
        identity: Option<i64>,
        fields: &Fields,
    ) -> StoreResult<i64> {
        let row = project(mapping, fields)?;
        self.with_tables(true, |tables| {
            let table = table_mut(tables, mapping)?;
            let id = match identity {
                Some(id) => id,
                None => table.sequence + 1,
            };
            if table.rows.contains_key(&id) {
                return Err(StoreError::Constraint {
                    table: mapping.table,
                    message: format!("UNIQUE constraint failed: {}.{}", mapping.table, mapping.identity_column),
                });
            }
            table.sequence = table.sequence.max(id);
            table.rows.insert(id, row);
            Ok(id)
        })
    }

    fn update(
        &mut self,
        mapping: &'static EntityMapping,
        identity: i64,
        fields: &Fields,
    ) -> StoreResult<bool> {
        let changes = project_partial(mapping, fields)?;
        self.with_tables(true, |tables| {
            let table = table_mut(tables, mapping)?;
            let Some(row) = table.rows.get_mut(&identity) else {
                return Ok(false);
            };
            row.extend(changes);
            Ok(true)
        })
    }

    fn delete(&mut self, mapping: &'static EntityMapping, identity: i64) -> StoreResult<bool> {
        self.with_tables(true, |tables| {
            let table = table_mut(tables, mapping)?;
            Ok(table.rows.remove(&identity).is_some())
        })
    }
}

fn lock(shared: &Mutex<Shared>) -> StoreResult<MutexGuard<'_, Shared>> {
    shared
        .lock()
        .map_err(|_| StoreError::Connection("memory store lock poisoned".to_string()))
}

fn table_mut<'t>(
    tables: &'t mut HashMap<&'static str, Table>,
    mapping: &'static EntityMapping,
) -> StoreResult<&'t mut Table> {
    tables
        .get_mut(mapping.table)
        .ok_or(StoreError::UnknownTable(mapping.table))
}

/// Full row for insert: every mapped column, missing ones as NULL.
fn project(mapping: &'static EntityMapping, fields: &Fields) -> StoreResult<Fields> {
    let mut row = project_partial(mapping, fields)?;
    for column in mapping.columns {
        row.entry(*column).or_insert(FieldValue::Null);
    }
    Ok(row)
}

fn project_partial(mapping: &'static EntityMapping, fields: &Fields) -> StoreResult<Fields> {
    let mut row = Fields::new();
    for (column, value) in fields {
        let Some(mapped) = mapping.columns.iter().find(|mapped| *mapped == column) else {
            return Err(StoreError::InvalidData(format!(
                "table `{}` has no column `{column}`",
                mapping.table
            )));
        };
        row.insert(*mapped, value.clone());
    }
    Ok(row)
}
