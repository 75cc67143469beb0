//! SQLite-backed store.
//!
//! # Responsibility
//! - Open one migrated SQLite connection per session.
//! - Translate store-boundary calls into parameterized SQL.
//!
//! # Invariants
//! - Identifiers come from validated `EntityMapping`s and are double-quoted.
//! - Values are always bound, never interpolated.

use super::{Isolation, Store, StoreConnection, StoreError, StoreResult};
use crate::db::{open_db_with_timeout, DbError};
use crate::model::{EntityMapping, FieldValue, Fields};
use log::{debug, info};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File-backed SQLite store; every connection opens the same database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        open_db_with_timeout(&self.path, self.busy_timeout).map_err(|err| match err {
            DbError::Sqlite(inner) => StoreError::Connection(format!(
                "cannot open `{}`: {inner}",
                self.path.display()
            )),
            other => StoreError::Db(other),
        })
    }
}

impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn register(&self, mapping: &'static EntityMapping) -> StoreResult<()> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_table_info(?1);")
            .map_err(|err| classify(mapping.table, err))?;
        let present = stmt
            .query_map([mapping.table], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<Result<HashSet<_>, _>>())
            .map_err(|err| classify(mapping.table, err))?;

        if present.is_empty() {
            return Err(StoreError::UnknownTable(mapping.table));
        }
        let required =
            std::iter::once(mapping.identity_column).chain(mapping.columns.iter().copied());
        for column in required {
            if !present.contains(column) {
                return Err(StoreError::InvalidData(format!(
                    "table `{}` has no column `{column}`",
                    mapping.table
                )));
            }
        }

        info!(
            "event=store_register module=store status=ok backend=sqlite table={}",
            mapping.table
        );
        Ok(())
    }

    fn connect(&self) -> StoreResult<Box<dyn StoreConnection>> {
        Ok(Box::new(SqliteConnection { conn: self.open()? }))
    }
}

struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    fn execute_control(&self, sql: &str) -> StoreResult<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|err| classify("<transaction>", err))
    }
}

impl StoreConnection for SqliteConnection {
    fn begin(&mut self, isolation: Isolation) -> StoreResult<()> {
        if self.in_transaction() {
            return Err(StoreError::TransactionState("transaction already open"));
        }
        let sql = match isolation {
            Isolation::Deferred => "BEGIN DEFERRED;",
            Isolation::Immediate => "BEGIN IMMEDIATE;",
            Isolation::Exclusive => "BEGIN EXCLUSIVE;",
        };
        self.execute_control(sql)
    }

    fn commit(&mut self) -> StoreResult<()> {
        if !self.in_transaction() {
            return Err(StoreError::TransactionState("no open transaction to commit"));
        }
        self.execute_control("COMMIT;")
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.execute_control("ROLLBACK;")
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn select(
        &mut self,
        mapping: &'static EntityMapping,
        identity: i64,
    ) -> StoreResult<Option<Fields>> {
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE \"{}\" = ?1;",
            column_list(mapping.columns),
            mapping.table,
            mapping.identity_column
        );
        debug!("event=store_select module=store table={} id={}", mapping.table, identity);

        let row = self
            .conn
            .query_row(&sql, [identity], |row| {
                mapping
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(index, column)| Ok::<_, rusqlite::Error>((*column, row.get::<_, Value>(index)?)))
                    .collect::<Result<Vec<_>, rusqlite::Error>>()
            })
            .optional()
            .map_err(|err| classify(mapping.table, err))?;

        row.map(|values| {
            values
                .into_iter()
                .map(|(column, value)| Ok((column, from_sql_value(mapping, column, value)?)))
                .collect::<StoreResult<Fields>>()
        })
        .transpose()
    }

    fn insert(
        &mut self,
        mapping: &'static EntityMapping,
        identity: Option<i64>,
        fields: &Fields,
    ) -> StoreResult<i64> {
        let mut columns: Vec<&'static str> = Vec::with_capacity(mapping.columns.len() + 1);
        let mut values: Vec<Value> = Vec::with_capacity(mapping.columns.len() + 1);
        if let Some(id) = identity {
            columns.push(mapping.identity_column);
            values.push(Value::Integer(id));
        }
        for column in mapping.columns {
            columns.push(*column);
            values.push(to_sql_value(fields.get(column).unwrap_or(&FieldValue::Null)));
        }

        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({placeholders});",
            mapping.table,
            column_list(&columns)
        );

        self.conn
            .execute(&sql, params_from_iter(values))
            .map_err(|err| classify(mapping.table, err))?;
        Ok(identity.unwrap_or_else(|| self.conn.last_insert_rowid()))
    }

    fn update(
        &mut self,
        mapping: &'static EntityMapping,
        identity: i64,
        fields: &Fields,
    ) -> StoreResult<bool> {
        if fields.is_empty() {
            return Ok(self.select(mapping, identity)?.is_some());
        }

        let assignments = fields
            .keys()
            .enumerate()
            .map(|(index, column)| format!("\"{column}\" = ?{}", index + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE \"{}\" SET {assignments} WHERE \"{}\" = ?{};",
            mapping.table,
            mapping.identity_column,
            fields.len() + 1
        );
        let mut values = fields.values().map(to_sql_value).collect::<Vec<_>>();
        values.push(Value::Integer(identity));

        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .map_err(|err| classify(mapping.table, err))?;
        Ok(changed > 0)
    }

    fn delete(&mut self, mapping: &'static EntityMapping, identity: i64) -> StoreResult<bool> {
        let sql = format!(
            "DELETE FROM \"{}\" WHERE \"{}\" = ?1;",
            mapping.table, mapping.identity_column
        );
        let changed = self
            .conn
            .execute(&sql, [identity])
            .map_err(|err| classify(mapping.table, err))?;
        Ok(changed > 0)
    }
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|column| format!("\"{column}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Integer(value) => Value::Integer(*value),
        FieldValue::Text(value) => Value::Text(value.clone()),
    }
}

fn from_sql_value(
    mapping: &EntityMapping,
    column: &'static str,
    value: Value,
) -> StoreResult<FieldValue> {
    match value {
        Value::Null => Ok(FieldValue::Null),
        Value::Integer(value) => Ok(FieldValue::Integer(value)),
        Value::Text(value) => Ok(FieldValue::Text(value)),
        Value::Real(_) | Value::Blob(_) => Err(StoreError::InvalidData(format!(
            "unsupported value type in {}.{column}",
            mapping.table
        ))),
    }
}

fn classify(table: &'static str, err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Constraint {
            table,
            message: err.to_string(),
        },
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            StoreError::Conflict(err.to_string())
        }
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase) => {
            StoreError::Connection(err.to_string())
        }
        _ => StoreError::Db(DbError::Sqlite(err)),
    }
}
