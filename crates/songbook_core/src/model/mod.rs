//! Entity records and their mapping metadata.
//!
//! # Responsibility
//! - Define the scalar field representation shared by snapshots, diffs and
//!   store rows.
//! - Define the traits a type implements to be tracked by a session.
//!
//! # Invariants
//! - A record's identity is assigned by the store (or supplied once at
//!   construction) and never changed afterwards by caller code.
//! - `Record::fields()` never includes the identity column.
//!
//! # See also
//! - `crate::session` for the tracking rules built on these traits.

pub mod song;

use song::Song;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use regex::Regex;

/// Scalar column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Text(String),
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "'{value}'"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Every entity mapping the session factory registers.
pub const MAPPED_ENTITIES: &[&EntityMapping] = &[<Song as Entity>::MAPPING];

/// Column name to value map, ordered by column name.
pub type Fields = BTreeMap<&'static str, FieldValue>;

/// Returns the columns whose values differ between `snapshot` and `current`,
/// carrying the current values.
pub fn diff_fields(snapshot: &Fields, current: &Fields) -> Fields {
    current
        .iter()
        .filter(|(column, value)| snapshot.get(*column) != Some(*value))
        .map(|(column, value)| (*column, value.clone()))
        .collect()
}

/// Static table mapping for one entity type.
///
/// The store assigns the identity on insert unless the record carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMapping {
    pub table: &'static str,
    pub identity_column: &'static str,
    /// Mapped non-identity columns.
    pub columns: &'static [&'static str],
}

impl EntityMapping {
    /// Checks that every identifier is safe to quote into generated SQL.
    pub fn validate(&self) -> Result<(), MappingError> {
        let pattern = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
            .map_err(|err| MappingError::Pattern(err.to_string()))?;
        let identifiers = std::iter::once(self.table)
            .chain(std::iter::once(self.identity_column))
            .chain(self.columns.iter().copied());
        for identifier in identifiers {
            if !pattern.is_match(identifier) {
                return Err(MappingError::InvalidIdentifier {
                    table: self.table,
                    identifier: identifier.to_string(),
                });
            }
        }
        if self.columns.contains(&self.identity_column) {
            return Err(MappingError::IdentityColumnMapped {
                table: self.table,
                column: self.identity_column,
            });
        }
        Ok(())
    }
}

/// Mapping metadata or row-shape problems.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("invalid identifier `{identifier}` in mapping for table `{table}`")]
    InvalidIdentifier {
        table: &'static str,
        identifier: String,
    },
    #[error("identity column `{column}` of table `{table}` must not be listed as a field")]
    IdentityColumnMapped {
        table: &'static str,
        column: &'static str,
    },
    #[error("column `{column}` of table `{table}` is missing")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("column `{column}` of table `{table}` holds unexpected value {value}")]
    UnexpectedValue {
        table: &'static str,
        column: &'static str,
        value: FieldValue,
    },
    #[error("identifier pattern failed to compile: {0}")]
    Pattern(String),
}

/// Field-level validation failure raised before a write reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("field `{field}` must not be blank")]
    Blank { field: &'static str },
    #[error("field `{field}` exceeds {max} characters (got {actual})")]
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },
}

/// Object-safe view of a mapped record, used by the session's change tracker.
pub trait Record: 'static {
    fn identity(&self) -> Option<i64>;

    /// Sets or clears the identity. Reserved for the owning session; a commit
    /// rejects an attached record whose identity was changed by anyone else.
    fn assign_identity(&mut self, identity: Option<i64>);

    /// Current values of all mapped non-identity columns.
    fn fields(&self) -> Fields;

    /// Overwrites mapped columns from `fields`.
    fn apply_fields(&mut self, fields: &Fields) -> Result<(), MappingError>;

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// A concrete record type that can be materialized from a stored row.
pub trait Entity: Record + Sized {
    const MAPPING: &'static EntityMapping;

    fn from_fields(identity: i64, fields: &Fields) -> Result<Self, MappingError>;
}

/// Reads a required text column from a row.
pub fn text_field(
    mapping: &EntityMapping,
    fields: &Fields,
    column: &'static str,
) -> Result<String, MappingError> {
    match fields.get(column) {
        Some(FieldValue::Text(value)) => Ok(value.clone()),
        Some(other) => Err(MappingError::UnexpectedValue {
            table: mapping.table,
            column,
            value: other.clone(),
        }),
        None => Err(MappingError::MissingColumn {
            table: mapping.table,
            column,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{diff_fields, EntityMapping, FieldValue, Fields, MappingError};

    const BAD_TABLE: EntityMapping = EntityMapping {
        table: "song; DROP TABLE song",
        identity_column: "id",
        columns: &["name"],
    };

    #[test]
    fn diff_reports_only_changed_columns() {
        let mut snapshot = Fields::new();
        snapshot.insert("name", FieldValue::from("Peaches"));
        snapshot.insert("artist", FieldValue::from("Justin"));

        let mut current = snapshot.clone();
        current.insert("name", FieldValue::from("Fine Line"));

        let diff = diff_fields(&snapshot, &current);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.get("name"), Some(&FieldValue::from("Fine Line")));
        assert!(diff_fields(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn mapping_validation_rejects_unsafe_identifiers() {
        let err = BAD_TABLE.validate().unwrap_err();
        assert!(matches!(err, MappingError::InvalidIdentifier { .. }));
    }

    #[test]
    fn mapping_validation_rejects_identity_listed_as_field() {
        let mapping = EntityMapping {
            table: "song",
            identity_column: "id",
            columns: &["id", "name"],
        };
        assert!(matches!(
            mapping.validate(),
            Err(MappingError::IdentityColumnMapped { column: "id", .. })
        ));
    }
}
