//! Table schemas: an ordered list of typed, optionally nullable columns.
//! Column identity is positional; renames are not supported. Schemas are
//! serialized as JSON into the table file header page and the catalog.

use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DbResult};
use crate::types::{DataType, Value};

/// Hard cap imposed by the tuple codec's 16-bit null bitmap.
pub const MAX_COLUMNS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Zero-based index of a column by (case-insensitive) name.
    pub fn column_index(&self, name: &str) -> DbResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DbError::UnknownColumn(name.to_string()))
    }

    /// Check a schema is usable at CREATE TABLE time.
    pub fn validate_definition(&self) -> DbResult<()> {
        if self.columns.len() > MAX_COLUMNS {
            return Err(DbError::TooManyColumns {
                max: MAX_COLUMNS,
                found: self.columns.len(),
            });
        }
        for (i, col) in self.columns.iter().enumerate() {
            let duplicate = self.columns[..i]
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&col.name));
            if duplicate {
                return Err(DbError::DuplicateColumn(col.name.clone()));
            }
        }
        Ok(())
    }

    /// Check a row of values against arity, NOT NULL constraints, and
    /// column types.
    pub fn validate_row(&self, row: &[Value]) -> DbResult<()> {
        if row.len() != self.columns.len() {
            return Err(DbError::ArityMismatch {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        for (col, value) in self.columns.iter().zip(row) {
            if value.is_null() {
                if !col.nullable {
                    return Err(DbError::NullViolation(col.name.clone()));
                }
                continue;
            }
            if !value.matches(col.data_type) {
                return Err(DbError::TypeMismatch {
                    column: col.name.clone(),
                    expected: col.data_type,
                    found: value.type_name(),
                });
            }
        }
        Ok(())
    }
}
