//! The schema registry, persisted as JSON in `catalog.dat`.
//!
//! The whole catalog is loaded at startup, held in memory as strongly
//! typed records, and rewritten atomically (temp file, fsync, rename) on
//! every DDL change. Concurrency is the caller's job: the engine wraps the
//! catalog in a reader-writer lock — DDL takes it exclusively, DML takes
//! it shared.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DbResult};
use crate::schema::Schema;
use crate::types::DataType;

pub const CATALOG_FILE: &str = "catalog.dat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: u32,
    pub name: String,
    pub schema: Schema,
    /// Heap file name, relative to the data directory.
    pub file: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    /// Position of the indexed column in the table schema.
    pub column: usize,
    pub key_type: DataType,
    pub unique: bool,
    /// Index file name, relative to the data directory.
    pub file: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Catalog {
    version: u32,
    next_table_id: u32,
    tables: BTreeMap<String, TableInfo>,
    indexes: BTreeMap<String, IndexInfo>,
    #[serde(skip)]
    path: PathBuf,
}

impl Catalog {
    /// Load the catalog, or start empty when the file does not exist yet.
    pub fn load(data_dir: &Path) -> DbResult<Self> {
        let path = data_dir.join(CATALOG_FILE);
        if !path.exists() {
            return Ok(Self {
                version: 1,
                next_table_id: 1,
                tables: BTreeMap::new(),
                indexes: BTreeMap::new(),
                path,
            });
        }
        let file = File::open(&path).map_err(strata::errors::StorageError::Io)?;
        let mut catalog: Catalog = serde_json::from_reader(file)?;
        catalog.path = path;
        info!(
            "catalog loaded: {} tables, {} indexes",
            catalog.tables.len(),
            catalog.indexes.len()
        );
        Ok(catalog)
    }

    /// Atomically persist the catalog: write a temp file, fsync, rename.
    pub fn save(&self) -> DbResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(strata::errors::StorageError::Io)?;
            let body = serde_json::to_vec_pretty(self)?;
            tmp.write_all(&body)
                .and_then(|_| tmp.sync_all())
                .map_err(strata::errors::StorageError::Io)?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(strata::errors::StorageError::Io)?;
        Ok(())
    }

    // ── Tables ────────────────────────────────────────────────────────

    pub fn create_table(&mut self, name: &str, schema: Schema) -> DbResult<TableInfo> {
        schema.validate_definition()?;
        if self.tables.contains_key(name) {
            return Err(DbError::DuplicateTable(name.to_string()));
        }
        let info = TableInfo {
            id: self.next_table_id,
            name: name.to_string(),
            schema,
            file: format!("{name}.tbl"),
            created_at: Utc::now(),
        };
        self.next_table_id += 1;
        self.tables.insert(name.to_string(), info.clone());
        self.save()?;
        info!("created table '{name}' (id {})", info.id);
        Ok(info)
    }

    /// Remove a table and all indexes defined on it. Returns the dropped
    /// definitions so the engine can remove their files.
    pub fn drop_table(&mut self, name: &str) -> DbResult<(TableInfo, Vec<IndexInfo>)> {
        let table = self
            .tables
            .remove(name)
            .ok_or_else(|| DbError::UnknownTable(name.to_string()))?;
        let doomed: Vec<String> = self
            .indexes
            .values()
            .filter(|ix| ix.table == name)
            .map(|ix| ix.name.clone())
            .collect();
        let dropped = doomed
            .iter()
            .filter_map(|ix| self.indexes.remove(ix))
            .collect();
        self.save()?;
        info!("dropped table '{name}'");
        Ok((table, dropped))
    }

    pub fn get_table(&self, name: &str) -> DbResult<&TableInfo> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::UnknownTable(name.to_string()))
    }

    pub fn list_tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    // ── Indexes ───────────────────────────────────────────────────────

    pub fn create_index(
        &mut self,
        name: &str,
        table: &str,
        column: &str,
        unique: bool,
    ) -> DbResult<IndexInfo> {
        if self.indexes.contains_key(name) {
            return Err(DbError::DuplicateIndex(name.to_string()));
        }
        let table_info = self.get_table(table)?;
        let column_index = table_info.schema.column_index(column)?;
        let key_type = table_info.schema.columns[column_index].data_type;

        let info = IndexInfo {
            name: name.to_string(),
            table: table.to_string(),
            column: column_index,
            key_type,
            unique,
            file: format!("{name}.idx"),
        };
        self.indexes.insert(name.to_string(), info.clone());
        self.save()?;
        info!("created index '{name}' on {table}({column})");
        Ok(info)
    }

    pub fn drop_index(&mut self, name: &str) -> DbResult<IndexInfo> {
        let info = self
            .indexes
            .remove(name)
            .ok_or_else(|| DbError::UnknownIndex(name.to_string()))?;
        self.save()?;
        info!("dropped index '{name}'");
        Ok(info)
    }

    pub fn get_index(&self, name: &str) -> DbResult<&IndexInfo> {
        self.indexes
            .get(name)
            .ok_or_else(|| DbError::UnknownIndex(name.to_string()))
    }

    pub fn list_indexes(&self) -> impl Iterator<Item = &IndexInfo> {
        self.indexes.values()
    }

    /// All indexes defined on `table`.
    pub fn indexes_of(&self, table: &str) -> Vec<IndexInfo> {
        self.indexes
            .values()
            .filter(|ix| ix.table == table)
            .cloned()
            .collect()
    }
}
