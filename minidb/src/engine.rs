//! The engine: catalog, WAL, transaction manager, lock manager, and the
//! open heap/index handles, bundled into one process-wide object.
//!
//! The engine is the thin contract the external executor consumes: row
//! CRUD and scans under two-phase locking, index lookups, DDL, and the
//! transaction lifecycle. It runs recovery on open and flushes the WAL on
//! drop.
//!
//! Write protocol per mutation: take locks, apply the change to the page
//! through the buffer pool, append the WAL record, stamp the page LSN.
//! Commit appends COMMIT and fsyncs *before* pages are flushed, so
//! recovery can always redo; rollback undoes from the WAL chain, flushes
//! the undone pages, and only then logs ROLLBACK.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};

use strata::failpoint;
use strata::lock_manager::{LockManager, LockMode, LockTarget};
use strata::transaction::TransactionManager;
use strata::wal::{Lsn, WalManager, WalRecord, NULL_LSN};
use strata::{Rid, SlotId, TxnId};

use crate::catalog::{Catalog, IndexInfo, TableInfo};
use crate::codec;
use crate::config::EngineConfig;
use crate::errors::{DbError, DbResult};
use crate::heap::HeapFile;
use crate::index::Index;
use crate::recovery;
use crate::schema::Schema;
use crate::types::Value;

/// Cooperative cancellation flag for long scans. Cloned freely; any clone
/// can cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Engine {
    config: EngineConfig,
    catalog: RwLock<Catalog>,
    wal: Mutex<WalManager>,
    tm: TransactionManager,
    lm: LockManager,
    heaps: Mutex<HashMap<String, Arc<HeapFile>>>,
    indexes: Mutex<HashMap<String, Arc<Index>>>,
    closed: AtomicBool,
}

impl Engine {
    /// Open the engine: load the catalog, run crash recovery, rebuild any
    /// indexes the recovered work may have left stale.
    pub fn open(config: EngineConfig) -> DbResult<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(strata::errors::StorageError::Io)?;
        let catalog = Catalog::load(&config.data_dir)?;
        let mut wal = WalManager::open(config.wal_path(), config.wal_sync)?;

        let outcome = recovery::recover(&config.data_dir, &mut wal, &catalog)?;

        let engine = Self {
            tm: TransactionManager::new(outcome.next_txn_id),
            lm: LockManager::new(),
            catalog: RwLock::new(catalog),
            wal: Mutex::new(wal),
            heaps: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
            config,
            closed: AtomicBool::new(false),
        };

        for table in &outcome.touched_tables {
            engine.rebuild_indexes(table)?;
        }
        info!(
            "engine open at {:?} (recovered {} txns, next txn id {})",
            engine.config.data_dir, outcome.committed_txns, outcome.next_txn_id
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared view of the catalog (what DML takes; DDL goes through the
    /// engine methods, which take it exclusively).
    pub fn catalog(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap()
    }

    // ── Handles ───────────────────────────────────────────────────────

    fn heap(&self, table: &str) -> DbResult<Arc<HeapFile>> {
        let mut heaps = self.heaps.lock().unwrap();
        if let Some(heap) = heaps.get(table) {
            return Ok(Arc::clone(heap));
        }
        let info = self.catalog.read().unwrap().get_table(table)?.clone();
        let heap = Arc::new(HeapFile::open(self.config.data_dir.join(&info.file))?);
        heaps.insert(table.to_string(), Arc::clone(&heap));
        Ok(heap)
    }

    fn index(&self, name: &str) -> DbResult<Arc<Index>> {
        let mut indexes = self.indexes.lock().unwrap();
        if let Some(index) = indexes.get(name) {
            return Ok(Arc::clone(index));
        }
        let info = self.catalog.read().unwrap().get_index(name)?.clone();
        let index = Arc::new(Index::open(&self.config.data_dir, info)?);
        indexes.insert(name.to_string(), Arc::clone(&index));
        Ok(index)
    }

    fn table_meta(&self, table: &str) -> DbResult<(TableInfo, Vec<IndexInfo>)> {
        let catalog = self.catalog.read().unwrap();
        let info = catalog.get_table(table)?.clone();
        let indexes = catalog.indexes_of(table);
        Ok((info, indexes))
    }

    fn lock(&self, txn: TxnId, target: LockTarget, mode: LockMode) -> DbResult<()> {
        self.lm.lock(txn, target, mode).map_err(DbError::from)
    }

    fn log(&self, txn: TxnId, record: WalRecord) -> DbResult<Lsn> {
        let prev = self.tm.last_lsn(txn);
        let lsn = self.wal.lock().unwrap().append(txn, prev, &record)?;
        self.tm.record_lsn(txn, lsn);
        Ok(lsn)
    }

    // ── Transactions ──────────────────────────────────────────────────

    pub fn begin(&self) -> TxnId {
        self.tm.begin()
    }

    /// Commit: COMMIT record durable first, then dirty pages, then locks.
    pub fn commit(&self, txn: TxnId) -> DbResult<()> {
        self.tm.begin_commit(txn)?;

        if let Err(e) = failpoint::maybe_fail("engine.commit.before_wal") {
            self.tm.fail_commit(txn)?;
            return Err(strata::errors::StorageError::Io(e).into());
        }
        if let Err(e) = self.log(txn, WalRecord::Commit) {
            self.tm.fail_commit(txn)?;
            return Err(e);
        }

        // The transaction is durably committed from here on. A failed page
        // flush is survivable: recovery replays from the WAL.
        let flush_result = (|| -> DbResult<()> {
            failpoint::maybe_fail("engine.commit.before_flush")
                .map_err(strata::errors::StorageError::Io)?;
            self.flush_data()
        })();
        if let Err(e) = flush_result {
            warn!("page flush after commit of txn {txn} failed: {e}; recovery will redo");
        }

        self.tm.finish_commit(txn)?;
        self.lm.unlock_all(txn);
        debug!("txn {txn} committed");
        Ok(())
    }

    /// Roll back: undo from the WAL chain in reverse, flush the undone
    /// pages, then log ROLLBACK and release locks.
    pub fn rollback(&self, txn: TxnId) -> DbResult<()> {
        self.tm.begin_abort(txn)?;

        let undo_result = self.undo_chain(txn);

        // Even a partially failed undo releases the transaction; the
        // error, if any, is reported after the bookkeeping settles.
        if let Err(e) = self.flush_data() {
            warn!("flush during rollback of txn {txn} failed: {e}");
        }
        let log_result = self.log(txn, WalRecord::Rollback);
        self.tm.finish_abort(txn)?;
        self.lm.unlock_all(txn);
        debug!("txn {txn} rolled back");

        undo_result?;
        log_result?;
        Ok(())
    }

    fn undo_chain(&self, txn: TxnId) -> DbResult<()> {
        let mut lsn = self.tm.last_lsn(txn);
        while lsn != NULL_LSN {
            let entry = self.wal.lock().unwrap().read_record(lsn)?;
            let Some(entry) = entry else { break };
            debug_assert_eq!(entry.txn_id, txn, "prev-lsn chain crossed transactions");

            match &entry.record {
                WalRecord::Insert { table, rid, tuple } => {
                    self.undo_insert(table, *rid, tuple)?;
                }
                WalRecord::Update {
                    table,
                    rid,
                    before,
                    after,
                } => {
                    self.undo_update(table, *rid, before, after)?;
                }
                WalRecord::Delete { table, rid, tuple } => {
                    self.undo_delete(table, *rid, tuple)?;
                }
                _ => {}
            }
            lsn = entry.prev_lsn;
        }
        Ok(())
    }

    fn undo_insert(&self, table: &str, rid: Rid, tuple: &[u8]) -> DbResult<()> {
        let Ok((info, indexes)) = self.table_meta(table) else {
            warn!("undo: table '{table}' no longer exists, skipping");
            return Ok(());
        };
        let heap = self.heap(table)?;
        heap.delete(rid)?;
        let row = codec::decode(&info.schema, tuple)?;
        for ix in &indexes {
            let value = &row[ix.column];
            if !value.is_null() {
                self.index(&ix.name)?.delete(value, rid)?;
            }
        }
        Ok(())
    }

    fn undo_update(&self, table: &str, rid: Rid, before: &[u8], after: &[u8]) -> DbResult<()> {
        let Ok((info, indexes)) = self.table_meta(table) else {
            warn!("undo: table '{table}' no longer exists, skipping");
            return Ok(());
        };
        let heap = self.heap(table)?;
        if heap.update(rid, before)?.is_none() {
            warn!("undo: no row at {rid} in '{table}' to revert");
        }
        let old_row = codec::decode(&info.schema, before)?;
        let new_row = codec::decode(&info.schema, after)?;
        for ix in &indexes {
            let old_v = &old_row[ix.column];
            let new_v = &new_row[ix.column];
            if old_v == new_v {
                continue;
            }
            if !new_v.is_null() {
                self.index(&ix.name)?.delete(new_v, rid)?;
            }
            if !old_v.is_null() {
                self.index(&ix.name)?.insert(old_v, rid)?;
            }
        }
        Ok(())
    }

    fn undo_delete(&self, table: &str, rid: Rid, tuple: &[u8]) -> DbResult<()> {
        let Ok((info, indexes)) = self.table_meta(table) else {
            warn!("undo: table '{table}' no longer exists, skipping");
            return Ok(());
        };
        let heap = self.heap(table)?;
        // Another transaction can have reused the freed slot; the
        // resurrected row then lands at a fresh RID.
        let restored_rid = if heap.restore_at(rid, tuple)? {
            rid
        } else {
            heap.insert(tuple)?
        };
        let row = codec::decode(&info.schema, tuple)?;
        for ix in &indexes {
            let value = &row[ix.column];
            if !value.is_null() {
                self.index(&ix.name)?.insert(value, restored_rid)?;
            }
        }
        Ok(())
    }

    // ── Row operations ────────────────────────────────────────────────

    pub fn insert(&self, txn: TxnId, table: &str, row: &[Value]) -> DbResult<Rid> {
        self.tm.ensure_active(txn)?;
        let (info, indexes) = self.table_meta(table)?;
        info.schema.validate_row(row)?;

        self.lock(txn, LockTarget::Table(info.id), LockMode::IntentExclusive)?;

        for ix in indexes.iter().filter(|ix| ix.unique) {
            let value = &row[ix.column];
            if !value.is_null() && self.index(&ix.name)?.contains(value)? {
                return Err(strata::errors::IndexError::DuplicateKey.into());
            }
        }

        let tuple = codec::encode(&info.schema, row)?;
        let heap = self.heap(table)?;
        let rid = heap.insert(&tuple)?;
        self.lock(txn, LockTarget::Row(info.id, rid), LockMode::Exclusive)?;

        let lsn = self.log(
            txn,
            WalRecord::Insert {
                table: table.to_string(),
                rid,
                tuple: tuple.clone(),
            },
        )?;
        heap.stamp_lsn(rid.page_id, lsn)?;

        for (i, ix) in indexes.iter().enumerate() {
            let value = &row[ix.column];
            if value.is_null() {
                continue;
            }
            if let Err(e) = self.index(&ix.name)?.insert(value, rid) {
                // Lost a race on a unique key: take the row back out and
                // log the reversal so redo stays consistent.
                for prior in &indexes[..i] {
                    let v = &row[prior.column];
                    if !v.is_null() {
                        self.index(&prior.name)?.delete(v, rid)?;
                    }
                }
                heap.delete(rid)?;
                let lsn = self.log(
                    txn,
                    WalRecord::Delete {
                        table: table.to_string(),
                        rid,
                        tuple,
                    },
                )?;
                heap.stamp_lsn(rid.page_id, lsn)?;
                return Err(e);
            }
        }
        Ok(rid)
    }

    pub fn get(&self, txn: TxnId, table: &str, rid: Rid) -> DbResult<Option<Vec<Value>>> {
        self.tm.ensure_active(txn)?;
        let (info, _) = self.table_meta(table)?;
        self.lock(txn, LockTarget::Table(info.id), LockMode::IntentShared)?;
        self.lock(txn, LockTarget::Row(info.id, rid), LockMode::Shared)?;

        let heap = self.heap(table)?;
        match heap.get(rid)? {
            Some(tuple) => Ok(Some(codec::decode(&info.schema, &tuple)?)),
            None => Ok(None),
        }
    }

    /// Update the row at `rid`. Returns the row's RID afterwards, which
    /// differs from `rid` when the new image forced a move to another
    /// page; all indexes are repointed either way.
    pub fn update(&self, txn: TxnId, table: &str, rid: Rid, row: &[Value]) -> DbResult<Rid> {
        self.tm.ensure_active(txn)?;
        let (info, indexes) = self.table_meta(table)?;
        info.schema.validate_row(row)?;

        self.lock(txn, LockTarget::Table(info.id), LockMode::IntentExclusive)?;
        self.lock(txn, LockTarget::Row(info.id, rid), LockMode::Exclusive)?;

        let heap = self.heap(table)?;
        let before = heap.get(rid)?.ok_or(DbError::RowNotFound(rid))?;
        let old_row = codec::decode(&info.schema, &before)?;

        for ix in indexes.iter().filter(|ix| ix.unique) {
            let new_v = &row[ix.column];
            if new_v.is_null() || new_v == &old_row[ix.column] {
                continue;
            }
            if self.index(&ix.name)?.contains(new_v)? {
                return Err(strata::errors::IndexError::DuplicateKey.into());
            }
        }

        let after = codec::encode(&info.schema, row)?;
        let new_rid = heap
            .update(rid, &after)?
            .ok_or(DbError::RowNotFound(rid))?;

        if new_rid == rid {
            let lsn = self.log(
                txn,
                WalRecord::Update {
                    table: table.to_string(),
                    rid,
                    before: before.clone(),
                    after: after.clone(),
                },
            )?;
            heap.stamp_lsn(rid.page_id, lsn)?;
        } else {
            // The move is logged as delete + insert so each record names
            // the page it actually touched.
            self.lock(txn, LockTarget::Row(info.id, new_rid), LockMode::Exclusive)?;
            let lsn = self.log(
                txn,
                WalRecord::Delete {
                    table: table.to_string(),
                    rid,
                    tuple: before.clone(),
                },
            )?;
            heap.stamp_lsn(rid.page_id, lsn)?;
            let lsn = self.log(
                txn,
                WalRecord::Insert {
                    table: table.to_string(),
                    rid: new_rid,
                    tuple: after.clone(),
                },
            )?;
            heap.stamp_lsn(new_rid.page_id, lsn)?;
        }

        for ix in &indexes {
            let old_v = &old_row[ix.column];
            let new_v = &row[ix.column];
            if old_v == new_v && new_rid == rid {
                continue;
            }
            if !old_v.is_null() {
                self.index(&ix.name)?.delete(old_v, rid)?;
            }
            if !new_v.is_null() {
                self.index(&ix.name)?.insert(new_v, new_rid)?;
            }
        }
        Ok(new_rid)
    }

    pub fn delete(&self, txn: TxnId, table: &str, rid: Rid) -> DbResult<()> {
        self.tm.ensure_active(txn)?;
        let (info, indexes) = self.table_meta(table)?;

        self.lock(txn, LockTarget::Table(info.id), LockMode::IntentExclusive)?;
        self.lock(txn, LockTarget::Row(info.id, rid), LockMode::Exclusive)?;

        let heap = self.heap(table)?;
        let before = heap.get(rid)?.ok_or(DbError::RowNotFound(rid))?;
        let old_row = codec::decode(&info.schema, &before)?;

        heap.delete(rid)?;
        let lsn = self.log(
            txn,
            WalRecord::Delete {
                table: table.to_string(),
                rid,
                tuple: before,
            },
        )?;
        heap.stamp_lsn(rid.page_id, lsn)?;

        for ix in &indexes {
            let value = &old_row[ix.column];
            if !value.is_null() {
                self.index(&ix.name)?.delete(value, rid)?;
            }
        }
        Ok(())
    }

    /// Full-table scan in ascending RID order. Rows are share-locked as
    /// they are yielded; the iterator is restartable by calling `scan`
    /// again.
    pub fn scan(&self, txn: TxnId, table: &str) -> DbResult<TableScan<'_>> {
        self.tm.ensure_active(txn)?;
        let (info, _) = self.table_meta(table)?;
        self.lock(txn, LockTarget::Table(info.id), LockMode::IntentShared)?;
        let heap = self.heap(table)?;
        Ok(TableScan {
            engine: self,
            heap,
            schema: info.schema,
            table_id: info.id,
            txn,
            page_id: 1,
            slot_id: 0,
            cancel: None,
            done: false,
        })
    }

    // ── Index access ──────────────────────────────────────────────────

    /// Point lookup: RIDs matching `key` (several for non-unique
    /// indexes), each share-locked.
    pub fn index_search(&self, txn: TxnId, index: &str, key: &Value) -> DbResult<Vec<Rid>> {
        self.tm.ensure_active(txn)?;
        let ix = self.index(index)?;
        let (info, _) = self.table_meta(&ix.info().table.clone())?;
        self.lock(txn, LockTarget::Table(info.id), LockMode::IntentShared)?;

        let rids = ix.search(key)?;
        for &rid in &rids {
            self.lock(txn, LockTarget::Row(info.id, rid), LockMode::Shared)?;
        }
        Ok(rids)
    }

    /// Ordered range scan via the index leaves; bounds are `(value,
    /// inclusive)`, open when `None`.
    pub fn index_range(
        &self,
        txn: TxnId,
        index: &str,
        lo: Option<(&Value, bool)>,
        hi: Option<(&Value, bool)>,
    ) -> DbResult<Vec<(Value, Rid)>> {
        self.tm.ensure_active(txn)?;
        let ix = self.index(index)?;
        let (info, _) = self.table_meta(&ix.info().table.clone())?;
        self.lock(txn, LockTarget::Table(info.id), LockMode::IntentShared)?;

        let pairs = ix.range(lo, hi)?;
        for (_, rid) in &pairs {
            self.lock(txn, LockTarget::Row(info.id, *rid), LockMode::Shared)?;
        }
        Ok(pairs)
    }

    // ── DDL ───────────────────────────────────────────────────────────

    pub fn create_table(&self, name: &str, schema: Schema) -> DbResult<()> {
        schema.validate_definition()?;
        let mut catalog = self.catalog.write().unwrap();
        let info = catalog.create_table(name, schema.clone())?;
        match HeapFile::create(self.config.data_dir.join(&info.file), name, schema) {
            Ok(heap) => {
                self.heaps
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), Arc::new(heap));
                Ok(())
            }
            Err(e) => {
                catalog.drop_table(name)?;
                Err(e)
            }
        }
    }

    pub fn drop_table(&self, name: &str) -> DbResult<()> {
        let mut catalog = self.catalog.write().unwrap();
        let (table, indexes) = catalog.drop_table(name)?;
        drop(catalog);

        self.heaps.lock().unwrap().remove(name);
        let mut index_handles = self.indexes.lock().unwrap();
        for ix in &indexes {
            index_handles.remove(&ix.name);
        }
        drop(index_handles);

        remove_file_best_effort(&self.config.data_dir.join(&table.file));
        for ix in &indexes {
            remove_file_best_effort(&self.config.data_dir.join(&ix.file));
        }
        Ok(())
    }

    /// Create an index and backfill it from a full scan. A unique
    /// violation in existing data aborts the creation.
    pub fn create_index(
        &self,
        name: &str,
        table: &str,
        column: &str,
        unique: bool,
    ) -> DbResult<()> {
        // Resolve the heap before taking the catalog exclusively; the
        // handle cache would otherwise re-enter the catalog lock.
        let heap = self.heap(table)?;
        let schema = heap.schema().clone();

        let mut catalog = self.catalog.write().unwrap();
        let info = catalog.create_index(name, table, column, unique)?;

        let built = (|| -> DbResult<Index> {
            let index = Index::create(&self.config.data_dir, info.clone())?;
            for item in heap.scan() {
                let (rid, tuple) = item?;
                let row = codec::decode(&schema, &tuple)?;
                let value = &row[info.column];
                if !value.is_null() {
                    index.insert(value, rid)?;
                }
            }
            index.flush()?;
            Ok(index)
        })();

        match built {
            Ok(index) => {
                self.indexes
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), Arc::new(index));
                Ok(())
            }
            Err(e) => {
                catalog.drop_index(name)?;
                remove_file_best_effort(&self.config.data_dir.join(&info.file));
                Err(e)
            }
        }
    }

    pub fn drop_index(&self, name: &str) -> DbResult<()> {
        let mut catalog = self.catalog.write().unwrap();
        let info = catalog.drop_index(name)?;
        drop(catalog);
        self.indexes.lock().unwrap().remove(name);
        remove_file_best_effort(&self.config.data_dir.join(&info.file));
        Ok(())
    }

    /// Rebuild every index of `table` from a fresh heap scan.
    fn rebuild_indexes(&self, table: &str) -> DbResult<()> {
        let infos = {
            let catalog = self.catalog.read().unwrap();
            if catalog.get_table(table).is_err() {
                return Ok(());
            }
            catalog.indexes_of(table)
        };
        if infos.is_empty() {
            return Ok(());
        }

        let heap = self.heap(table)?;
        let schema = heap.schema().clone();
        for info in infos {
            debug!("rebuilding index '{}' after recovery", info.name);
            remove_file_best_effort(&self.config.data_dir.join(&info.file));
            let index = Index::create(&self.config.data_dir, info.clone())?;
            for item in heap.scan() {
                let (rid, tuple) = item?;
                let row = codec::decode(&schema, &tuple)?;
                let value = &row[info.column];
                if !value.is_null() {
                    index.insert(value, rid)?;
                }
            }
            index.flush()?;
            self.indexes
                .lock()
                .unwrap()
                .insert(info.name.clone(), Arc::new(index));
        }
        Ok(())
    }

    // ── Shutdown ──────────────────────────────────────────────────────

    fn flush_data(&self) -> DbResult<()> {
        let heaps: Vec<Arc<HeapFile>> = self.heaps.lock().unwrap().values().cloned().collect();
        for heap in heaps {
            heap.flush()?;
        }
        let indexes: Vec<Arc<Index>> = self.indexes.lock().unwrap().values().cloned().collect();
        for index in indexes {
            index.flush()?;
        }
        Ok(())
    }

    /// Flush everything and, when no transactions are in flight, write a
    /// checkpoint and truncate the WAL.
    pub fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if failpoint::is_enabled("engine.close.crash") {
            // Simulated crash: leave pages and the log exactly as they are.
            return Ok(());
        }
        self.flush_data()?;
        let mut wal = self.wal.lock().unwrap();
        if self.tm.live_txns().is_empty() {
            let ckpt = wal.append(0, NULL_LSN, &WalRecord::Checkpoint)?;
            wal.flush()?;
            wal.truncate_to(ckpt)?;
        } else {
            wal.flush()?;
        }
        info!("engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("engine close failed: {e}");
        }
    }
}

fn remove_file_best_effort(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove {path:?}: {e}");
        }
    }
}

/// Pull-based full-table scan. Checks its cancel token between rows.
pub struct TableScan<'a> {
    engine: &'a Engine,
    heap: Arc<HeapFile>,
    schema: Schema,
    table_id: u32,
    txn: TxnId,
    page_id: strata::PageId,
    slot_id: SlotId,
    cancel: Option<CancelToken>,
    done: bool,
}

impl TableScan<'_> {
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn step(&mut self) -> DbResult<Option<(Rid, Vec<Value>)>> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(DbError::Cancelled);
            }
        }
        let Some((rid, tuple)) = self.heap.next_live(self.page_id, self.slot_id)? else {
            return Ok(None);
        };
        self.engine.lock(
            self.txn,
            LockTarget::Row(self.table_id, rid),
            LockMode::Shared,
        )?;
        self.page_id = rid.page_id;
        self.slot_id = rid.slot_id + 1;
        let row = codec::decode(&self.schema, &tuple)?;
        Ok(Some((rid, row)))
    }
}

impl Iterator for TableScan<'_> {
    type Item = DbResult<(Rid, Vec<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
