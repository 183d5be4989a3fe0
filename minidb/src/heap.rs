//! Heap files: one `.tbl` file per table.
//!
//! Page 0 carries the table name and schema as JSON after the magic and
//! format version; pages 1..N are slotted data pages. Rows are addressed
//! by RID and scanned in ascending `(page_id, slot_id)` order.
//!
//! Inserts start from a cached "last page with free space" hint, fall back
//! to a full sweep, and allocate a new page only when nothing fits —
//! `PageFull` never escapes this module unless a single row exceeds what
//! an empty page can hold.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use strata::errors::StorageError;
use strata::page::MAX_TUPLE_LEN;
use strata::pager::Pager;
use strata::wal::Lsn;
use strata::{BufferPool, PageId, Rid, SlotId};

use crate::errors::{DbError, DbResult};
use crate::schema::Schema;

#[derive(Serialize, Deserialize)]
struct TableHeader {
    name: String,
    schema: Schema,
}

pub struct HeapFile {
    pool: BufferPool,
    name: String,
    schema: Schema,
    path: PathBuf,
    /// Last page that had room, tried first on insert.
    insert_hint: Mutex<PageId>,
}

impl HeapFile {
    /// Create a new table file and write its header page.
    pub fn create<P: AsRef<Path>>(path: P, name: &str, schema: Schema) -> DbResult<Self> {
        let mut pager = Pager::open(&path)?;
        let header = TableHeader {
            name: name.to_string(),
            schema: schema.clone(),
        };
        let payload = serde_json::to_vec(&header)?;
        pager.write_header(&payload)?;
        pager.flush()?;
        debug!("created table file {:?} for '{name}'", path.as_ref());

        Ok(Self {
            pool: BufferPool::new(pager),
            name: name.to_string(),
            schema,
            path: path.as_ref().to_path_buf(),
            insert_hint: Mutex::new(1),
        })
    }

    /// Open an existing table file, reading back its schema.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let mut pager = Pager::open(&path)?;
        let payload = pager.read_header()?;
        let end = payload
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        let header: TableHeader = serde_json::from_slice(&payload[..end])?;

        Ok(Self {
            pool: BufferPool::new(pager),
            name: header.name,
            schema: header.schema,
            path: path.as_ref().to_path_buf(),
            insert_hint: Mutex::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn num_pages(&self) -> u32 {
        self.pool.pager.lock().unwrap().num_pages
    }

    // ── Row CRUD ──────────────────────────────────────────────────────

    /// Insert a tuple, returning its stable RID.
    pub fn insert(&self, tuple: &[u8]) -> DbResult<Rid> {
        if tuple.len() > MAX_TUPLE_LEN {
            return Err(StorageError::PageFull {
                needed: tuple.len(),
                available: MAX_TUPLE_LEN,
            }
            .into());
        }

        let num_pages = self.num_pages();
        let hint = *self.insert_hint.lock().unwrap();
        let candidates = std::iter::once(hint)
            .chain((1..num_pages).filter(|&p| p != hint))
            .filter(|&p| p >= 1 && p < num_pages);

        for page_id in candidates {
            let guard = self.pool.acquire_page(page_id)?;
            if guard.read().free_space() < tuple.len() {
                continue;
            }
            let mut page = guard.write();
            if let Some(slot_id) = page.insert_tuple(tuple) {
                *self.insert_hint.lock().unwrap() = page_id;
                return Ok(Rid::new(page_id, slot_id));
            }
        }

        // Nothing fits: grow the file.
        let guard = self.pool.new_page()?;
        let mut page = guard.write();
        let slot_id = page.insert_tuple(tuple).ok_or(StorageError::PageFull {
            needed: tuple.len(),
            available: MAX_TUPLE_LEN,
        })?;
        *self.insert_hint.lock().unwrap() = page.id;
        Ok(Rid::new(page.id, slot_id))
    }

    /// Fetch a tuple. `None` when the RID is out of range or deleted.
    pub fn get(&self, rid: Rid) -> DbResult<Option<Vec<u8>>> {
        if rid.page_id < 1 {
            return Ok(None);
        }
        let guard = self.pool.acquire_page(rid.page_id)?;
        let page = guard.read();
        Ok(page.get_tuple(rid.slot_id).map(|t| t.to_vec()))
    }

    /// Update a tuple. In-page rewrites keep the RID; if the page cannot
    /// hold the new image the row moves and the *new* RID is returned —
    /// callers that maintain indexes must propagate the change. `None`
    /// when the RID is not live.
    pub fn update(&self, rid: Rid, new_tuple: &[u8]) -> DbResult<Option<Rid>> {
        if rid.page_id < 1 {
            return Ok(None);
        }
        {
            let guard = self.pool.acquire_page(rid.page_id)?;
            let mut page = guard.write();
            if page.get_tuple(rid.slot_id).is_none() {
                return Ok(None);
            }
            if page.update_tuple(rid.slot_id, new_tuple) {
                return Ok(Some(rid));
            }
            page.delete_tuple(rid.slot_id);
        }
        let new_rid = self.insert(new_tuple)?;
        debug!("row moved {rid} -> {new_rid} in '{}'", self.name);
        Ok(Some(new_rid))
    }

    /// Delete a tuple; its slot becomes reusable.
    pub fn delete(&self, rid: Rid) -> DbResult<bool> {
        if rid.page_id < 1 {
            return Ok(false);
        }
        let guard = self.pool.acquire_page(rid.page_id)?;
        let result = guard.write().delete_tuple(rid.slot_id);
        Ok(result)
    }

    /// Re-occupy an exact RID with the given bytes (undo of a delete, or
    /// recovery redo of an insert).
    pub fn restore_at(&self, rid: Rid, tuple: &[u8]) -> DbResult<bool> {
        let guard = self.pool.acquire_page(rid.page_id)?;
        let result = guard.write().restore_tuple(rid.slot_id, tuple);
        Ok(result)
    }

    /// Raise the page LSN after a logged mutation touched it.
    pub fn stamp_lsn(&self, page_id: PageId, lsn: Lsn) -> DbResult<()> {
        let guard = self.pool.acquire_page(page_id)?;
        let mut page = guard.write();
        if page.lsn() < lsn {
            page.set_lsn(lsn);
        }
        Ok(())
    }

    // ── Recovery hooks ────────────────────────────────────────────────

    /// Run `apply` against the page unless its LSN shows the mutation
    /// already reached it, then stamp the record's LSN. Returns whether
    /// the mutation was applied.
    fn apply_logged<F>(&self, page_id: PageId, lsn: Lsn, apply: F) -> DbResult<bool>
    where
        F: FnOnce(&mut strata::Page) -> bool,
    {
        let guard = self.pool.acquire_page(page_id)?;
        let mut page = guard.write();
        if page.lsn() >= lsn {
            return Ok(false);
        }
        if !apply(&mut page) {
            warn!(
                "redo on '{}' page {page_id} (lsn {lsn}) did not apply",
                self.name
            );
        }
        page.set_lsn(lsn);
        Ok(true)
    }

    pub fn redo_insert(&self, rid: Rid, tuple: &[u8], lsn: Lsn) -> DbResult<bool> {
        self.apply_logged(rid.page_id, lsn, |page| page.restore_tuple(rid.slot_id, tuple))
    }

    pub fn redo_update(&self, rid: Rid, after: &[u8], lsn: Lsn) -> DbResult<bool> {
        self.apply_logged(rid.page_id, lsn, |page| {
            page.update_tuple(rid.slot_id, after)
        })
    }

    pub fn redo_delete(&self, rid: Rid, lsn: Lsn) -> DbResult<bool> {
        self.apply_logged(rid.page_id, lsn, |page| page.delete_tuple(rid.slot_id))
    }

    /// LSN currently stamped on a page. Recovery undo uses it to decide
    /// whether a logged change ever reached the page.
    pub fn page_lsn(&self, page_id: PageId) -> DbResult<Lsn> {
        let guard = self.pool.acquire_page(page_id)?;
        let lsn = guard.read().lsn();
        Ok(lsn)
    }

    // ── Scan ──────────────────────────────────────────────────────────

    /// Next live tuple at or after `(page_id, slot_id)`, in ascending RID
    /// order.
    pub fn next_live(&self, page_id: PageId, slot_id: SlotId) -> DbResult<Option<(Rid, Vec<u8>)>> {
        let num_pages = self.num_pages();
        let mut page_id = page_id.max(1);
        let mut slot_id = slot_id;
        while page_id < num_pages {
            let guard = self.pool.acquire_page(page_id)?;
            let page = guard.read();
            let num_slots = page.num_slots();
            while slot_id < num_slots {
                if let Some(tuple) = page.get_tuple(slot_id) {
                    return Ok(Some((Rid::new(page_id, slot_id), tuple.to_vec())));
                }
                slot_id += 1;
            }
            page_id += 1;
            slot_id = 0;
        }
        Ok(None)
    }

    /// Restartable full scan in ascending `(page_id, slot_id)` order.
    pub fn scan(&self) -> HeapScan<'_> {
        HeapScan {
            heap: self,
            page_id: 1,
            slot_id: 0,
            done: false,
        }
    }

    /// Write all dirty pages and fsync.
    pub fn flush(&self) -> DbResult<()> {
        self.pool.flush_all()?;
        self.pool.sync()?;
        Ok(())
    }
}

pub struct HeapScan<'a> {
    heap: &'a HeapFile,
    page_id: PageId,
    slot_id: SlotId,
    done: bool,
}

impl Iterator for HeapScan<'_> {
    type Item = DbResult<(Rid, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.heap.next_live(self.page_id, self.slot_id) {
            Ok(Some((rid, tuple))) => {
                self.page_id = rid.page_id;
                self.slot_id = rid.slot_id + 1;
                Some(Ok((rid, tuple)))
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use crate::types::DataType;
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", DataType::Int, false),
            Column::new("name", DataType::String, true),
        ])
    }

    fn heap(dir: &tempfile::TempDir) -> HeapFile {
        HeapFile::create(dir.path().join("t.tbl"), "t", schema()).unwrap()
    }

    #[test]
    fn insert_get_round_trip() {
        let dir = tempdir().unwrap();
        let heap = heap(&dir);
        let rid = heap.insert(b"row-one").unwrap();
        assert_eq!(rid, Rid::new(1, 0));
        assert_eq!(heap.get(rid).unwrap().unwrap(), b"row-one");
        assert!(heap.get(Rid::new(9, 0)).unwrap().is_none());
    }

    #[test]
    fn deleted_slot_is_reused_by_next_insert() {
        let dir = tempdir().unwrap();
        let heap = heap(&dir);
        heap.insert(b"a").unwrap();
        let b = heap.insert(b"b").unwrap();
        heap.insert(b"c").unwrap();

        assert!(heap.delete(b).unwrap());
        assert!(heap.get(b).unwrap().is_none());

        let d = heap.insert(b"d").unwrap();
        assert_eq!(d, b, "lowest freed slot is reused");
    }

    #[test]
    fn update_in_page_keeps_rid() {
        let dir = tempdir().unwrap();
        let heap = heap(&dir);
        let rid = heap.insert(b"short").unwrap();
        let same = heap.update(rid, b"a bit longer value").unwrap().unwrap();
        assert_eq!(same, rid);
        assert_eq!(heap.get(rid).unwrap().unwrap(), b"a bit longer value");
        assert!(heap.update(Rid::new(1, 99), b"x").unwrap().is_none());
    }

    #[test]
    fn update_moves_row_when_page_is_full() {
        let dir = tempdir().unwrap();
        let heap = heap(&dir);
        // Fill page 1 almost completely.
        let filler = vec![0x11u8; 1300];
        let victim = heap.insert(&filler).unwrap();
        heap.insert(&filler).unwrap();
        heap.insert(&filler).unwrap();

        let grown = vec![0x22u8; 2000];
        let new_rid = heap.update(victim, &grown).unwrap().unwrap();
        assert_ne!(new_rid, victim, "row had to move to another page");
        assert_eq!(heap.get(new_rid).unwrap().unwrap(), grown);
        assert!(heap.get(victim).unwrap().is_none());
    }

    #[test]
    fn scan_is_ordered_and_restartable() {
        let dir = tempdir().unwrap();
        let heap = heap(&dir);
        let big = vec![0x33u8; 1500];
        let mut rids = Vec::new();
        for _ in 0..6 {
            rids.push(heap.insert(&big).unwrap());
        }
        assert!(rids.last().unwrap().page_id > 1, "spans multiple pages");

        let seen: Vec<Rid> = heap.scan().map(|r| r.unwrap().0).collect();
        assert_eq!(seen, rids);
        // Second scan yields the same sequence.
        let again: Vec<Rid> = heap.scan().map(|r| r.unwrap().0).collect();
        assert_eq!(again, rids);
    }

    #[test]
    fn oversized_row_is_rejected() {
        let dir = tempdir().unwrap();
        let heap = heap(&dir);
        let huge = vec![0u8; MAX_TUPLE_LEN + 1];
        assert!(matches!(
            heap.insert(&huge),
            Err(DbError::Storage(StorageError::PageFull { .. }))
        ));
    }

    #[test]
    fn schema_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let rid;
        {
            let heap = HeapFile::create(&path, "people", schema()).unwrap();
            rid = heap.insert(b"persisted").unwrap();
            heap.flush().unwrap();
        }
        let heap = HeapFile::open(&path).unwrap();
        assert_eq!(heap.name(), "people");
        assert_eq!(heap.schema(), &schema());
        assert_eq!(heap.get(rid).unwrap().unwrap(), b"persisted");
    }

    #[test]
    fn redo_is_idempotent_via_page_lsn() {
        let dir = tempdir().unwrap();
        let heap = heap(&dir);
        let rid = Rid::new(1, 0);

        assert!(heap.redo_insert(rid, b"replayed", 100).unwrap());
        assert_eq!(heap.get(rid).unwrap().unwrap(), b"replayed");
        // Same record again: skipped, page LSN already at 100.
        assert!(!heap.redo_insert(rid, b"replayed", 100).unwrap());

        assert!(heap.redo_update(rid, b"updated!", 200).unwrap());
        assert_eq!(heap.get(rid).unwrap().unwrap(), b"updated!");
        assert!(heap.redo_delete(rid, 300).unwrap());
        assert!(heap.get(rid).unwrap().is_none());
        assert!(!heap.redo_delete(rid, 250).unwrap());
    }
}
