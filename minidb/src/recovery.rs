//! Startup crash recovery.
//!
//! The WAL is scanned twice and then cleaned up:
//!
//! 1. **Analysis** — collect the set of committed transaction ids (those
//!    with a COMMIT record) and the highest transaction id seen.
//! 2. **Redo** — replay the data records of committed transactions onto
//!    the heap pages, gated by the per-page LSN so replay is idempotent.
//! 3. **Undo** — walk the data records of transactions that neither
//!    committed nor finished rolling back, newest first, and apply their
//!    before-images wherever the page LSN shows the change reached disk.
//!    Undo actions are themselves idempotent, so a crash during recovery
//!    just reruns them.
//! 4. Flush every touched heap, append a CHECKPOINT record, and truncate
//!    the log to it.
//!
//! Indexes are not WAL-logged; the engine rebuilds the indexes of every
//! table named in a post-checkpoint committed record after recovery.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use log::{info, warn};

use strata::wal::{WalEntry, WalManager, WalRecord, NULL_LSN};
use strata::TxnId;

use crate::catalog::Catalog;
use crate::errors::DbResult;
use crate::heap::HeapFile;

#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// First transaction id safe to hand out after recovery.
    pub next_txn_id: TxnId,
    pub committed_txns: usize,
    pub redone: usize,
    pub undone: usize,
    /// Tables named in committed data records; their indexes may be stale
    /// and must be rebuilt.
    pub touched_tables: BTreeSet<String>,
}

pub fn recover(
    data_dir: &Path,
    wal: &mut WalManager,
    catalog: &Catalog,
) -> DbResult<RecoveryOutcome> {
    let entries: Vec<WalEntry> = wal.iter_from(wal.start_lsn()).collect();

    let mut outcome = RecoveryOutcome {
        next_txn_id: 1,
        ..Default::default()
    };
    if entries.is_empty() {
        return Ok(outcome);
    }

    // Analysis: who committed, who finished rolling back, highest txn id.
    let mut committed: HashSet<TxnId> = HashSet::new();
    let mut rolled_back: HashSet<TxnId> = HashSet::new();
    let mut max_txn_id: TxnId = 0;
    for entry in &entries {
        max_txn_id = max_txn_id.max(entry.txn_id);
        match entry.record {
            WalRecord::Commit => {
                committed.insert(entry.txn_id);
            }
            WalRecord::Rollback => {
                rolled_back.insert(entry.txn_id);
            }
            _ => {}
        }
    }
    outcome.next_txn_id = max_txn_id + 1;
    outcome.committed_txns = committed.len();

    let mut heaps: HashMap<String, HeapFile> = HashMap::new();
    let open_heap = |table: &str,
                         heaps: &mut HashMap<String, HeapFile>|
     -> DbResult<bool> {
        if heaps.contains_key(table) {
            return Ok(true);
        }
        let Ok(info) = catalog.get_table(table) else {
            warn!("recovery: wal names unknown table '{table}', skipping");
            return Ok(false);
        };
        let heap = HeapFile::open(data_dir.join(&info.file))?;
        heaps.insert(table.to_string(), heap);
        Ok(true)
    };

    // Redo committed work, oldest first.
    for entry in &entries {
        if !committed.contains(&entry.txn_id) {
            continue;
        }
        let (table, applied) = match &entry.record {
            WalRecord::Insert { table, rid, tuple } => {
                if !open_heap(table, &mut heaps)? {
                    continue;
                }
                (table, heaps[table].redo_insert(*rid, tuple, entry.lsn)?)
            }
            WalRecord::Update {
                table, rid, after, ..
            } => {
                if !open_heap(table, &mut heaps)? {
                    continue;
                }
                (table, heaps[table].redo_update(*rid, after, entry.lsn)?)
            }
            WalRecord::Delete { table, rid, .. } => {
                if !open_heap(table, &mut heaps)? {
                    continue;
                }
                (table, heaps[table].redo_delete(*rid, entry.lsn)?)
            }
            _ => continue,
        };
        outcome.touched_tables.insert(table.clone());
        if applied {
            outcome.redone += 1;
        }
    }

    // Undo losers, newest first. Transactions that finished a runtime
    // ROLLBACK are skipped: the rollback flushed its undone pages before
    // logging the ROLLBACK record. A page whose LSN predates the record
    // never saw the change, so there is nothing to reverse; the undo
    // actions themselves are idempotent.
    for entry in entries.iter().rev() {
        if committed.contains(&entry.txn_id) || rolled_back.contains(&entry.txn_id) {
            continue;
        }
        let (WalRecord::Insert { table, rid, .. }
        | WalRecord::Update { table, rid, .. }
        | WalRecord::Delete { table, rid, .. }) = &entry.record
        else {
            continue;
        };
        if !open_heap(table, &mut heaps)? {
            continue;
        }
        let heap = &heaps[table.as_str()];
        if heap.page_lsn(rid.page_id)? < entry.lsn {
            continue;
        }
        match &entry.record {
            WalRecord::Insert { rid, .. } => {
                heap.delete(*rid)?;
            }
            WalRecord::Update { rid, before, .. } => {
                if heap.update(*rid, before)?.is_none() {
                    warn!("recovery: undo update found no row at {rid}");
                }
            }
            WalRecord::Delete { rid, tuple, .. } => {
                // The slot can have been reused by a committed insert; the
                // resurrected row then moves to a fresh RID.
                if !heap.restore_at(*rid, tuple)? {
                    heap.insert(tuple)?;
                }
            }
            _ => unreachable!(),
        }
        // Any undone change can leave index entries stale.
        outcome.touched_tables.insert(table.clone());
        outcome.undone += 1;
    }

    // Make everything durable, then shrink the log to a fresh checkpoint.
    for heap in heaps.values() {
        heap.flush()?;
    }
    let ckpt = wal.append(0, NULL_LSN, &WalRecord::Checkpoint)?;
    wal.flush()?;
    wal.truncate_to(ckpt)?;

    info!(
        "recovery: {} committed txns, {} redone, {} undone, next txn id {}",
        outcome.committed_txns, outcome.redone, outcome.undone, outcome.next_txn_id
    );
    Ok(outcome)
}
