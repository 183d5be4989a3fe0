//! The write-ahead log.
//!
//! An append-only file of records:
//! ```text
//!   total_len u32 | lsn u64 | txn_id u32 | prev_lsn u64 | op u8 | payload | crc32 u32
//! ```
//! All integers big-endian; the CRC covers header and payload. `prev_lsn`
//! links a transaction's records backwards for O(1) rollback traversal.
//!
//! An LSN is a byte position in the log, biased by a persistent base so it
//! stays strictly monotonic across truncations. The file starts with the
//! 8-byte base; LSN 0 is the null sentinel and never addresses a record.
//!
//! Durability: appends are not fsynced individually under the default
//! `commit` policy; COMMIT (and ROLLBACK/CHECKPOINT) records are flushed
//! before the call returns. `always` fsyncs every append, `off` never
//! fsyncs (tests, bulk loads).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};

use crate::errors::StorageError;
use crate::{Rid, TxnId};

/// A log sequence number.
pub type Lsn = u64;

/// Sentinel: "no previous record".
pub const NULL_LSN: Lsn = 0;

/// First addressable LSN in a fresh log (the base prefix occupies 0..8).
const FIRST_LSN: Lsn = 8;

const HDR_SIZE: usize = 4 + 8 + 4 + 8 + 1;
const CRC_SIZE: usize = 4;
const MIN_RECORD: usize = HDR_SIZE + CRC_SIZE;

pub const OP_INSERT: u8 = 0x01;
pub const OP_UPDATE: u8 = 0x02;
pub const OP_DELETE: u8 = 0x03;
pub const OP_COMMIT: u8 = 0x10;
pub const OP_ROLLBACK: u8 = 0x11;
pub const OP_CHECKPOINT: u8 = 0x20;

/// The logged mutation. Data records carry the table name and the images
/// needed for both redo and undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Insert {
        table: String,
        rid: Rid,
        tuple: Vec<u8>,
    },
    Update {
        table: String,
        rid: Rid,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    Delete {
        table: String,
        rid: Rid,
        tuple: Vec<u8>,
    },
    Commit,
    Rollback,
    Checkpoint,
}

impl WalRecord {
    pub fn op(&self) -> u8 {
        match self {
            WalRecord::Insert { .. } => OP_INSERT,
            WalRecord::Update { .. } => OP_UPDATE,
            WalRecord::Delete { .. } => OP_DELETE,
            WalRecord::Commit => OP_COMMIT,
            WalRecord::Rollback => OP_ROLLBACK,
            WalRecord::Checkpoint => OP_CHECKPOINT,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            WalRecord::Insert { .. } | WalRecord::Update { .. } | WalRecord::Delete { .. }
        )
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        fn put_table_rid(buf: &mut BytesMut, table: &str, rid: Rid) {
            buf.put_u16(table.len() as u16);
            buf.put_slice(table.as_bytes());
            buf.put_slice(&rid.to_bytes());
        }
        fn put_image(buf: &mut BytesMut, image: &[u8]) {
            buf.put_u16(image.len() as u16);
            buf.put_slice(image);
        }

        match self {
            WalRecord::Insert { table, rid, tuple } | WalRecord::Delete { table, rid, tuple } => {
                put_table_rid(buf, table, *rid);
                put_image(buf, tuple);
            }
            WalRecord::Update {
                table,
                rid,
                before,
                after,
            } => {
                put_table_rid(buf, table, *rid);
                put_image(buf, before);
                put_image(buf, after);
            }
            WalRecord::Commit | WalRecord::Rollback | WalRecord::Checkpoint => {}
        }
    }

    fn decode_payload(op: u8, lsn: Lsn, mut payload: &[u8]) -> Result<Self, StorageError> {
        let corrupt = |reason: &str| StorageError::CorruptWal {
            lsn,
            reason: reason.to_string(),
        };

        fn take_image<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
            let s: &'a [u8] = *buf;
            if s.len() < 2 {
                return None;
            }
            let len = u16::from_be_bytes([s[0], s[1]]) as usize;
            if s.len() < 2 + len {
                return None;
            }
            *buf = &s[2 + len..];
            Some(&s[2..2 + len])
        }

        fn take_table_rid(buf: &mut &[u8]) -> Option<(String, Rid)> {
            let table = String::from_utf8(take_image(buf)?.to_vec()).ok()?;
            let s = *buf;
            if s.len() < Rid::ENCODED_LEN {
                return None;
            }
            let rid = Rid::from_bytes(&s[..Rid::ENCODED_LEN]);
            *buf = &s[Rid::ENCODED_LEN..];
            Some((table, rid))
        }

        match op {
            OP_INSERT | OP_DELETE => {
                let (table, rid) =
                    take_table_rid(&mut payload).ok_or_else(|| corrupt("truncated dml payload"))?;
                let tuple = take_image(&mut payload)
                    .ok_or_else(|| corrupt("truncated tuple image"))?
                    .to_vec();
                Ok(if op == OP_INSERT {
                    WalRecord::Insert { table, rid, tuple }
                } else {
                    WalRecord::Delete { table, rid, tuple }
                })
            }
            OP_UPDATE => {
                let (table, rid) =
                    take_table_rid(&mut payload).ok_or_else(|| corrupt("truncated dml payload"))?;
                let before = take_image(&mut payload)
                    .ok_or_else(|| corrupt("truncated before image"))?
                    .to_vec();
                let after = take_image(&mut payload)
                    .ok_or_else(|| corrupt("truncated after image"))?
                    .to_vec();
                Ok(WalRecord::Update {
                    table,
                    rid,
                    before,
                    after,
                })
            }
            OP_COMMIT => Ok(WalRecord::Commit),
            OP_ROLLBACK => Ok(WalRecord::Rollback),
            OP_CHECKPOINT => Ok(WalRecord::Checkpoint),
            other => Err(corrupt(&format!("unknown op 0x{other:02X}"))),
        }
    }
}

/// A parsed record plus its header fields.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub record: WalRecord,
    /// Total on-disk length, for advancing a forward scan.
    pub total_len: u32,
}

impl WalEntry {
    pub fn next_lsn(&self) -> Lsn {
        self.lsn + self.total_len as Lsn
    }
}

/// When the log is forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// fsync after every append.
    Always,
    /// fsync when a COMMIT/ROLLBACK/CHECKPOINT record is written.
    #[default]
    Commit,
    /// Never fsync.
    Off,
}

pub struct WalManager {
    file: File,
    path: PathBuf,
    base_lsn: Lsn,
    next_lsn: Lsn,
    durable_lsn: Lsn,
    sync: SyncPolicy,
}

impl WalManager {
    /// Open or create the log. A fresh log gets base LSN 8 so that LSN 0
    /// stays free as the null sentinel.
    pub fn open<P: AsRef<Path>>(path: P, sync: SyncPolicy) -> Result<Self, StorageError> {
        let path_buf = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;

        let size = file.metadata()?.len();
        let base_lsn = if size < 8 {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&FIRST_LSN.to_be_bytes())?;
            file.sync_all()?;
            FIRST_LSN
        } else {
            let mut prefix = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut prefix)?;
            Lsn::from_be_bytes(prefix)
        };

        let next_lsn = base_lsn + size.saturating_sub(8);
        debug!("wal open: base={base_lsn} next={next_lsn} ({path_buf:?})");
        Ok(Self {
            file,
            path: path_buf,
            base_lsn,
            next_lsn,
            durable_lsn: next_lsn,
            sync,
        })
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// LSN up to which the log is known durable.
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn
    }

    fn offset_of(&self, lsn: Lsn) -> u64 {
        lsn - self.base_lsn + 8
    }

    /// Append a record and return its LSN. Honors the `always` policy;
    /// otherwise durability waits for [`Self::flush`].
    pub fn append(
        &mut self,
        txn_id: TxnId,
        prev_lsn: Lsn,
        record: &WalRecord,
    ) -> Result<Lsn, StorageError> {
        crate::failpoint::maybe_fail("wal.append.before_write")?;

        let mut payload = BytesMut::new();
        record.encode_payload(&mut payload);

        let lsn = self.next_lsn;
        let total_len = (MIN_RECORD + payload.len()) as u32;

        let mut buf = BytesMut::with_capacity(total_len as usize);
        buf.put_u32(total_len);
        buf.put_u64(lsn);
        buf.put_u32(txn_id);
        buf.put_u64(prev_lsn);
        buf.put_u8(record.op());
        buf.put_slice(&payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.put_u32(hasher.finalize());

        let offset = self.offset_of(lsn);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        self.next_lsn = lsn + total_len as Lsn;

        // COMMIT durability: the record must hit disk before the caller
        // observes success.
        let must_flush = match self.sync {
            SyncPolicy::Always => true,
            SyncPolicy::Commit => !record.is_data(),
            SyncPolicy::Off => false,
        };
        if must_flush {
            self.flush()?;
        }
        Ok(lsn)
    }

    /// Force the log to stable storage (no-op under the `off` policy).
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.sync != SyncPolicy::Off {
            self.file.sync_data()?;
        }
        self.durable_lsn = self.next_lsn;
        Ok(())
    }

    /// Read the record at `lsn`, or `None` at or past the end of the log.
    pub fn read_record(&mut self, lsn: Lsn) -> Result<Option<WalEntry>, StorageError> {
        if lsn < self.base_lsn || lsn >= self.next_lsn {
            return Ok(None);
        }
        let corrupt = |reason: String| StorageError::CorruptWal { lsn, reason };

        let offset = self.offset_of(lsn);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut hdr = [0u8; HDR_SIZE];
        if self.file.read_exact(&mut hdr).is_err() {
            return Ok(None);
        }

        let mut cursor = &hdr[..];
        let total_len = cursor.get_u32();
        let rec_lsn = cursor.get_u64();
        let txn_id = cursor.get_u32();
        let prev_lsn = cursor.get_u64();
        let op = cursor.get_u8();

        if (total_len as usize) < MIN_RECORD {
            return Err(corrupt(format!("record too small ({total_len})")));
        }
        if rec_lsn != lsn {
            return Err(corrupt(format!("lsn mismatch (header says {rec_lsn})")));
        }
        if lsn + total_len as Lsn > self.next_lsn {
            // Torn tail write.
            return Ok(None);
        }

        let body_len = total_len as usize - HDR_SIZE;
        let mut body = vec![0u8; body_len];
        if self.file.read_exact(&mut body).is_err() {
            return Ok(None);
        }
        let payload = &body[..body_len - CRC_SIZE];
        let stored_crc = u32::from_be_bytes(body[body_len - CRC_SIZE..].try_into().unwrap());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&hdr);
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(corrupt("crc mismatch".to_string()));
        }

        let record = WalRecord::decode_payload(op, lsn, payload)?;
        Ok(Some(WalEntry {
            lsn,
            txn_id,
            prev_lsn,
            record,
            total_len,
        }))
    }

    /// Forward scan from `lsn`. The iterator ends at the first incomplete
    /// or corrupt record, treating it as a torn tail; crash recovery
    /// discards everything from that point on.
    pub fn iter_from(&mut self, lsn: Lsn) -> WalIter<'_> {
        let start = lsn.max(self.base_lsn);
        WalIter {
            wal: self,
            next: start,
        }
    }

    /// First LSN still present in the log.
    pub fn start_lsn(&self) -> Lsn {
        self.base_lsn
    }

    /// Drop all records with `lsn < keep_from` by rewriting the log tail
    /// into a fresh file with a rebased prefix, then renaming over the old
    /// one. LSNs of surviving records are unchanged.
    pub fn truncate_to(&mut self, keep_from: Lsn) -> Result<(), StorageError> {
        if keep_from <= self.base_lsn {
            return Ok(());
        }
        let keep_from = keep_from.min(self.next_lsn);

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("tmp");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&keep_from.to_be_bytes())?;

        self.file.seek(SeekFrom::Start(self.offset_of(keep_from)))?;
        std::io::copy(&mut self.file, &mut tmp)?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = tmp;
        self.base_lsn = keep_from;
        debug!("wal truncated to lsn {keep_from}");
        Ok(())
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("wal flush on drop failed: {e}");
        }
    }
}

pub struct WalIter<'a> {
    wal: &'a mut WalManager,
    next: Lsn,
}

impl Iterator for WalIter<'_> {
    type Item = WalEntry;

    fn next(&mut self) -> Option<WalEntry> {
        match self.wal.read_record(self.next) {
            Ok(Some(entry)) => {
                self.next = entry.next_lsn();
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("wal scan stopped at lsn {}: {e}", self.next);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_insert(table: &str) -> WalRecord {
        WalRecord::Insert {
            table: table.to_string(),
            rid: Rid::new(1, 0),
            tuple: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempdir().unwrap();
        let mut wal = WalManager::open(dir.path().join("wal.log"), SyncPolicy::Commit).unwrap();

        let record = WalRecord::Update {
            table: "users".into(),
            rid: Rid::new(3, 7),
            before: b"old".to_vec(),
            after: b"new".to_vec(),
        };
        let lsn = wal.append(42, NULL_LSN, &record).unwrap();

        let entry = wal.read_record(lsn).unwrap().unwrap();
        assert_eq!(entry.txn_id, 42);
        assert_eq!(entry.prev_lsn, NULL_LSN);
        assert_eq!(entry.record, record);
    }

    #[test]
    fn lsns_are_strictly_monotonic_and_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let first;
        let second;
        {
            let mut wal = WalManager::open(&path, SyncPolicy::Commit).unwrap();
            first = wal.append(1, NULL_LSN, &sample_insert("t")).unwrap();
            second = wal.append(1, first, &WalRecord::Commit).unwrap();
            assert!(second > first);
        }

        let mut wal = WalManager::open(&path, SyncPolicy::Commit).unwrap();
        let third = wal.append(2, NULL_LSN, &sample_insert("t")).unwrap();
        assert!(third > second);

        let entries: Vec<WalEntry> = wal.iter_from(wal.start_lsn()).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].lsn, first);
        assert_eq!(entries[1].prev_lsn, first);
    }

    #[test]
    fn crc_corruption_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let lsn;
        {
            let mut wal = WalManager::open(&path, SyncPolicy::Commit).unwrap();
            lsn = wal.append(1, NULL_LSN, &sample_insert("t")).unwrap();
            wal.append(1, lsn, &WalRecord::Commit).unwrap();
        }

        // Flip a payload byte of the first record.
        let mut raw = std::fs::read(&path).unwrap();
        raw[8 + HDR_SIZE] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let mut wal = WalManager::open(&path, SyncPolicy::Commit).unwrap();
        assert!(matches!(
            wal.read_record(lsn),
            Err(StorageError::CorruptWal { .. })
        ));
        // A forward scan treats the corruption as end-of-log.
        assert_eq!(wal.iter_from(wal.start_lsn()).count(), 0);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = WalManager::open(&path, SyncPolicy::Commit).unwrap();
            let lsn = wal.append(1, NULL_LSN, &sample_insert("t")).unwrap();
            wal.append(1, lsn, &WalRecord::Commit).unwrap();
            wal.append(2, NULL_LSN, &sample_insert("t")).unwrap();
        }

        // Cut the last record in half.
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 10]).unwrap();

        let mut wal = WalManager::open(&path, SyncPolicy::Commit).unwrap();
        let entries: Vec<WalEntry> = wal.iter_from(wal.start_lsn()).collect();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1].record, WalRecord::Commit));
    }

    #[test]
    fn truncate_keeps_lsns_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = WalManager::open(&path, SyncPolicy::Commit).unwrap();

        let a = wal.append(1, NULL_LSN, &sample_insert("t")).unwrap();
        let b = wal.append(1, a, &WalRecord::Commit).unwrap();
        let ckpt = wal.append(0, NULL_LSN, &WalRecord::Checkpoint).unwrap();
        let d = wal.append(2, NULL_LSN, &sample_insert("t")).unwrap();

        wal.truncate_to(ckpt).unwrap();

        assert!(wal.read_record(a).unwrap().is_none());
        assert!(wal.read_record(b).unwrap().is_none());
        let kept = wal.read_record(ckpt).unwrap().unwrap();
        assert!(matches!(kept.record, WalRecord::Checkpoint));
        let tail = wal.read_record(d).unwrap().unwrap();
        assert_eq!(tail.txn_id, 2);

        // Reopen preserves the rebased log.
        drop(wal);
        let mut wal = WalManager::open(&path, SyncPolicy::Commit).unwrap();
        assert_eq!(wal.start_lsn(), ckpt);
        let e = wal.append(3, NULL_LSN, &WalRecord::Commit).unwrap();
        assert!(e > d);
    }
}
