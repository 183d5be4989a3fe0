use crate::PageId;
use thiserror::Error;

/// Errors raised by the pager, the slotted page layer, and the WAL.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a minidb file: bad magic 0x{found:04X}")]
    BadMagic { found: u16 },

    #[error("unsupported format version {found} (expected {expected})")]
    VersionMismatch { found: u16, expected: u16 },

    #[error("page {page_id} is corrupt: {reason}")]
    CorruptPage { page_id: PageId, reason: String },

    #[error("tuple of {needed} bytes does not fit in a page ({available} usable)")]
    PageFull { needed: usize, available: usize },

    #[error("wal is corrupt at lsn {lsn}: {reason}")]
    CorruptWal { lsn: u64, reason: String },
}

/// Errors raised by the B+-tree.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("duplicate key in unique index")]
    DuplicateKey,

    #[error("encoded key of {len} bytes exceeds the index key limit")]
    KeyTooLarge { len: usize },

    #[error("index is corrupt: {0}")]
    CorruptIndex(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
