//! Slotted page layout over a fixed 4096-byte buffer.
//!
//! Layout:
//! ```text
//!   [0..24)    header
//!   [24..)     slot directory, 4 bytes per slot, grows down
//!   ...        free space
//!   [..4096)   tuple data, grows up from the page end
//! ```
//!
//! Header fields (big-endian):
//! `magic u16 | version u16 | num_slots u16 | free_start u16 | flags u16 |
//!  free_end u16 | checksum u32 | page_lsn u64`
//!
//! A slot is `(offset: u16, length: u16)`; `(0, 0)` marks a deleted slot,
//! which is eligible for reuse by a later insert. Slot ids are stable for
//! the lifetime of the tuple, including across `compact`.

use crate::errors::StorageError;
use crate::{PageId, SlotId, PAGE_SIZE};

pub const HEADER_SIZE: usize = 24;
pub const SLOT_SIZE: usize = 4;
pub const MAGIC: u16 = 0x4D44;
pub const FORMAT_VERSION: u16 = 1;

/// Largest tuple a single empty page can hold (one slot entry reserved).
pub const MAX_TUPLE_LEN: usize = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 2;
const OFF_NUM_SLOTS: usize = 4;
const OFF_FREE_START: usize = 6;
const OFF_FLAGS: usize = 8;
const OFF_FREE_END: usize = 10;
const OFF_CHECKSUM: usize = 12;
const OFF_PAGE_LSN: usize = 16;

/// Flag bit set on B+-tree leaf pages (clear on internal pages).
pub const FLAG_BTREE_LEAF: u16 = 0x0001;

#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    /// A fresh, empty page: no slots, the whole body free.
    pub fn new(id: PageId) -> Self {
        let mut page = Page {
            id,
            data: [0; PAGE_SIZE],
        };
        page.put_u16(OFF_MAGIC, MAGIC);
        page.put_u16(OFF_VERSION, FORMAT_VERSION);
        page.put_u16(OFF_FREE_START, HEADER_SIZE as u16);
        page.put_u16(OFF_FREE_END, PAGE_SIZE as u16);
        page
    }

    /// Load a page image read from disk, verifying the checksum and the
    /// structural invariants. A stored checksum of zero means the page was
    /// never written through the pager and is accepted as-is.
    pub fn from_bytes(id: PageId, data: [u8; PAGE_SIZE]) -> Result<Self, StorageError> {
        let page = Page { id, data };

        let stored = page.get_u32(OFF_CHECKSUM);
        if stored != 0 {
            let computed = page.compute_checksum();
            if stored != computed {
                return Err(StorageError::CorruptPage {
                    page_id: id,
                    reason: format!("crc mismatch (stored={stored:#010X}, computed={computed:#010X})"),
                });
            }
        }

        let num_slots = page.num_slots() as usize;
        let free_start = page.free_start() as usize;
        let free_end = page.free_end() as usize;
        if free_start > free_end || free_end > PAGE_SIZE {
            return Err(StorageError::CorruptPage {
                page_id: id,
                reason: format!("free space overlap (free_start={free_start}, free_end={free_end})"),
            });
        }
        if free_start != HEADER_SIZE + num_slots * SLOT_SIZE {
            return Err(StorageError::CorruptPage {
                page_id: id,
                reason: format!(
                    "slot directory inconsistency (num_slots={num_slots}, free_start={free_start})"
                ),
            });
        }

        Ok(page)
    }

    // ── Header accessors ──────────────────────────────────────────────

    pub fn num_slots(&self) -> u16 {
        self.get_u16(OFF_NUM_SLOTS)
    }

    pub fn free_start(&self) -> u16 {
        self.get_u16(OFF_FREE_START)
    }

    pub fn free_end(&self) -> u16 {
        self.get_u16(OFF_FREE_END)
    }

    pub fn flags(&self) -> u16 {
        self.get_u16(OFF_FLAGS)
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.put_u16(OFF_FLAGS, flags);
    }

    /// LSN of the last WAL record applied to this page. Recovery skips a
    /// redo record when the on-page LSN is already at or past it.
    pub fn lsn(&self) -> u64 {
        self.get_u64(OFF_PAGE_LSN)
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.put_u64(OFF_PAGE_LSN, lsn);
    }

    pub fn free_space(&self) -> usize {
        self.free_end() as usize - self.free_start() as usize
    }

    /// Whether a tuple of `len` bytes fits, counting a fresh slot entry.
    pub fn can_fit(&self, len: usize) -> bool {
        self.free_space() >= len + SLOT_SIZE
    }

    // ── Checksum ──────────────────────────────────────────────────────

    /// CRC32 of the page with the checksum field treated as zero.
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..OFF_CHECKSUM]);
        hasher.update(&self.data[OFF_CHECKSUM + 4..]);
        hasher.finalize()
    }

    /// Stamp the current checksum into the header. The pager calls this
    /// immediately before every write.
    pub fn update_checksum(&mut self) {
        let crc = self.compute_checksum();
        self.put_u32(OFF_CHECKSUM, crc);
    }

    // ── Slot directory ────────────────────────────────────────────────

    fn slot_offset(slot_id: SlotId) -> usize {
        HEADER_SIZE + slot_id as usize * SLOT_SIZE
    }

    fn read_slot(&self, slot_id: SlotId) -> (u16, u16) {
        let off = Self::slot_offset(slot_id);
        (self.get_u16(off), self.get_u16(off + 2))
    }

    fn write_slot(&mut self, slot_id: SlotId, offset: u16, length: u16) {
        let off = Self::slot_offset(slot_id);
        self.put_u16(off, offset);
        self.put_u16(off + 2, length);
    }

    fn find_deleted_slot(&self) -> Option<SlotId> {
        (0..self.num_slots()).find(|&i| self.read_slot(i) == (0, 0))
    }

    // ── Tuple CRUD ────────────────────────────────────────────────────

    /// Insert a tuple, returning its slot id, or `None` when the page is
    /// full. The lowest deleted slot is reused before a new one is
    /// appended.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> Option<SlotId> {
        if tuple.is_empty() || tuple.len() > MAX_TUPLE_LEN {
            return None;
        }
        let len = tuple.len();

        if let Some(slot_id) = self.find_deleted_slot() {
            // Reusing a slot needs room for the data only.
            if self.free_space() < len {
                return None;
            }
            let offset = self.alloc_tuple_space(tuple);
            self.write_slot(slot_id, offset, len as u16);
            return Some(slot_id);
        }

        if !self.can_fit(len) {
            return None;
        }
        let offset = self.alloc_tuple_space(tuple);
        let slot_id = self.num_slots();
        self.put_u16(OFF_NUM_SLOTS, slot_id + 1);
        self.put_u16(OFF_FREE_START, (Self::slot_offset(slot_id + 1)) as u16);
        self.write_slot(slot_id, offset, len as u16);
        debug_assert!(self.free_start() <= self.free_end());
        Some(slot_id)
    }

    /// Carve `tuple` out of the free region, returning its offset.
    fn alloc_tuple_space(&mut self, tuple: &[u8]) -> u16 {
        let new_end = self.free_end() as usize - tuple.len();
        self.data[new_end..new_end + tuple.len()].copy_from_slice(tuple);
        self.put_u16(OFF_FREE_END, new_end as u16);
        new_end as u16
    }

    /// Read a tuple. Returns `None` for deleted or out-of-range slots.
    pub fn get_tuple(&self, slot_id: SlotId) -> Option<&[u8]> {
        if slot_id >= self.num_slots() {
            return None;
        }
        let (offset, length) = self.read_slot(slot_id);
        if (offset, length) == (0, 0) {
            return None;
        }
        Some(&self.data[offset as usize..offset as usize + length as usize])
    }

    /// Mark a slot deleted. The bytes stay in place until `compact`; the
    /// slot id becomes reusable by later inserts.
    pub fn delete_tuple(&mut self, slot_id: SlotId) -> bool {
        if slot_id >= self.num_slots() || self.read_slot(slot_id) == (0, 0) {
            return false;
        }
        self.write_slot(slot_id, 0, 0);
        true
    }

    /// Update a tuple in place, preserving its slot id.
    ///
    /// A tuple that shrinks is rewritten where it sits. A tuple that grows
    /// is relocated within this page, compacting first when needed. Returns
    /// `false` when the page cannot hold the new image; the caller then
    /// moves the tuple to another page, which changes its RID.
    pub fn update_tuple(&mut self, slot_id: SlotId, new_data: &[u8]) -> bool {
        if slot_id >= self.num_slots() || new_data.is_empty() {
            return false;
        }
        let (old_offset, old_length) = self.read_slot(slot_id);
        if (old_offset, old_length) == (0, 0) {
            return false;
        }

        let new_len = new_data.len();
        if new_len <= old_length as usize {
            let start = old_offset as usize;
            self.data[start..start + new_len].copy_from_slice(new_data);
            for b in &mut self.data[start + new_len..start + old_length as usize] {
                *b = 0;
            }
            self.write_slot(slot_id, old_offset, new_len as u16);
            return true;
        }

        // Grew: drop the old image, reclaim space if necessary, relocate.
        self.write_slot(slot_id, 0, 0);
        if self.free_space() < new_len {
            self.compact();
            if self.free_space() < new_len {
                self.write_slot(slot_id, old_offset, old_length);
                return false;
            }
        }
        let offset = self.alloc_tuple_space(new_data);
        self.write_slot(slot_id, offset, new_len as u16);
        debug_assert!(self.free_start() <= self.free_end());
        true
    }

    /// Re-occupy a specific slot with the given bytes. Used by recovery
    /// redo and by undo of a delete, where the slot id is dictated by the
    /// log rather than chosen by the page. Returns `false` when the slot
    /// is live or the page cannot hold the tuple.
    pub fn restore_tuple(&mut self, slot_id: SlotId, tuple: &[u8]) -> bool {
        if tuple.is_empty() || tuple.len() > MAX_TUPLE_LEN {
            return false;
        }

        // Grow the directory with deleted placeholders up to the target id.
        while slot_id >= self.num_slots() {
            if self.free_space() < SLOT_SIZE {
                return false;
            }
            let next = self.num_slots();
            self.put_u16(OFF_NUM_SLOTS, next + 1);
            self.put_u16(OFF_FREE_START, Self::slot_offset(next + 1) as u16);
            self.write_slot(next, 0, 0);
        }

        if self.read_slot(slot_id) != (0, 0) {
            return false;
        }
        if self.free_space() < tuple.len() {
            self.compact();
            if self.free_space() < tuple.len() {
                return false;
            }
        }
        let offset = self.alloc_tuple_space(tuple);
        self.write_slot(slot_id, offset, tuple.len() as u16);
        true
    }

    /// Rewrite the tuple region contiguously against the page end,
    /// reclaiming the space of deleted tuples. Slot ids never change.
    pub fn compact(&mut self) {
        let live: Vec<(SlotId, Vec<u8>)> = self
            .live_tuples()
            .map(|(slot_id, data)| (slot_id, data.to_vec()))
            .collect();

        self.put_u16(OFF_FREE_END, PAGE_SIZE as u16);
        for (slot_id, tuple) in live {
            let offset = self.alloc_tuple_space(&tuple);
            self.write_slot(slot_id, offset, tuple.len() as u16);
        }
        let (start, end) = (self.free_start() as usize, self.free_end() as usize);
        for b in &mut self.data[start..end] {
            *b = 0;
        }
        debug_assert!(self.free_start() <= self.free_end());
    }

    /// Live tuples in ascending slot order.
    pub fn live_tuples(&self) -> impl Iterator<Item = (SlotId, &[u8])> + '_ {
        (0..self.num_slots()).filter_map(|slot_id| self.get_tuple(slot_id).map(|t| (slot_id, t)))
    }

    pub fn live_count(&self) -> usize {
        self.live_tuples().count()
    }

    // ── Raw big-endian accessors ──────────────────────────────────────

    fn get_u16(&self, off: usize) -> u16 {
        u16::from_be_bytes([self.data[off], self.data[off + 1]])
    }

    fn put_u16(&mut self, off: usize, val: u16) {
        self.data[off..off + 2].copy_from_slice(&val.to_be_bytes());
    }

    fn get_u32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    fn put_u32(&mut self, off: usize, val: u32) {
        self.data[off..off + 4].copy_from_slice(&val.to_be_bytes());
    }

    fn get_u64(&self, off: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[off..off + 8]);
        u64::from_be_bytes(buf)
    }

    fn put_u64(&mut self, off: usize, val: u64) {
        self.data[off..off + 8].copy_from_slice(&val.to_be_bytes());
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("num_slots", &self.num_slots())
            .field("live", &self.live_count())
            .field("free", &self.free_space())
            .field("lsn", &self.lsn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_page_has_full_free_space() {
        let page = Page::new(1);
        assert_eq!(page.num_slots(), 0);
        assert_eq!(page.free_space(), PAGE_SIZE - HEADER_SIZE);
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut page = Page::new(1);
        let s0 = page.insert_tuple(b"alpha").unwrap();
        let s1 = page.insert_tuple(b"beta").unwrap();
        assert_eq!(s0, 0);
        assert_eq!(s1, 1);
        assert_eq!(page.get_tuple(s0).unwrap(), b"alpha");
        assert_eq!(page.get_tuple(s1).unwrap(), b"beta");
        assert_eq!(
            page.free_start() as usize,
            HEADER_SIZE + 2 * SLOT_SIZE
        );
    }

    #[test]
    fn delete_frees_slot_for_reuse() {
        let mut page = Page::new(1);
        page.insert_tuple(b"one").unwrap();
        let middle = page.insert_tuple(b"two").unwrap();
        page.insert_tuple(b"three").unwrap();

        assert!(page.delete_tuple(middle));
        assert!(page.get_tuple(middle).is_none());
        assert!(!page.delete_tuple(middle));

        // The lowest freed slot is reused; no new slot is appended.
        let reused = page.insert_tuple(b"four").unwrap();
        assert_eq!(reused, middle);
        assert_eq!(page.num_slots(), 3);
    }

    #[test]
    fn insert_fails_when_full() {
        let mut page = Page::new(1);
        let big = vec![0xABu8; 2000];
        assert!(page.insert_tuple(&big).is_some());
        assert!(page.insert_tuple(&big).is_some());
        assert!(page.insert_tuple(&big).is_none());
    }

    #[test]
    fn update_in_place_and_grow() {
        let mut page = Page::new(1);
        let slot = page.insert_tuple(b"abcdef").unwrap();

        assert!(page.update_tuple(slot, b"abc"));
        assert_eq!(page.get_tuple(slot).unwrap(), b"abc");

        assert!(page.update_tuple(slot, b"a-longer-value"));
        assert_eq!(page.get_tuple(slot).unwrap(), b"a-longer-value");
    }

    #[test]
    fn update_too_large_restores_old_image() {
        let mut page = Page::new(1);
        let filler = vec![1u8; 3000];
        page.insert_tuple(&filler).unwrap();
        let slot = page.insert_tuple(b"small").unwrap();

        let huge = vec![2u8; 2000];
        assert!(!page.update_tuple(slot, &huge));
        assert_eq!(page.get_tuple(slot).unwrap(), b"small");
    }

    #[test]
    fn compact_preserves_live_tuples_and_slot_ids() {
        let mut page = Page::new(1);
        let a = page.insert_tuple(b"aaaa").unwrap();
        let b = page.insert_tuple(b"bbbb").unwrap();
        let c = page.insert_tuple(b"cccc").unwrap();
        page.delete_tuple(b);
        let free_before = page.free_space();

        page.compact();

        assert_eq!(page.get_tuple(a).unwrap(), b"aaaa");
        assert!(page.get_tuple(b).is_none());
        assert_eq!(page.get_tuple(c).unwrap(), b"cccc");
        assert_eq!(page.free_space(), free_before + 4);
    }

    #[test]
    fn restore_reoccupies_exact_slot() {
        let mut page = Page::new(1);
        let slot = page.insert_tuple(b"payload").unwrap();
        page.delete_tuple(slot);

        assert!(page.restore_tuple(slot, b"payload"));
        assert_eq!(page.get_tuple(slot).unwrap(), b"payload");
        assert!(!page.restore_tuple(slot, b"payload"));
    }

    #[test]
    fn restore_extends_slot_directory() {
        let mut page = Page::new(1);
        assert!(page.restore_tuple(3, b"late"));
        assert_eq!(page.num_slots(), 4);
        assert_eq!(page.get_tuple(3).unwrap(), b"late");
        assert!(page.get_tuple(0).is_none());
    }

    #[test]
    fn checksum_round_trip_detects_corruption() {
        let mut page = Page::new(7);
        page.insert_tuple(b"checksummed").unwrap();
        page.update_checksum();

        let data = page.data;
        assert!(Page::from_bytes(7, data).is_ok());

        let mut corrupt = data;
        corrupt[PAGE_SIZE - 1] ^= 0xFF;
        assert!(matches!(
            Page::from_bytes(7, corrupt),
            Err(StorageError::CorruptPage { .. })
        ));
    }

    #[test]
    fn invariants_hold_under_random_workload() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut page = Page::new(1);
        let mut shadow: Vec<Option<Vec<u8>>> = Vec::new();

        for _ in 0..500 {
            match rng.gen_range(0..4) {
                0 => {
                    let len = rng.gen_range(1..64);
                    let tuple: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    if let Some(slot) = page.insert_tuple(&tuple) {
                        let slot = slot as usize;
                        if slot == shadow.len() {
                            shadow.push(Some(tuple));
                        } else {
                            assert!(shadow[slot].is_none());
                            shadow[slot] = Some(tuple);
                        }
                    }
                }
                1 => {
                    if !shadow.is_empty() {
                        let slot = rng.gen_range(0..shadow.len());
                        let deleted = page.delete_tuple(slot as SlotId);
                        assert_eq!(deleted, shadow[slot].is_some());
                        shadow[slot] = None;
                    }
                }
                2 => {
                    if !shadow.is_empty() {
                        let slot = rng.gen_range(0..shadow.len());
                        if shadow[slot].is_some() {
                            let len = rng.gen_range(1..64);
                            let tuple: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                            if page.update_tuple(slot as SlotId, &tuple) {
                                shadow[slot] = Some(tuple);
                            }
                        }
                    }
                }
                _ => page.compact(),
            }

            // Structural invariants after every mutation.
            assert!(page.free_start() <= page.free_end());
            assert_eq!(
                page.free_start() as usize,
                HEADER_SIZE + page.num_slots() as usize * SLOT_SIZE
            );
            for (slot_id, tuple) in page.live_tuples() {
                assert_eq!(Some(tuple.to_vec()), shadow[slot_id as usize]);
            }
            assert_eq!(
                page.live_count(),
                shadow.iter().filter(|t| t.is_some()).count()
            );
        }
    }
}
