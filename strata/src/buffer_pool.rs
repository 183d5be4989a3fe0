//! Buffer pool: a fixed set of in-memory frames caching disk pages.
//!
//! Frames carry a per-page read-write latch (the short critical section of
//! page access); latches are released as soon as the [`PageGuard`] drops
//! and are unrelated to transactional locks. Pinned pages are never
//! evicted; eviction uses a clock (second-chance) sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::trace;

use crate::errors::StorageError;
use crate::pager::Pager;
use crate::{Page, PageId};

const BUFFER_POOL_SIZE: usize = 128;

#[derive(Debug)]
struct Frame {
    page: RwLock<Page>,
    is_dirty: Mutex<bool>,
    pin_count: Mutex<u32>,
    recently_used: Mutex<bool>,
}

pub struct BufferPool {
    pub pager: Mutex<Pager>,
    frames: Vec<Arc<Frame>>,
    page_table: RwLock<HashMap<PageId, usize>>,
    free_list: Mutex<Vec<usize>>,
    clock_hand: Mutex<usize>,
}

/// An RAII pin on a cached page.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame: Arc<Frame>,
}

impl PageGuard<'_> {
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read().unwrap()
    }

    /// Take the write latch and mark the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        *self.frame.is_dirty.lock().unwrap() = true;
        self.frame.page.write().unwrap()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id);
    }
}

impl BufferPool {
    pub fn new(pager: Pager) -> Self {
        Self::with_capacity(pager, BUFFER_POOL_SIZE)
    }

    pub fn with_capacity(pager: Pager, capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        let mut free_list = Vec::with_capacity(capacity);
        for i in 0..capacity {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new(0)),
                is_dirty: Mutex::new(false),
                pin_count: Mutex::new(0),
                recently_used: Mutex::new(false),
            }));
            free_list.push(i);
        }
        Self {
            pager: Mutex::new(pager),
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            clock_hand: Mutex::new(0),
        }
    }

    /// Pin a page, reading it from disk on a cache miss.
    pub fn acquire_page(&self, page_id: PageId) -> Result<PageGuard<'_>, StorageError> {
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&page_id) {
            let frame = self.frames[frame_index].clone();
            self.pin_frame(&frame);
            return Ok(PageGuard {
                pool: self,
                page_id,
                frame,
            });
        }

        let frame_index = self
            .find_victim_frame()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("all buffer frames are pinned")))?;
        let frame = self.frames[frame_index].clone();

        self.evict_frame(frame_index)?;

        let new_page = self.pager.lock().unwrap().read_page(page_id)?;
        {
            let mut page = frame.page.write().unwrap();
            *page = new_page;
            *frame.is_dirty.lock().unwrap() = false;
            self.pin_frame(&frame);
        }
        self.page_table.write().unwrap().insert(page_id, frame_index);
        trace!("page {page_id} loaded into frame {frame_index}");
        Ok(PageGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Allocate a page on disk and pin it.
    pub fn new_page(&self) -> Result<PageGuard<'_>, StorageError> {
        let frame_index = self
            .find_victim_frame()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("all buffer frames are pinned")))?;
        let frame = self.frames[frame_index].clone();

        self.evict_frame(frame_index)?;

        let new_page_id = self.pager.lock().unwrap().allocate_page()?;
        {
            let mut page = frame.page.write().unwrap();
            *page = Page::new(new_page_id);
            *frame.is_dirty.lock().unwrap() = true;
            self.pin_frame(&frame);
        }
        self.page_table
            .write()
            .unwrap()
            .insert(new_page_id, frame_index);
        Ok(PageGuard {
            pool: self,
            page_id: new_page_id,
            frame,
        })
    }

    fn pin_frame(&self, frame: &Arc<Frame>) {
        let mut pin_count = frame.pin_count.lock().unwrap();
        *pin_count += 1;
        *frame.recently_used.lock().unwrap() = true;
    }

    fn unpin_page(&self, page_id: PageId) {
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&page_id) {
            let frame = &self.frames[frame_index];
            let mut pin_count = frame.pin_count.lock().unwrap();
            if *pin_count > 0 {
                *pin_count -= 1;
            }
        }
    }

    /// Drop whatever page currently occupies `frame_index`, writing it out
    /// first when dirty.
    fn evict_frame(&self, frame_index: usize) -> Result<(), StorageError> {
        let frame = &self.frames[frame_index];
        let old_page_id = {
            let page_table = self.page_table.read().unwrap();
            page_table
                .iter()
                .find(|&(_, &idx)| idx == frame_index)
                .map(|(&pid, _)| pid)
        };
        let Some(old_page_id) = old_page_id else {
            return Ok(());
        };

        let mut is_dirty = frame.is_dirty.lock().unwrap();
        if *is_dirty {
            let mut page = frame.page.write().unwrap();
            self.pager.lock().unwrap().write_page(&mut page)?;
            *is_dirty = false;
        }
        self.page_table.write().unwrap().remove(&old_page_id);
        Ok(())
    }

    /// Write one page out if it is cached and dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), StorageError> {
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&page_id) {
            let frame = &self.frames[frame_index];
            let mut is_dirty = frame.is_dirty.lock().unwrap();
            if *is_dirty {
                let mut page = frame.page.write().unwrap();
                self.pager.lock().unwrap().write_page(&mut page)?;
                *is_dirty = false;
            }
        }
        Ok(())
    }

    /// Write every dirty page out. Does not fsync; pair with [`Self::sync`].
    pub fn flush_all(&self) -> Result<(), StorageError> {
        let page_ids: Vec<PageId> = self.page_table.read().unwrap().keys().copied().collect();
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// fsync the underlying file.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.pager.lock().unwrap().flush()
    }

    /// Forget a cached page without writing it (the page is logically dead,
    /// e.g. emptied by a B+-tree merge). The file space is not reclaimed.
    pub fn discard_page(&self, page_id: PageId) {
        if let Some(frame_index) = self.page_table.write().unwrap().remove(&page_id) {
            let frame = &self.frames[frame_index];
            *frame.is_dirty.lock().unwrap() = false;
            *frame.pin_count.lock().unwrap() = 0;
            *frame.recently_used.lock().unwrap() = false;
            self.free_list.lock().unwrap().push(frame_index);
        }
    }

    fn find_victim_frame(&self) -> Option<usize> {
        if let Some(frame_index) = self.free_list.lock().unwrap().pop() {
            return Some(frame_index);
        }

        let frame_count = self.frames.len();
        if frame_count == 0 {
            return None;
        }

        let mut clock_hand = self.clock_hand.lock().unwrap();
        // Two sweeps: the first clears second-chance bits, the second picks.
        for _ in 0..(frame_count * 2) {
            let frame_index = *clock_hand;
            *clock_hand = (*clock_hand + 1) % frame_count;

            let frame = &self.frames[frame_index];
            let pin_count = frame.pin_count.lock().unwrap();
            if *pin_count == 0 {
                let mut recently_used = frame.recently_used.lock().unwrap();
                if *recently_used {
                    *recently_used = false;
                } else {
                    return Some(frame_index);
                }
            }
        }
        None
    }
}
