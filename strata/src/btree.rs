//! Page-backed B+-tree over byte-comparable keys.
//!
//! The tree stores *composite* entries: the caller's encoded key with the
//! 6-byte RID appended. Key encodings are prefix-free per type, so memcmp
//! on composites equals `(key, RID)` ordering; duplicates of a non-unique
//! index become distinct composites and every internal algorithm runs on
//! unique keys.
//!
//! Each node occupies one page, serialized as the page's only tuple; page
//! flag bit 0 marks leaves. Leaves form a doubly linked list for range
//! scans. The header page records the root, the key type tag, and the
//! height.
//!
//! Nodes split when their serialized size passes [`SPLIT_AT`] and
//! rebalance (borrow from a sibling, else merge) when they fall under
//! [`MIN_NODE_BYTES`], which keeps nodes at least half full. For 4-byte
//! INT keys this works out to roughly 250 entries per node.

use std::path::Path;
use std::sync::Mutex;

use log::debug;

use crate::buffer_pool::BufferPool;
use crate::errors::IndexError;
use crate::page::FLAG_BTREE_LEAF;
use crate::pager::Pager;
use crate::{PageId, Rid};

/// Serialized node size that triggers a split.
pub const SPLIT_AT: usize = 3000;

/// Serialized node size under which a non-root node rebalances.
pub const MIN_NODE_BYTES: usize = SPLIT_AT / 2;

/// Longest caller key accepted (before the RID suffix).
pub const MAX_KEY_LEN: usize = 1024;

const NODE_HEADER_BYTES: usize = 2 + 4 + 4; // key_count, prev_leaf, next_leaf
const NO_PAGE: PageId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Leaf,
    Internal,
}

/// In-memory image of one node. `keys` holds composite entries; leaves
/// have no child vector and internals carry `keys.len() + 1` children.
#[derive(Debug, Clone)]
struct Node {
    page_id: PageId,
    kind: NodeKind,
    keys: Vec<Vec<u8>>,
    children: Vec<PageId>,
    prev_leaf: PageId,
    next_leaf: PageId,
}

impl Node {
    fn new(page_id: PageId, kind: NodeKind) -> Self {
        Self {
            page_id,
            kind,
            keys: Vec::new(),
            children: Vec::new(),
            prev_leaf: NO_PAGE,
            next_leaf: NO_PAGE,
        }
    }

    fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    fn serialized_size(&self) -> usize {
        let keys: usize = self.keys.iter().map(|k| 2 + k.len()).sum();
        let children = match self.kind {
            NodeKind::Leaf => 0,
            NodeKind::Internal => 4 * self.children.len(),
        };
        NODE_HEADER_BYTES + keys + children
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&(self.keys.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.prev_leaf.to_be_bytes());
        buf.extend_from_slice(&self.next_leaf.to_be_bytes());
        for key in &self.keys {
            buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
            buf.extend_from_slice(key);
        }
        if self.kind == NodeKind::Internal {
            for child in &self.children {
                buf.extend_from_slice(&child.to_be_bytes());
            }
        }
        buf
    }

    fn deserialize(page_id: PageId, kind: NodeKind, data: &[u8]) -> Result<Self, IndexError> {
        let corrupt =
            |what: &str| IndexError::CorruptIndex(format!("node page {page_id}: {what}"));

        if data.len() < NODE_HEADER_BYTES {
            return Err(corrupt("truncated header"));
        }
        let key_count = u16::from_be_bytes([data[0], data[1]]) as usize;
        let prev_leaf = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let next_leaf = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);

        let mut node = Node::new(page_id, kind);
        node.prev_leaf = prev_leaf;
        node.next_leaf = next_leaf;

        let mut off = NODE_HEADER_BYTES;
        for _ in 0..key_count {
            if off + 2 > data.len() {
                return Err(corrupt("truncated key length"));
            }
            let klen = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
            off += 2;
            if off + klen > data.len() {
                return Err(corrupt("truncated key"));
            }
            node.keys.push(data[off..off + klen].to_vec());
            off += klen;
        }

        if kind == NodeKind::Internal {
            for _ in 0..key_count + 1 {
                if off + 4 > data.len() {
                    return Err(corrupt("truncated child pointer"));
                }
                node.children.push(u32::from_be_bytes([
                    data[off],
                    data[off + 1],
                    data[off + 2],
                    data[off + 3],
                ]));
                off += 4;
            }
        }
        Ok(node)
    }

    /// First index whose key is >= `key`.
    fn lower_bound(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() < key)
    }

    /// Child to descend into: separators satisfy "left < sep <= right".
    fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }

    /// Split index placing roughly half the serialized bytes on each side.
    fn split_point(&self) -> usize {
        let total: usize = self.keys.iter().map(|k| 2 + k.len()).sum();
        let mut acc = 0;
        for (i, key) in self.keys.iter().enumerate() {
            acc += 2 + key.len();
            if acc >= total / 2 && i + 1 < self.keys.len() {
                return (i + 1).min(self.keys.len() - 1).max(1);
            }
        }
        self.keys.len() / 2
    }
}

struct Meta {
    root: PageId,
    key_type: u8,
    height: u16,
}

/// A B+-tree persisted in an `.idx` file.
pub struct BTree {
    pool: BufferPool,
    meta: Mutex<Meta>,
}

/// Outcome of a recursive insert: a split that the parent must absorb.
struct Split {
    promoted: Vec<u8>,
    right: PageId,
}

impl BTree {
    /// Create a fresh index file with an empty root leaf.
    pub fn create<P: AsRef<Path>>(path: P, key_type: u8) -> Result<Self, IndexError> {
        let pager = Pager::open(path)?;
        let pool = BufferPool::new(pager);

        let root = {
            let guard = pool.new_page()?;
            let mut page = guard.write();
            page.set_flags(FLAG_BTREE_LEAF);
            let node = Node::new(page.id, NodeKind::Leaf);
            if page.insert_tuple(&node.serialize()).is_none() {
                return Err(IndexError::CorruptIndex("empty node does not fit".into()));
            }
            page.id
        };

        let tree = Self {
            pool,
            meta: Mutex::new(Meta {
                root,
                key_type,
                height: 1,
            }),
        };
        tree.write_meta()?;
        tree.flush()?;
        Ok(tree)
    }

    /// Open an existing index file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let mut pager = Pager::open(path)?;
        let payload = pager.read_header()?;
        if payload.len() < 7 {
            return Err(IndexError::CorruptIndex("short header page".into()));
        }
        let root = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let key_type = payload[4];
        let height = u16::from_be_bytes([payload[5], payload[6]]);
        if root == NO_PAGE {
            return Err(IndexError::CorruptIndex("header has no root".into()));
        }
        Ok(Self {
            pool: BufferPool::new(pager),
            meta: Mutex::new(Meta {
                root,
                key_type,
                height,
            }),
        })
    }

    pub fn key_type(&self) -> u8 {
        self.meta.lock().unwrap().key_type
    }

    pub fn height(&self) -> u16 {
        self.meta.lock().unwrap().height
    }

    fn write_meta(&self) -> Result<(), IndexError> {
        let meta = self.meta.lock().unwrap();
        let mut payload = [0u8; 7];
        payload[0..4].copy_from_slice(&meta.root.to_be_bytes());
        payload[4] = meta.key_type;
        payload[5..7].copy_from_slice(&meta.height.to_be_bytes());
        self.pool.pager.lock().unwrap().write_header(&payload)?;
        Ok(())
    }

    /// Write dirty node pages and fsync the file.
    pub fn flush(&self) -> Result<(), IndexError> {
        self.pool.flush_all()?;
        self.pool.sync()?;
        Ok(())
    }

    // ── Node I/O ──────────────────────────────────────────────────────

    fn read_node(&self, page_id: PageId) -> Result<Node, IndexError> {
        let guard = self.pool.acquire_page(page_id)?;
        let page = guard.read();
        let kind = if page.flags() & FLAG_BTREE_LEAF != 0 {
            NodeKind::Leaf
        } else {
            NodeKind::Internal
        };
        let blob = page
            .get_tuple(0)
            .ok_or_else(|| IndexError::CorruptIndex(format!("node page {page_id} is empty")))?;
        Node::deserialize(page_id, kind, blob)
    }

    fn write_node(&self, node: &Node) -> Result<(), IndexError> {
        let guard = self.pool.acquire_page(node.page_id)?;
        let mut page = guard.write();
        page.set_flags(match node.kind {
            NodeKind::Leaf => FLAG_BTREE_LEAF,
            NodeKind::Internal => 0,
        });
        let blob = node.serialize();
        let ok = if page.get_tuple(0).is_some() {
            page.update_tuple(0, &blob)
        } else {
            page.insert_tuple(&blob) == Some(0)
        };
        if !ok {
            return Err(IndexError::CorruptIndex(format!(
                "node blob of {} bytes does not fit page {}",
                blob.len(),
                node.page_id
            )));
        }
        Ok(())
    }

    fn alloc_node(&self, kind: NodeKind) -> Result<Node, IndexError> {
        let guard = self.pool.new_page()?;
        let mut page = guard.write();
        page.set_flags(match kind {
            NodeKind::Leaf => FLAG_BTREE_LEAF,
            NodeKind::Internal => 0,
        });
        let node = Node::new(page.id, kind);
        if page.insert_tuple(&node.serialize()).is_none() {
            return Err(IndexError::CorruptIndex("empty node does not fit".into()));
        }
        Ok(node)
    }

    fn compose(key: &[u8], rid: Rid) -> Result<Vec<u8>, IndexError> {
        if key.len() > MAX_KEY_LEN {
            return Err(IndexError::KeyTooLarge { len: key.len() });
        }
        let mut composite = Vec::with_capacity(key.len() + Rid::ENCODED_LEN);
        composite.extend_from_slice(key);
        composite.extend_from_slice(&rid.to_bytes());
        Ok(composite)
    }

    fn decompose(composite: &[u8]) -> (&[u8], Rid) {
        let split = composite.len() - Rid::ENCODED_LEN;
        (
            &composite[..split],
            Rid::from_bytes(&composite[split..]),
        )
    }

    // ── Search ────────────────────────────────────────────────────────

    /// Leaf that would hold `probe`, descending from the root.
    fn find_leaf(&self, probe: &[u8]) -> Result<Node, IndexError> {
        let mut node = self.read_node(self.meta.lock().unwrap().root)?;
        while !node.is_leaf() {
            let idx = node.child_index(probe);
            node = self.read_node(node.children[idx])?;
        }
        Ok(node)
    }

    /// First RID stored under `key`, or `None`.
    pub fn search(&self, key: &[u8]) -> Result<Option<Rid>, IndexError> {
        let probe = Self::probe_low(key);
        let mut leaf = self.find_leaf(&probe)?;
        loop {
            let pos = leaf.lower_bound(&probe);
            if let Some(composite) = leaf.keys.get(pos) {
                let (entry_key, rid) = Self::decompose(composite);
                return Ok((entry_key == key).then_some(rid));
            }
            // Landed past the last entry; the run, if any, starts in the
            // next leaf.
            if leaf.next_leaf == NO_PAGE {
                return Ok(None);
            }
            leaf = self.read_node(leaf.next_leaf)?;
        }
    }

    /// Every RID stored under `key`, in RID order.
    pub fn search_all(&self, key: &[u8]) -> Result<Vec<Rid>, IndexError> {
        let mut rids = Vec::new();
        for entry in self.range(Some((key, true)), Some((key, true))) {
            let (_, rid) = entry?;
            rids.push(rid);
        }
        Ok(rids)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool, IndexError> {
        Ok(self.search(key)?.is_some())
    }

    /// Smallest composite that any entry for `key` can have.
    fn probe_low(key: &[u8]) -> Vec<u8> {
        let mut probe = key.to_vec();
        probe.extend_from_slice(&[0u8; Rid::ENCODED_LEN]);
        probe
    }

    /// Lazy ascending scan over `[lo, hi]`; each bound is `(key,
    /// inclusive)` and `None` leaves that end open.
    pub fn range(
        &self,
        lo: Option<(&[u8], bool)>,
        hi: Option<(&[u8], bool)>,
    ) -> RangeScan<'_> {
        RangeScan {
            tree: self,
            state: ScanState::NotStarted {
                lo: lo.map(|(k, incl)| (k.to_vec(), incl)),
            },
            hi: hi.map(|(k, incl)| (k.to_vec(), incl)),
        }
    }

    // ── Insert ────────────────────────────────────────────────────────

    /// Insert `(key, rid)`. With `unique`, any existing entry under `key`
    /// rejects the insert; without it, re-inserting the exact same pair is
    /// a no-op.
    pub fn insert(&self, key: &[u8], rid: Rid, unique: bool) -> Result<(), IndexError> {
        if unique && self.contains_key(key)? {
            return Err(IndexError::DuplicateKey);
        }
        let composite = Self::compose(key, rid)?;

        let root = self.meta.lock().unwrap().root;
        if let Some(split) = self.insert_rec(root, &composite)? {
            // The root split: grow the tree by one level.
            let mut new_root = self.alloc_node(NodeKind::Internal)?;
            new_root.keys.push(split.promoted);
            new_root.children.push(root);
            new_root.children.push(split.right);
            self.write_node(&new_root)?;

            let mut meta = self.meta.lock().unwrap();
            meta.root = new_root.page_id;
            meta.height += 1;
            debug!("btree root split; height now {}", meta.height);
            drop(meta);
            self.write_meta()?;
        }
        Ok(())
    }

    fn insert_rec(&self, page_id: PageId, composite: &[u8]) -> Result<Option<Split>, IndexError> {
        let mut node = self.read_node(page_id)?;

        if node.is_leaf() {
            let pos = node.lower_bound(composite);
            if node.keys.get(pos).map(Vec::as_slice) == Some(composite) {
                return Ok(None); // exact (key, rid) already present
            }
            node.keys.insert(pos, composite.to_vec());
            if node.serialized_size() > SPLIT_AT {
                return Ok(Some(self.split_leaf(&mut node)?));
            }
            self.write_node(&node)?;
            return Ok(None);
        }

        let idx = node.child_index(composite);
        let Some(split) = self.insert_rec(node.children[idx], composite)? else {
            return Ok(None);
        };

        node.keys.insert(idx, split.promoted);
        node.children.insert(idx + 1, split.right);
        if node.serialized_size() > SPLIT_AT {
            return Ok(Some(self.split_internal(&mut node)?));
        }
        self.write_node(&node)?;
        Ok(None)
    }

    /// Split a leaf at its byte midpoint. The first key of the new right
    /// leaf is *copied* up.
    fn split_leaf(&self, node: &mut Node) -> Result<Split, IndexError> {
        let mid = node.split_point();
        let mut right = self.alloc_node(NodeKind::Leaf)?;
        right.keys = node.keys.split_off(mid);
        right.prev_leaf = node.page_id;
        right.next_leaf = node.next_leaf;
        node.next_leaf = right.page_id;

        if right.next_leaf != NO_PAGE {
            let mut after = self.read_node(right.next_leaf)?;
            after.prev_leaf = right.page_id;
            self.write_node(&after)?;
        }

        let promoted = right.keys[0].clone();
        self.write_node(node)?;
        self.write_node(&right)?;
        Ok(Split {
            promoted,
            right: right.page_id,
        })
    }

    /// Split an internal node; the middle key moves up and out.
    fn split_internal(&self, node: &mut Node) -> Result<Split, IndexError> {
        let mid = node.split_point();
        let mut right = self.alloc_node(NodeKind::Internal)?;
        right.keys = node.keys.split_off(mid + 1);
        right.children = node.children.split_off(mid + 1);
        let promoted = node.keys.pop().expect("split point below key count");

        self.write_node(node)?;
        self.write_node(&right)?;
        Ok(Split {
            promoted,
            right: right.page_id,
        })
    }

    // ── Delete ────────────────────────────────────────────────────────

    /// Remove the `(key, rid)` pair. Returns whether it was present.
    pub fn delete(&self, key: &[u8], rid: Rid) -> Result<bool, IndexError> {
        let composite = Self::compose(key, rid)?;
        let root = self.meta.lock().unwrap().root;
        let outcome = self.delete_rec(root, &composite)?;
        if !outcome.removed {
            return Ok(false);
        }

        // Shrink the tree while the root is an internal node with a single
        // child.
        loop {
            let root = self.meta.lock().unwrap().root;
            let node = self.read_node(root)?;
            if node.is_leaf() || !node.keys.is_empty() {
                break;
            }
            let only_child = node.children[0];
            {
                let mut meta = self.meta.lock().unwrap();
                meta.root = only_child;
                meta.height -= 1;
                debug!("btree root collapsed; height now {}", meta.height);
            }
            self.pool.discard_page(root);
            self.write_meta()?;
        }
        Ok(true)
    }

    fn delete_rec(&self, page_id: PageId, composite: &[u8]) -> Result<DeleteOutcome, IndexError> {
        let mut node = self.read_node(page_id)?;

        if node.is_leaf() {
            let pos = node.lower_bound(composite);
            if node.keys.get(pos).map(Vec::as_slice) != Some(composite) {
                return Ok(DeleteOutcome {
                    removed: false,
                    underflow: false,
                    new_min: None,
                });
            }
            node.keys.remove(pos);
            self.write_node(&node)?;
            return Ok(DeleteOutcome {
                removed: true,
                underflow: node.serialized_size() < MIN_NODE_BYTES,
                new_min: node.keys.first().cloned(),
            });
        }

        let idx = node.child_index(composite);
        let child_outcome = self.delete_rec(node.children[idx], composite)?;
        if !child_outcome.removed {
            return Ok(DeleteOutcome {
                removed: false,
                underflow: false,
                new_min: None,
            });
        }

        // Keep the separator equal to the smallest key of its right
        // subtree.
        if idx > 0 {
            if let Some(min) = child_outcome.new_min.clone() {
                node.keys[idx - 1] = min;
            }
        }

        if child_outcome.underflow {
            self.rebalance_child(&mut node, idx)?;
        }
        self.write_node(&node)?;

        Ok(DeleteOutcome {
            removed: true,
            underflow: node.serialized_size() < MIN_NODE_BYTES,
            new_min: self.subtree_min(&node)?,
        })
    }

    fn subtree_min(&self, node: &Node) -> Result<Option<Vec<u8>>, IndexError> {
        if node.is_leaf() {
            return Ok(node.keys.first().cloned());
        }
        let mut current = self.read_node(node.children[0])?;
        while !current.is_leaf() {
            current = self.read_node(current.children[0])?;
        }
        Ok(current.keys.first().cloned())
    }

    /// Fix an underfull child of `parent` at `idx`: borrow one entry from
    /// a sibling when the sibling can spare it, otherwise merge. When
    /// neither is possible (oversized variable-length keys) the underflow
    /// is tolerated.
    fn rebalance_child(&self, parent: &mut Node, idx: usize) -> Result<(), IndexError> {
        let mut child = self.read_node(parent.children[idx])?;

        if idx > 0 {
            let mut left = self.read_node(parent.children[idx - 1])?;
            if self.try_borrow_from_left(parent, idx, &mut left, &mut child)? {
                return Ok(());
            }
            if self.merge_nodes(parent, idx - 1, &mut left, &mut child)? {
                return Ok(());
            }
        }
        if idx + 1 < parent.children.len() {
            let mut right = self.read_node(parent.children[idx + 1])?;
            if self.try_borrow_from_right(parent, idx, &mut child, &mut right)? {
                return Ok(());
            }
            if self.merge_nodes(parent, idx, &mut child, &mut right)? {
                return Ok(());
            }
        }
        Ok(())
    }

    fn try_borrow_from_left(
        &self,
        parent: &mut Node,
        idx: usize,
        left: &mut Node,
        child: &mut Node,
    ) -> Result<bool, IndexError> {
        let donated = match left.keys.last() {
            Some(k) => 2 + k.len(),
            None => return Ok(false),
        };
        if left.serialized_size() - donated < MIN_NODE_BYTES {
            return Ok(false);
        }

        if child.is_leaf() {
            let moved = left.keys.pop().expect("left leaf has keys");
            child.keys.insert(0, moved);
            parent.keys[idx - 1] = child.keys[0].clone();
        } else {
            // Rotate through the parent separator.
            let separator = parent.keys[idx - 1].clone();
            child.keys.insert(0, separator);
            let moved_child = left.children.pop().expect("left internal has children");
            child.children.insert(0, moved_child);
            parent.keys[idx - 1] = left.keys.pop().expect("left internal has keys");
        }
        self.write_node(left)?;
        self.write_node(child)?;
        Ok(true)
    }

    fn try_borrow_from_right(
        &self,
        parent: &mut Node,
        idx: usize,
        child: &mut Node,
        right: &mut Node,
    ) -> Result<bool, IndexError> {
        let donated = match right.keys.first() {
            Some(k) => 2 + k.len(),
            None => return Ok(false),
        };
        if right.serialized_size() - donated < MIN_NODE_BYTES {
            return Ok(false);
        }

        if child.is_leaf() {
            let moved = right.keys.remove(0);
            child.keys.push(moved);
            parent.keys[idx] = right.keys[0].clone();
        } else {
            let separator = parent.keys[idx].clone();
            child.keys.push(separator);
            child.children.push(right.children.remove(0));
            parent.keys[idx] = right.keys.remove(0);
        }
        self.write_node(child)?;
        self.write_node(right)?;
        Ok(true)
    }

    /// Merge `parent.children[left_idx + 1]` into `parent.children[left_idx]`.
    fn merge_nodes(
        &self,
        parent: &mut Node,
        left_idx: usize,
        left: &mut Node,
        right: &mut Node,
    ) -> Result<bool, IndexError> {
        let separator = parent.keys[left_idx].clone();
        let merged_size = left.serialized_size() + right.serialized_size()
            - NODE_HEADER_BYTES
            + if left.is_leaf() { 0 } else { 2 + separator.len() };
        if merged_size > SPLIT_AT {
            return Ok(false);
        }

        if left.is_leaf() {
            left.keys.append(&mut right.keys);
            left.next_leaf = right.next_leaf;
            if right.next_leaf != NO_PAGE {
                let mut after = self.read_node(right.next_leaf)?;
                after.prev_leaf = left.page_id;
                self.write_node(&after)?;
            }
        } else {
            left.keys.push(separator);
            left.keys.append(&mut right.keys);
            left.children.append(&mut right.children);
        }

        parent.keys.remove(left_idx);
        parent.children.remove(left_idx + 1);
        self.write_node(left)?;
        self.pool.discard_page(right.page_id);
        Ok(true)
    }

    // ── Verification ──────────────────────────────────────────────────

    /// Walk the whole tree and report structural violations: unsorted
    /// keys, separator bounds, child counts, broken leaf links, uneven
    /// depth. An empty vector means the tree is healthy.
    pub fn check_invariants(&self) -> Result<Vec<String>, IndexError> {
        let mut issues = Vec::new();
        let root = self.meta.lock().unwrap().root;
        let mut leaf_depth = None;
        self.check_node(root, None, None, 0, &mut leaf_depth, &mut issues)?;
        self.check_leaf_chain(&mut issues)?;
        Ok(issues)
    }

    fn check_node(
        &self,
        page_id: PageId,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        issues: &mut Vec<String>,
    ) -> Result<(), IndexError> {
        let node = self.read_node(page_id)?;

        for pair in node.keys.windows(2) {
            if pair[0] >= pair[1] {
                issues.push(format!("page {page_id}: keys not strictly sorted"));
            }
        }
        for key in &node.keys {
            if let Some(min) = min {
                if key.as_slice() < min {
                    issues.push(format!("page {page_id}: key below parent separator"));
                }
            }
            if let Some(max) = max {
                if key.as_slice() >= max {
                    issues.push(format!("page {page_id}: key at/above parent separator"));
                }
            }
        }

        if node.is_leaf() {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    issues.push(format!("page {page_id}: leaf at depth {depth}, expected {d}"))
                }
                _ => {}
            }
            return Ok(());
        }

        if node.children.len() != node.keys.len() + 1 {
            issues.push(format!(
                "page {page_id}: {} keys but {} children",
                node.keys.len(),
                node.children.len()
            ));
            return Ok(());
        }
        for (i, &child) in node.children.iter().enumerate() {
            let lo = if i > 0 { Some(node.keys[i - 1].as_slice()) } else { min };
            let hi = if i < node.keys.len() {
                Some(node.keys[i].as_slice())
            } else {
                max
            };
            self.check_node(child, lo, hi, depth + 1, leaf_depth, issues)?;

            // Separator must equal the smallest key of its right subtree.
            if i > 0 {
                let child_node = self.read_node(child)?;
                if let Some(actual_min) = self.subtree_min(&child_node)? {
                    if actual_min != node.keys[i - 1] {
                        issues.push(format!(
                            "page {page_id}: separator {i} is not the right subtree minimum"
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_leaf_chain(&self, issues: &mut Vec<String>) -> Result<(), IndexError> {
        let mut node = self.read_node(self.meta.lock().unwrap().root)?;
        while !node.is_leaf() {
            node = self.read_node(node.children[0])?;
        }

        let mut visited = std::collections::HashSet::new();
        let mut prev_id = NO_PAGE;
        let mut prev_last: Option<Vec<u8>> = None;
        loop {
            if !visited.insert(node.page_id) {
                issues.push(format!("leaf chain cycle at page {}", node.page_id));
                return Ok(());
            }
            if node.prev_leaf != prev_id {
                issues.push(format!(
                    "page {}: prev link is {}, expected {}",
                    node.page_id, node.prev_leaf, prev_id
                ));
            }
            if let (Some(prev_last), Some(first)) = (&prev_last, node.keys.first()) {
                if first < prev_last {
                    issues.push(format!("leaf chain ordering broken at page {}", node.page_id));
                }
            }
            if let Some(last) = node.keys.last() {
                prev_last = Some(last.clone());
            }
            if node.next_leaf == NO_PAGE {
                return Ok(());
            }
            prev_id = node.page_id;
            node = self.read_node(node.next_leaf)?;
        }
    }
}

struct DeleteOutcome {
    removed: bool,
    underflow: bool,
    new_min: Option<Vec<u8>>,
}

enum ScanState {
    NotStarted { lo: Option<(Vec<u8>, bool)> },
    Walking { page_id: PageId, pos: usize },
    Done,
}

/// Lazy ascending `(key, RID)` scan. Each step pins at most one leaf.
pub struct RangeScan<'a> {
    tree: &'a BTree,
    state: ScanState,
    hi: Option<(Vec<u8>, bool)>,
}

impl RangeScan<'_> {
    fn start(&mut self) -> Result<(), IndexError> {
        let ScanState::NotStarted { lo } = &self.state else {
            return Ok(());
        };
        let leaf = match lo {
            Some((key, _incl)) => self.tree.find_leaf(&BTree::probe_low(key))?,
            None => {
                let mut node = self.tree.read_node(self.tree.meta.lock().unwrap().root)?;
                while !node.is_leaf() {
                    node = self.tree.read_node(node.children[0])?;
                }
                node
            }
        };
        let pos = match lo {
            Some((key, incl)) => {
                let probe = if *incl {
                    BTree::probe_low(key)
                } else {
                    // First composite past every entry for `key`.
                    let mut probe = key.to_vec();
                    probe.extend_from_slice(&[0xFFu8; Rid::ENCODED_LEN]);
                    probe.push(0xFF);
                    probe
                };
                leaf.lower_bound(&probe)
            }
            None => 0,
        };
        self.state = ScanState::Walking {
            page_id: leaf.page_id,
            pos,
        };
        Ok(())
    }

    fn step(&mut self) -> Result<Option<(Vec<u8>, Rid)>, IndexError> {
        self.start()?;
        loop {
            let (page_id, pos) = match &self.state {
                ScanState::Walking { page_id, pos } => (*page_id, *pos),
                _ => return Ok(None),
            };
            let node = self.tree.read_node(page_id)?;
            if let Some(composite) = node.keys.get(pos) {
                let (key, rid) = BTree::decompose(composite);
                if let Some((hi, incl)) = &self.hi {
                    let beyond = if *incl {
                        key > hi.as_slice()
                    } else {
                        key >= hi.as_slice()
                    };
                    if beyond {
                        self.state = ScanState::Done;
                        return Ok(None);
                    }
                }
                self.state = ScanState::Walking {
                    page_id,
                    pos: pos + 1,
                };
                return Ok(Some((key.to_vec(), rid)));
            }
            if node.next_leaf == NO_PAGE {
                self.state = ScanState::Done;
                return Ok(None);
            }
            self.state = ScanState::Walking {
                page_id: node.next_leaf,
                pos: 0,
            };
        }
    }
}

impl Iterator for RangeScan<'_> {
    type Item = Result<(Vec<u8>, Rid), IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(e) => {
                self.state = ScanState::Done;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn int_key(v: i32) -> Vec<u8> {
        // Order-preserving signed encoding: flip the sign bit.
        let raw = v.to_be_bytes();
        vec![raw[0] ^ 0x80, raw[1], raw[2], raw[3]]
    }

    fn new_tree(dir: &tempfile::TempDir) -> BTree {
        BTree::create(dir.path().join("t.idx"), 0).unwrap()
    }

    #[test]
    fn insert_search_and_miss() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);
        tree.insert(&int_key(42), Rid::new(1, 0), false).unwrap();
        tree.insert(&int_key(7), Rid::new(1, 1), false).unwrap();

        assert_eq!(tree.search(&int_key(42)).unwrap(), Some(Rid::new(1, 0)));
        assert_eq!(tree.search(&int_key(7)).unwrap(), Some(Rid::new(1, 1)));
        assert_eq!(tree.search(&int_key(99)).unwrap(), None);
    }

    #[test]
    fn splits_keep_order_and_height() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);
        let n = 2000;
        for i in 0..n {
            let v = (i * 7919) % n; // scattered insert order
            tree.insert(&int_key(v), Rid::new(1, (v % 1000) as u16), false)
                .unwrap();
        }
        assert!(tree.height() > 1);
        assert!(tree.check_invariants().unwrap().is_empty());

        let keys: Vec<i32> = tree
            .range(None, None)
            .map(|r| {
                let (k, _) = r.unwrap();
                i32::from_be_bytes([k[0] ^ 0x80, k[1], k[2], k[3]])
            })
            .collect();
        assert_eq!(keys.len(), n as usize);
        for pair in keys.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn range_scan_bounds() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);
        for v in 1..=1000 {
            tree.insert(&int_key(v), Rid::new(1, (v % 500) as u16), false)
                .unwrap();
        }

        let lo = int_key(100);
        let hi = int_key(105);
        let got: Vec<i32> = tree
            .range(Some((&lo, true)), Some((&hi, true)))
            .map(|r| {
                let (k, _) = r.unwrap();
                i32::from_be_bytes([k[0] ^ 0x80, k[1], k[2], k[3]])
            })
            .collect();
        assert_eq!(got, vec![100, 101, 102, 103, 104, 105]);

        let exclusive: Vec<i32> = tree
            .range(Some((&lo, false)), Some((&hi, false)))
            .map(|r| {
                let (k, _) = r.unwrap();
                i32::from_be_bytes([k[0] ^ 0x80, k[1], k[2], k[3]])
            })
            .collect();
        assert_eq!(exclusive, vec![101, 102, 103, 104]);
    }

    #[test]
    fn duplicates_are_kept_per_rid() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);
        let key = int_key(5);
        tree.insert(&key, Rid::new(1, 0), false).unwrap();
        tree.insert(&key, Rid::new(1, 1), false).unwrap();
        tree.insert(&key, Rid::new(2, 0), false).unwrap();

        let rids = tree.search_all(&key).unwrap();
        assert_eq!(
            rids,
            vec![Rid::new(1, 0), Rid::new(1, 1), Rid::new(2, 0)]
        );

        assert!(tree.delete(&key, Rid::new(1, 1)).unwrap());
        assert_eq!(
            tree.search_all(&key).unwrap(),
            vec![Rid::new(1, 0), Rid::new(2, 0)]
        );
        assert!(!tree.delete(&key, Rid::new(1, 1)).unwrap());
    }

    #[test]
    fn unique_index_rejects_duplicate_key() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);
        tree.insert(&int_key(1), Rid::new(1, 0), true).unwrap();
        assert!(matches!(
            tree.insert(&int_key(1), Rid::new(1, 1), true),
            Err(IndexError::DuplicateKey)
        ));
        // Same key, same rid, non-unique: idempotent.
        tree.insert(&int_key(1), Rid::new(1, 0), false).unwrap();
    }

    #[test]
    fn delete_shrinks_the_tree() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);
        let n = 2000;
        for v in 0..n {
            tree.insert(&int_key(v), Rid::new(1, (v % 1000) as u16), false)
                .unwrap();
        }
        let tall = tree.height();
        assert!(tall > 1);

        for v in 0..n {
            assert!(tree.delete(&int_key(v), Rid::new(1, (v % 1000) as u16)).unwrap());
        }
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.range(None, None).count(), 0);
        assert!(tree.check_invariants().unwrap().is_empty());
    }

    #[test]
    fn random_workload_keeps_invariants() {
        use rand::{Rng, SeedableRng};
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut shadow: std::collections::BTreeSet<(Vec<u8>, Rid)> = Default::default();

        for round in 0..3000 {
            let v = rng.gen_range(-500..500);
            let rid = Rid::new(rng.gen_range(1..4), rng.gen_range(0..8));
            let key = int_key(v);
            if rng.gen_bool(0.6) {
                tree.insert(&key, rid, false).unwrap();
                shadow.insert((key, rid));
            } else {
                let expected = shadow.remove(&(key.clone(), rid));
                assert_eq!(tree.delete(&key, rid).unwrap(), expected, "round {round}");
            }
        }

        assert!(tree.check_invariants().unwrap().is_empty());
        let scanned: Vec<(Vec<u8>, Rid)> = tree
            .range(None, None)
            .map(|r| r.unwrap())
            .collect();
        let expected: Vec<(Vec<u8>, Rid)> = shadow.into_iter().collect();
        assert_eq!(scanned, expected);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.idx");
        {
            let tree = BTree::create(&path, 3).unwrap();
            for v in 0..500 {
                tree.insert(&int_key(v), Rid::new(1, (v % 100) as u16), false)
                    .unwrap();
            }
            tree.flush().unwrap();
        }

        let tree = BTree::open(&path).unwrap();
        assert_eq!(tree.key_type(), 3);
        assert_eq!(tree.search(&int_key(123)).unwrap(), Some(Rid::new(1, 23)));
        assert_eq!(tree.range(None, None).count(), 500);
        assert!(tree.check_invariants().unwrap().is_empty());
    }

    #[test]
    fn oversized_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);
        let huge = vec![0u8; MAX_KEY_LEN + 1];
        assert!(matches!(
            tree.insert(&huge, Rid::new(1, 0), false),
            Err(IndexError::KeyTooLarge { .. })
        ));
    }
}
