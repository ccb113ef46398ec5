//! The page→block conversion tree (PBCT).
//!
//! A shallow bushy tree mapping a page id to the block holding the page's
//! latest version. The root node or root leaf lives in the head of block
//! 0's content, sharing the block with the file header; every other node
//! and leaf is a multiplex group allocated from the allocation tables.
//!
//! Internal nodes hold a count and an array of child block ids. Leaves
//! hold a count and an array of `(latest block id, timestamp)` entries;
//! the timestamp records the newest version's stamp in the current
//! format, the oldest version's stamp in the first format.

use crate::block::{get_u32, get_u64, put_u32, put_u64, BlockId, TimeStamp, ILLEGAL_BLOCK_ID};
use crate::vlog::header::FILE_HEADER_LEN;

const COUNT_LEN: usize = 4;
const CHILD_LEN: usize = 4;
const ENTRY_LEN: usize = 12;

/// Fan-out arithmetic for one block size.
#[derive(Clone, Copy, Debug)]
pub struct PbctGeom {
    content_len: usize,
}

impl PbctGeom {
    /// Geometry for a content size.
    pub fn new(content_len: usize) -> Self {
        Self { content_len }
    }

    fn usable(&self, not_root: bool) -> usize {
        if not_root {
            self.content_len
        } else {
            // The root shares its block with the file header.
            self.content_len - FILE_HEADER_LEN
        }
    }

    /// Children an internal node can hold. `not_root` selects between
    /// an ordinary node and the root node living beside the header.
    pub fn node_capacity(&self, not_root: bool) -> usize {
        (self.usable(not_root) - COUNT_LEN) / CHILD_LEN
    }

    /// Entries a leaf can hold. `not_root` as for
    /// [`PbctGeom::node_capacity`].
    pub fn leaf_capacity(&self, not_root: bool) -> usize {
        (self.usable(not_root) - COUNT_LEN) / ENTRY_LEN
    }

    /// Pages addressed by one leaf of a tree of the given depth.
    pub fn pages_per_leaf(&self, level: u32) -> usize {
        self.leaf_capacity(level != 0)
    }

    /// The minimum tree depth able to address `page_id`.
    pub fn required_level(&self, page_id: BlockId) -> u32 {
        let n = self.node_capacity(true);
        let l = self.leaf_capacity(true);
        let mut level = 0u32;
        let mut reach = self.leaf_capacity(false) as u64;
        while reach <= u64::from(page_id) {
            reach = if level == 0 {
                self.node_capacity(false) as u64 * l as u64
            } else {
                reach * n as u64
            };
            level += 1;
        }
        level
    }

    /// Index of the child to follow at depth `current` of a tree of
    /// depth `level` when resolving `page_id`.
    pub fn node_slot(&self, page_id: BlockId, current: u32, level: u32) -> usize {
        debug_assert!(current < level);
        let n = self.node_capacity(true) as u64;
        let l = self.leaf_capacity(true) as u64;
        let m = l * n.pow(level - current - 1);
        let width = m * if current > 0 {
            n
        } else {
            self.node_capacity(false) as u64
        };
        ((u64::from(page_id) % width) / m) as usize
    }

    /// Index of `page_id`'s entry within its leaf.
    pub fn leaf_slot(&self, page_id: BlockId) -> usize {
        page_id as usize % self.leaf_capacity(true)
    }

    /// First page id addressed by the leaf containing `page_id` in a
    /// tree of depth `level`.
    pub fn leaf_first_page(&self, page_id: BlockId, level: u32) -> BlockId {
        let l = self.pages_per_leaf(level) as BlockId;
        page_id / l * l
    }
}

/// Operations on an internal node stored in a content slice.
pub mod node {
    use super::*;

    /// Number of recorded children.
    pub fn count(content: &[u8]) -> u32 {
        get_u32(content, 0)
    }

    /// Child id at slot `i`.
    pub fn child(content: &[u8], i: usize) -> BlockId {
        get_u32(content, COUNT_LEN + CHILD_LEN * i)
    }

    /// Records a child id at slot `i`, maintaining the count.
    pub fn set_child(content: &mut [u8], i: usize, id: BlockId) {
        let old = child(content, i);
        if old == ILLEGAL_BLOCK_ID && id != ILLEGAL_BLOCK_ID {
            put_u32(content, 0, count(content) + 1);
        } else if old != ILLEGAL_BLOCK_ID && id == ILLEGAL_BLOCK_ID {
            put_u32(content, 0, count(content) - 1);
        }
        put_u32(content, COUNT_LEN + CHILD_LEN * i, id);
    }

    /// Initialises an empty node with `capacity` slots.
    pub fn initialize(content: &mut [u8], capacity: usize) {
        put_u32(content, 0, 0);
        for i in 0..capacity {
            put_u32(content, COUNT_LEN + CHILD_LEN * i, ILLEGAL_BLOCK_ID);
        }
    }

    /// Copies `capacity` slots and the count from another node image.
    pub fn copy(dst: &mut [u8], src: &[u8], capacity: usize) {
        let len = COUNT_LEN + CHILD_LEN * capacity;
        dst[..len].copy_from_slice(&src[..len]);
    }

    /// Number of slots actually holding a child id.
    pub fn occupancy(content: &[u8], capacity: usize) -> u32 {
        (0..capacity)
            .filter(|i| child(content, *i) != ILLEGAL_BLOCK_ID)
            .count() as u32
    }

    /// Rewrites the count word from the actual occupancy.
    pub fn recount(content: &mut [u8], capacity: usize) {
        let n = occupancy(content, capacity);
        put_u32(content, 0, n);
    }
}

/// Operations on a leaf stored in a content slice.
pub mod leaf {
    use super::*;

    /// Number of recorded latest entries.
    pub fn count(content: &[u8]) -> u32 {
        get_u32(content, 0)
    }

    /// Latest version block id at slot `i`.
    pub fn latest(content: &[u8], i: usize) -> BlockId {
        get_u32(content, COUNT_LEN + ENTRY_LEN * i)
    }

    /// Timestamp recorded at slot `i`.
    pub fn timestamp(content: &[u8], i: usize) -> TimeStamp {
        get_u64(content, COUNT_LEN + ENTRY_LEN * i + 4)
    }

    /// Records a latest id at slot `i`, maintaining the count.
    pub fn set_latest(content: &mut [u8], i: usize, id: BlockId) {
        let old = latest(content, i);
        if old == ILLEGAL_BLOCK_ID && id != ILLEGAL_BLOCK_ID {
            put_u32(content, 0, count(content) + 1);
        } else if old != ILLEGAL_BLOCK_ID && id == ILLEGAL_BLOCK_ID {
            put_u32(content, 0, count(content) - 1);
        }
        put_u32(content, COUNT_LEN + ENTRY_LEN * i, id);
    }

    /// Records a timestamp at slot `i`.
    pub fn set_timestamp(content: &mut [u8], i: usize, ts: TimeStamp) {
        put_u64(content, COUNT_LEN + ENTRY_LEN * i + 4, ts);
    }

    /// Initialises an empty leaf with `capacity` entries.
    pub fn initialize(content: &mut [u8], capacity: usize) {
        put_u32(content, 0, 0);
        for i in 0..capacity {
            put_u32(content, COUNT_LEN + ENTRY_LEN * i, ILLEGAL_BLOCK_ID);
            put_u64(content, COUNT_LEN + ENTRY_LEN * i + 4, crate::block::ILLEGAL_TIMESTAMP);
        }
    }

    /// Copies `capacity` entries and the count from another leaf image.
    pub fn copy(dst: &mut [u8], src: &[u8], capacity: usize) {
        let len = COUNT_LEN + ENTRY_LEN * capacity;
        dst[..len].copy_from_slice(&src[..len]);
    }

    /// Number of slots actually holding a latest id.
    pub fn occupancy(content: &[u8], capacity: usize) -> u32 {
        (0..capacity)
            .filter(|i| latest(content, *i) != ILLEGAL_BLOCK_ID)
            .count() as u32
    }

    /// Rewrites the count word from the actual occupancy.
    pub fn recount(content: &mut [u8], capacity: usize) {
        let n = occupancy(content, capacity);
        put_u32(content, 0, n);
    }
}
