//! Fixed-size blocks: the unit of I/O for every file of a version store.
//!
//! A block carries an 8-byte last-modification timestamp, the content, and
//! a CRC32 trailer computed over everything before it. All higher-level
//! structures (file headers, allocation tables, tree nodes, version blocks)
//! are stored as blocks.

use crate::error::{Result, UmbraError};

/// Zero-based ordinal of a block within one file.
pub type BlockId = u32;

/// Zero-based ordinal of a logical page within the store.
pub type PageId = u32;

/// Value of an invalid block identifier.
pub const ILLEGAL_BLOCK_ID: BlockId = BlockId::MAX;

/// Monotonic timestamp assigned on every dirty unfix.
pub type TimeStamp = u64;

/// Value of an invalid timestamp.
pub const ILLEGAL_TIMESTAMP: TimeStamp = TimeStamp::MAX;

/// How many consecutive physical blocks replicate one logical metadata
/// block. Headers, allocation tables, and tree nodes are all stored this
/// many times so that either of the last two checkpoint epochs can be
/// recovered.
pub const MULTIPLEX_COUNT: usize = 3;

/// Bytes of the block header (the last-modification timestamp).
pub const BLOCK_HEADER_LEN: usize = 8;

/// Bytes of the block trailer (CRC32 of header + content).
pub const BLOCK_TRAILER_LEN: usize = 4;

/// Smallest block size a store may be created with.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest block size a store may be created with.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Usable content bytes of a block of the given size.
pub fn content_size(block_size: usize) -> usize {
    block_size - BLOCK_HEADER_LEN - BLOCK_TRAILER_LEN
}

/// Rounds a requested block size to the nearest legal power of two.
pub fn correct_block_size(requested: usize) -> usize {
    let mut size = MIN_BLOCK_SIZE;
    while size < requested && size < MAX_BLOCK_SIZE {
        size <<= 1;
    }
    size
}

/// An owned image of one fixed block.
///
/// Fixing a block copies its bytes out of the cache; unfixing hands them
/// back. A buffer fixed read-only refuses content mutation. A dirty buffer
/// is stamped on unfix, either with a fresh clock value or with the
/// explicit timestamp set by [`BlockBuf::unfix_at`] (the chain walk uses
/// the latter to back-date blocks below a reader's birth).
#[derive(Debug)]
pub struct BlockBuf {
    id: BlockId,
    data: Vec<u8>,
    writable: bool,
    dirty: bool,
    unfix_ts: Option<TimeStamp>,
}

impl BlockBuf {
    pub(crate) fn new(id: BlockId, data: Vec<u8>, writable: bool) -> Self {
        debug_assert!(data.len() >= BLOCK_HEADER_LEN + BLOCK_TRAILER_LEN);
        Self {
            id,
            data,
            writable,
            dirty: false,
            unfix_ts: None,
        }
    }

    /// Block identifier this buffer was fixed under.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Timestamp of the last dirty unfix recorded in the block header.
    pub fn last_modification(&self) -> TimeStamp {
        u64::from_le_bytes(self.data[..BLOCK_HEADER_LEN].try_into().unwrap())
    }

    pub(crate) fn set_last_modification(&mut self, ts: TimeStamp) {
        self.data[..BLOCK_HEADER_LEN].copy_from_slice(&ts.to_le_bytes());
    }

    /// Content bytes (excluding header and trailer).
    pub fn content(&self) -> &[u8] {
        let end = self.data.len() - BLOCK_TRAILER_LEN;
        &self.data[BLOCK_HEADER_LEN..end]
    }

    /// Mutable content bytes. Fails on a read-only fix.
    pub fn content_mut(&mut self) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(UmbraError::InvalidArgument(
                "content_mut on a read-only block fix".into(),
            ));
        }
        let end = self.data.len() - BLOCK_TRAILER_LEN;
        Ok(&mut self.data[BLOCK_HEADER_LEN..end])
    }

    /// Marks the buffer dirty so the next unfix writes it back.
    pub fn dirty(&mut self) {
        debug_assert!(self.writable);
        self.dirty = true;
    }

    /// Whether the buffer has been marked dirty.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the buffer was fixed for update.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Requests that the unfix stamp this exact timestamp instead of a
    /// fresh clock value. Implies dirty.
    pub fn unfix_at(&mut self, ts: TimeStamp) {
        debug_assert!(self.writable);
        self.unfix_ts = Some(ts);
        self.dirty = true;
    }

    pub(crate) fn take_unfix_timestamp(&mut self) -> Option<TimeStamp> {
        self.unfix_ts.take()
    }

    /// Overwrites this buffer with another block's image, keeping our id.
    pub fn copy_from(&mut self, src: &BlockBuf) {
        debug_assert!(self.writable);
        debug_assert_eq!(self.data.len(), src.data.len());
        self.data.copy_from_slice(&src.data);
    }

    /// Zeroes the content and header.
    pub fn reset(&mut self) {
        debug_assert!(self.writable);
        self.data.fill(0);
    }

    pub(crate) fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Reads a little-endian `u32` out of a content slice.
pub(crate) fn get_u32(content: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(content[offset..offset + 4].try_into().unwrap())
}

/// Writes a little-endian `u32` into a content slice.
pub(crate) fn put_u32(content: &mut [u8], offset: usize, value: u32) {
    content[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Reads a little-endian `u64` out of a content slice.
pub(crate) fn get_u64(content: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(content[offset..offset + 8].try_into().unwrap())
}

/// Writes a little-endian `u64` into a content slice.
pub(crate) fn put_u64(content: &mut [u8], offset: usize, value: u64) {
    content[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
