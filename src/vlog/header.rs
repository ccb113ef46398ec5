//! The version log file header.
//!
//! The header coexists with the root of the page→block conversion tree:
//! block 0's content holds the root node (or root leaf) at its head and
//! the header struct in its tail. Like every metadata block it is stored
//! as a multiplex group of [`crate::block::MULTIPLEX_COUNT`] replicas.

use crate::block::{get_u32, get_u64, put_u32, put_u64, TimeStamp};
use crate::error::{Result, UmbraError};

/// Encoded size of the header struct at the tail of block 0's content.
pub const FILE_HEADER_LEN: usize = 64;

/// On-disk format version of a version log file.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum VersionNumber {
    /// The original format: no newest-version bitmap, chains trimmed
    /// block by block.
    First,
    /// Adds the newest-version bitmap and lazy reclamation.
    Second,
}

impl VersionNumber {
    /// The format used for newly created files.
    pub const CURRENT: VersionNumber = VersionNumber::Second;

    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(VersionNumber::First),
            1 => Ok(VersionNumber::Second),
            other => Err(UmbraError::Corruption(format!(
                "unknown version log format {other}"
            ))),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            VersionNumber::First => 0,
            VersionNumber::Second => 1,
        }
    }
}

/// Tree depth; `None` means the tree is empty.
pub type PbctLevel = Option<u32>;

/// Decoded header fields.
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    /// Format version.
    pub version: VersionNumber,
    /// Total blocks the file has ever bound, including metadata blocks.
    pub block_count: u32,
    /// Total logical pages of the store.
    pub page_count: u32,
    /// Depth of the page→block conversion tree.
    pub pbct_level: PbctLevel,
    /// Timestamp assigned when the file was created.
    pub creation: TimeStamp,
}

impl FileHeader {
    /// Byte offset of the header within a block's content.
    pub fn offset(content_len: usize) -> usize {
        content_len - FILE_HEADER_LEN
    }

    /// Decodes the header from block 0's content.
    pub fn decode(content: &[u8]) -> Result<Self> {
        let base = Self::offset(content.len());
        let raw_level = get_u32(content, base + 12);
        Ok(Self {
            version: VersionNumber::from_raw(get_u32(content, base))?,
            block_count: get_u32(content, base + 4),
            page_count: get_u32(content, base + 8),
            pbct_level: if raw_level == u32::MAX {
                None
            } else {
                Some(raw_level)
            },
            creation: get_u64(content, base + 16),
        })
    }

    /// Encodes the header into block 0's content.
    pub fn encode(&self, content: &mut [u8]) {
        let base = Self::offset(content.len());
        put_u32(content, base, self.version.to_raw());
        put_u32(content, base + 4, self.block_count);
        put_u32(content, base + 8, self.page_count);
        put_u32(
            content,
            base + 12,
            self.pbct_level.map_or(u32::MAX, |l| l),
        );
        put_u64(content, base + 16, self.creation);
    }

    /// Whether the conversion tree has no nodes at all.
    pub fn is_pbct_empty(&self) -> bool {
        self.pbct_level.is_none()
    }
}
