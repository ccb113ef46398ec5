//! Version blocks.
//!
//! Each version of a page is stored in one block whose content starts
//! with a fixed record linking it to the previous version, followed by
//! the page image. Master data blocks reuse the same record with the
//! `Oldest` category, so one layout serves all three files.

use crate::block::{
    get_u32, get_u64, put_u32, put_u64, BlockId, PageId, TimeStamp, ILLEGAL_BLOCK_ID,
    MULTIPLEX_COUNT,
};
use crate::error::{Result, UmbraError};

/// Bytes of the version record at the head of a block's content.
pub const LOG_HEADER_LEN: usize = 24;

/// Position of a version within its page's chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    /// Freshly allocated, not yet classified.
    Unknown,
    /// The oldest image, stored in the master data file.
    Oldest,
    /// A plain copy of an older version, created this epoch.
    Copy,
    /// A newer version in the version log file.
    Newer,
}

impl Category {
    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Category::Unknown),
            1 => Ok(Category::Oldest),
            2 => Ok(Category::Copy),
            3 => Ok(Category::Newer),
            other => Err(UmbraError::Corruption(format!(
                "unknown version block category {other}"
            ))),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            Category::Unknown => 0,
            Category::Oldest => 1,
            Category::Copy => 2,
            Category::Newer => 3,
        }
    }
}

/// Decoded version record.
#[derive(Clone, Copy, Debug)]
pub struct LogRecord {
    /// Block of the previous version, or [`ILLEGAL_BLOCK_ID`].
    pub older: BlockId,
    /// Head of this version's physical-log chain, or [`ILLEGAL_BLOCK_ID`].
    pub physical_log: BlockId,
    /// Last-modification stamp the `older` block carried when the link
    /// was formed; a mismatch on the walk means the chain is broken.
    pub older_timestamp: TimeStamp,
    /// Chain position.
    pub category: Category,
    /// Page this block belongs to, for verification.
    pub page_id: PageId,
}

impl LogRecord {
    /// A record for a block with no neighbours.
    pub fn unlinked() -> Self {
        Self {
            older: ILLEGAL_BLOCK_ID,
            physical_log: ILLEGAL_BLOCK_ID,
            older_timestamp: crate::block::ILLEGAL_TIMESTAMP,
            category: Category::Unknown,
            page_id: 0,
        }
    }

    /// Decodes the record from a block's content.
    pub fn decode(content: &[u8]) -> Result<Self> {
        Ok(Self {
            older: get_u32(content, 0),
            physical_log: get_u32(content, 4),
            older_timestamp: get_u64(content, 8),
            category: Category::from_raw(get_u32(content, 16))?,
            page_id: get_u32(content, 20),
        })
    }

    /// Encodes the record into a block's content.
    pub fn encode(&self, content: &mut [u8]) {
        put_u32(content, 0, self.older);
        put_u32(content, 4, self.physical_log);
        put_u64(content, 8, self.older_timestamp);
        put_u32(content, 16, self.category.to_raw());
        put_u32(content, 20, self.page_id);
    }

    /// Whether this block's stored page id is acceptable for `page`.
    ///
    /// Old blocks may carry a page id of zero for any page, so zero only
    /// counts as a mismatch when resolving page zero itself.
    pub fn preserves(&self, page: PageId) -> bool {
        self.page_id == page || (self.page_id == 0 && page != 0)
    }
}

/// Whether `id` can possibly be a version block: the multiplexed file
/// header and the first allocation table can never hold versions.
pub fn is_illegal_log_id(id: BlockId) -> bool {
    id == ILLEGAL_BLOCK_ID || id < (MULTIPLEX_COUNT * 2) as BlockId
}

/// Page-image bytes of a version block's content.
pub fn image(content: &[u8]) -> &[u8] {
    &content[LOG_HEADER_LEN..]
}

/// Mutable page-image bytes of a version block's content.
pub fn image_mut(content: &mut [u8]) -> &mut [u8] {
    &mut content[LOG_HEADER_LEN..]
}
