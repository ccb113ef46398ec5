//! Page records and page images.
//!
//! A [`PageRecord`] is the in-memory identity of a logical page: its
//! latch and the list of read-write transactions that produced the
//! current latest version. Records are created on first fix and shared
//! through the page table. A [`PageImage`] is what a fix hands back:
//! an owned view of the version (or master) block the caller should see.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::block::{BlockBuf, PageId, TimeStamp};
use crate::error::{Result, UmbraError};
use crate::txn::TxId;
use crate::vlog::log;

/// The per-page modifier list: read-write transactions that updated the
/// current latest version, in start order.
pub type ModifierList = SmallVec<[TxId; 4]>;

/// In-memory descriptor of one logical page.
#[derive(Debug)]
pub struct PageRecord {
    id: PageId,
    latch: Mutex<ModifierList>,
}

impl PageRecord {
    fn new(id: PageId) -> Self {
        Self {
            id,
            latch: Mutex::new(ModifierList::new()),
        }
    }

    /// Page identifier.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// The latch guarding the modifier list.
    pub(crate) fn latch(&self) -> &Mutex<ModifierList> {
        &self.latch
    }

    /// Copy of the current modifier list.
    pub fn modifiers(&self) -> ModifierList {
        self.latch.lock().clone()
    }
}

/// Table of live page records, keyed by page id.
#[derive(Debug, Default)]
pub struct PageTable {
    map: Mutex<FxHashMap<PageId, Arc<PageRecord>>>,
}

impl PageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for a page, creating it on first use.
    pub fn attach(&self, id: PageId) -> Arc<PageRecord> {
        let mut map = self.map.lock();
        Arc::clone(
            map.entry(id)
                .or_insert_with(|| Arc::new(PageRecord::new(id))),
        )
    }

    /// Drops every record (unmount, destroy, recover).
    pub fn clear(&self) {
        self.map.lock().clear();
    }

    /// Drops records for pages at or past `from` (truncate).
    pub fn discard_from(&self, from: PageId) {
        self.map.lock().retain(|id, _| *id < from);
    }
}

/// Where a fixed page image came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageSource {
    /// A version block in the version log file.
    VersionLog,
    /// The page's master data image.
    Master,
}

/// A fixed page image.
///
/// Obtained from `VersionFile::fix_page` and given back through
/// `VersionFile::unfix_page`; dropping it without unfixing discards any
/// modification.
#[derive(Debug)]
pub struct PageImage {
    page: Arc<PageRecord>,
    buf: BlockBuf,
    source: ImageSource,
    writable: bool,
}

impl PageImage {
    pub(crate) fn new(
        page: Arc<PageRecord>,
        buf: BlockBuf,
        source: ImageSource,
        writable: bool,
    ) -> Self {
        Self {
            page,
            buf,
            source,
            writable,
        }
    }

    /// Page this image belongs to.
    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    /// Where the image came from.
    pub fn source(&self) -> ImageSource {
        self.source
    }

    /// Whether the image may be modified.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Timestamp of the version this image shows.
    pub fn last_modification(&self) -> TimeStamp {
        self.buf.last_modification()
    }

    /// The page payload.
    pub fn content(&self) -> &[u8] {
        log::image(self.buf.content())
    }

    /// The page payload, mutably. Fails on a read fix.
    pub fn content_mut(&mut self) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(UmbraError::InvalidArgument(
                "write to a page fixed read-only".into(),
            ));
        }
        Ok(log::image_mut(self.buf.content_mut()?))
    }

    pub(crate) fn into_parts(self) -> (Arc<PageRecord>, BlockBuf, ImageSource, bool) {
        (self.page, self.buf, self.source, self.writable)
    }
}
