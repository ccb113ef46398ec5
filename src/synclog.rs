//! The sync log file: a single-file write-ahead for the sync engine.
//!
//! Before the sync engine overwrites a master data block it appends the
//! block's prior image here and forces the log to disk. The file exists
//! only while a sync pass runs; finding it on startup means a pass died
//! midway and the before-images must be put back before anything else
//! touches the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::block::{get_u32, put_u32, BlockBuf, BlockId, PageId, TimeStamp};
use crate::buffer::{BlockFile, BlockFileOptions, FixMode, Priority};
use crate::error::Result;
use crate::txn::TimeStampSource;
use crate::vlog::log::LogRecord;

/// File name of the sync log within a store directory.
pub const SYNC_LOG_NAME: &str = "SYNCLOG.SYD";

const HEADER_VERSION: u32 = 0;

/// The sync log file of one store.
pub struct SyncLogFile {
    file: BlockFile,
}

impl SyncLogFile {
    /// Creates a descriptor for the sync log under `parent`.
    pub fn new(parent: &Path, options: &BlockFileOptions, clock: Arc<TimeStampSource>) -> Self {
        Self {
            file: BlockFile::new(parent.join(SYNC_LOG_NAME), options, clock),
        }
    }

    /// Absolute path of the file.
    pub fn path(&self) -> PathBuf {
        self.file.path()
    }

    /// Whether the file exists on disk (a pass is, or was, in flight).
    pub fn is_accessible(&self) -> bool {
        self.file.is_accessible()
    }

    /// Marks the file available.
    pub fn mount(&self) {
        self.file.mount();
    }

    /// Marks the file unavailable.
    pub fn unmount(&self) {
        self.file.unmount();
    }

    /// Renames the file into a new parent directory.
    pub fn move_to(&self, parent: &Path) -> Result<()> {
        self.file.move_to(parent.join(SYNC_LOG_NAME))
    }

    /// Creates an empty log: just the header block.
    pub fn create(&self) -> Result<()> {
        self.file.create()?;
        self.file.truncate_blocks(0)?;
        self.file.ensure_blocks(1)?;
        let mut header = self.file.fix(0, FixMode::Allocate, Priority::Middle)?;
        let content = header.content_mut()?;
        put_u32(content, 0, HEADER_VERSION);
        put_u32(content, 4, 1);
        header.dirty();
        self.file.unfix(header)?;
        self.file.flush()?;
        Ok(())
    }

    /// Unlinks the file.
    pub fn destroy(&self) -> Result<()> {
        self.file.destroy()
    }

    /// Forces appended frames to disk.
    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    /// Number of before-images currently logged.
    pub fn frame_count(&self) -> Result<u32> {
        if !self.file.is_mounted_and_accessible() {
            return Ok(0);
        }
        let header = self.file.fix(0, FixMode::Read, Priority::Middle)?;
        Ok(get_u32(header.content(), 4).saturating_sub(1))
    }

    /// Appends one master block's prior image.
    ///
    /// The frame keeps the image's own last-modification stamp so replay
    /// restores the block byte for byte.
    pub fn append(&self, prior: &BlockBuf) -> Result<()> {
        let mut header = self.file.fix(0, FixMode::Write, Priority::Middle)?;
        let next: BlockId = get_u32(header.content(), 4);
        self.file.ensure_blocks(u64::from(next) + 1)?;
        let mut frame = self.file.fix(next, FixMode::Allocate, Priority::Low)?;
        frame.copy_from(prior);
        frame.unfix_at(prior.last_modification());
        self.file.unfix(frame)?;
        put_u32(header.content_mut()?, 4, next + 1);
        header.dirty();
        self.file.unfix(header)?;
        Ok(())
    }

    /// Feeds every logged frame, oldest first, to `apply` as
    /// `(page id, block content, stamp)`.
    pub fn replay<F>(&self, mut apply: F) -> Result<u32>
    where
        F: FnMut(PageId, &[u8], TimeStamp) -> Result<()>,
    {
        if !self.file.is_mounted_and_accessible() {
            return Ok(0);
        }
        let header = self.file.fix(0, FixMode::Read, Priority::Middle)?;
        let count = get_u32(header.content(), 4);
        let mut applied = 0;
        for id in 1..count {
            let frame = self.file.fix(id, FixMode::Read, Priority::Low)?;
            let rec = LogRecord::decode(frame.content())?;
            apply(rec.page_id, frame.content(), frame.last_modification())?;
            applied += 1;
        }
        Ok(applied)
    }
}
