//! The master data file: a flat array of blocks, one per page, holding
//! the oldest durable image of each page.
//!
//! Pages that have never been promoted simply have no master block yet;
//! readers falling through the version chain get a zeroed image. The
//! sync engine overwrites master blocks only after logging the prior
//! image into the sync log, so a crash mid-overwrite is always
//! repairable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::block::{BlockBuf, PageId, ILLEGAL_BLOCK_ID, ILLEGAL_TIMESTAMP};
use crate::buffer::{BlockFile, BlockFileOptions, FixMode, Priority};
use crate::error::Result;
use crate::synclog::SyncLogFile;
use crate::txn::TimeStampSource;
use crate::vlog::log::{Category, LogRecord};

/// File name of the master data file within a store directory.
pub const MASTER_DATA_NAME: &str = "MASTER.SYD";

/// The master data file of one store.
pub struct MasterDataFile {
    file: BlockFile,
}

impl MasterDataFile {
    /// Creates a descriptor for the master data file under `parent`.
    pub fn new(parent: &Path, options: &BlockFileOptions, clock: Arc<TimeStampSource>) -> Self {
        Self {
            file: BlockFile::new(parent.join(MASTER_DATA_NAME), options, clock),
        }
    }

    /// The underlying block file.
    pub fn block_file(&self) -> &BlockFile {
        &self.file
    }

    /// Absolute path of the file.
    pub fn path(&self) -> PathBuf {
        self.file.path()
    }

    /// Creates the file (empty; blocks appear as pages are promoted).
    pub fn create(&self) -> Result<()> {
        self.file.create()
    }

    /// Unlinks the file.
    pub fn destroy(&self) -> Result<()> {
        self.file.destroy()
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
        self.file.move_to(parent.join(MASTER_DATA_NAME))
    }

    /// Writes dirty blocks out.
    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    /// Number of blocks the file physically holds.
    pub fn block_count(&self) -> Result<u64> {
        self.file.block_count()
    }

    /// Physical size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.file.size()
    }

    /// Fixes the master image of a page.
    ///
    /// A page never promoted yields a synthesized empty image stamped
    /// zero, which every transaction may see.
    pub fn fix_page(&self, page_id: PageId, mode: FixMode) -> Result<BlockBuf> {
        let writable = mode == FixMode::Write;
        if self.file.is_mounted_and_accessible() {
            if let Some(buf) = self.file.fix_existing(page_id, mode, Priority::Low)? {
                let rec = LogRecord::decode(buf.content())?;
                if rec.category == Category::Oldest {
                    return Ok(buf);
                }
            }
        }
        let mut buf = BlockBuf::new(page_id, vec![0u8; self.file.block_size()], true);
        let rec = LogRecord {
            older: ILLEGAL_BLOCK_ID,
            physical_log: ILLEGAL_BLOCK_ID,
            older_timestamp: ILLEGAL_TIMESTAMP,
            category: Category::Oldest,
            page_id,
        };
        rec.encode(buf.content_mut()?);
        if !writable {
            let data = buf.into_data();
            return Ok(BlockBuf::new(page_id, data, false));
        }
        Ok(buf)
    }

    /// Promotes a version block's image into master.
    ///
    /// The prior master image (if any) is appended to the sync log and
    /// the log is forced to disk before the overwrite is queued, so the
    /// old image can always be put back after a crash.
    pub fn sync_data(&self, page_id: PageId, src: &BlockBuf, synclog: &SyncLogFile) -> Result<()> {
        if let Some(prior) = self
            .file
            .fix_existing(page_id, FixMode::Read, Priority::Low)?
        {
            synclog.append(&prior)?;
            synclog.flush()?;
        }
        let mut dst = self.file.fix(page_id, FixMode::Allocate, Priority::Low)?;
        dst.copy_from(src);
        let mut rec = LogRecord::decode(dst.content())?;
        rec.older = ILLEGAL_BLOCK_ID;
        rec.physical_log = ILLEGAL_BLOCK_ID;
        rec.older_timestamp = ILLEGAL_TIMESTAMP;
        rec.category = Category::Oldest;
        rec.page_id = page_id;
        rec.encode(dst.content_mut()?);
        dst.unfix_at(src.last_modification());
        self.file.unfix(dst)?;
        Ok(())
    }

    /// Shrinks the file to `page_count` blocks.
    pub fn truncate_to(&self, page_count: PageId) -> Result<()> {
        if !self.file.is_mounted_and_accessible() {
            return Ok(());
        }
        let current = self.file.block_count()?;
        if u64::from(page_count) < current {
            self.file.truncate_blocks(u64::from(page_count))?;
        }
        Ok(())
    }

    /// Replays every before-image in the sync log over this file,
    /// undoing a sync pass that did not finish.
    pub fn replay_sync_log(&self, synclog: &SyncLogFile) -> Result<()> {
        let frames = synclog.frame_count()?;
        if frames > 0 {
            warn!(frames, "replaying sync log over master data");
        }
        synclog.replay(|page_id, image, ts| {
            let mut dst = self.file.fix(page_id, FixMode::Allocate, Priority::Low)?;
            dst.content_mut()?.copy_from_slice(image);
            dst.unfix_at(ts);
            self.file.unfix(dst)?;
            Ok(())
        })?;
        self.file.flush()?;
        Ok(())
    }
}
