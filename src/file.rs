//! The version file: three on-disk files presented as one array of
//! versioned pages.
//!
//! All public operations live here. Fixing a page resolves the
//! conversion tree, walks the page's version chain for the right image
//! (or falls through to the master data file); a write fix materialises
//! a new version first. Control operations (create, truncate, sync,
//! backup, restore, recover, verify) take the file rwlock exclusively,
//! page fixes share it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::block::{correct_block_size, PageId, TimeStamp, ILLEGAL_BLOCK_ID, ILLEGAL_TIMESTAMP};
use crate::buffer::{BlockFileOptions, BufferCategory, FixMode, Priority};
use crate::error::{Result, UmbraError};
use crate::master::MasterDataFile;
use crate::page::{ImageSource, PageImage, PageTable};
use crate::synclog::SyncLogFile;
use crate::txn::{Category as TxCategory, CheckpointClock, IsolationLevel, TimeStampSource,
    Transaction, TransactionRegistry};
use crate::vlog::header::{FileHeader, VersionNumber};
use crate::vlog::log::{Category, LogRecord};
use crate::vlog::VersionLogFile;

/// Default growth unit, in blocks, for every constituent file.
pub const DEFAULT_EXTENSION_BLOCKS: u64 = 16;

/// Per-file size limits and growth units of a store.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileSizes {
    /// Master data file value.
    pub master: u64,
    /// Version log file value.
    pub version: u64,
    /// Sync log file value.
    pub sync: u64,
}

/// How a version store is laid out and buffered.
#[derive(Clone, Debug)]
pub struct StorageOptions {
    parent: PathBuf,
    page_size: usize,
    read_only: bool,
    category: BufferCategory,
    size_max: FileSizes,
    extension: Option<FileSizes>,
    cache_blocks: usize,
    batch: bool,
}

impl StorageOptions {
    /// Options for a store under `parent` with default sizing.
    pub fn new(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: parent.into(),
            page_size: 4096,
            read_only: false,
            category: BufferCategory::Normal,
            size_max: FileSizes::default(),
            extension: None,
            cache_blocks: crate::buffer::DEFAULT_CACHE_BLOCKS,
            batch: false,
        }
    }

    /// Sets the page (block) size; rounded to a legal power of two.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = correct_block_size(size);
        self
    }

    /// Marks the store read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Chooses the buffer category.
    pub fn category(mut self, category: BufferCategory) -> Self {
        self.category = category;
        self
    }

    /// Sets per-file maximum sizes in bytes (0 = unbounded).
    pub fn size_max(mut self, sizes: FileSizes) -> Self {
        self.size_max = sizes;
        self
    }

    /// Sets per-file extension sizes in bytes.
    pub fn extension_size(mut self, sizes: FileSizes) -> Self {
        self.extension = Some(sizes);
        self
    }

    /// Sets the per-file block cache capacity.
    pub fn cache_blocks(mut self, blocks: usize) -> Self {
        self.cache_blocks = blocks;
        self
    }

    /// Enables batch-insert mode: single writer, no concurrent version
    /// readers, latest versions mutated in place.
    pub fn batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    fn block_options(&self, size_max: u64, extension: u64) -> BlockFileOptions {
        BlockFileOptions {
            block_size: self.page_size,
            size_max,
            extension_size: extension,
            cache_blocks: self.cache_blocks,
            read_only: self.read_only,
        }
    }
}

/// Result of one sync pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOutcome {
    /// Some pages still hold versions the pass could not migrate.
    pub incomplete: bool,
    /// The pass changed on-disk state.
    pub modified: bool,
}

struct BackupState {
    restorable: bool,
}

/// A versioned page store over one directory of files.
pub struct VersionFile {
    rwlock: RwLock<()>,
    vlog: VersionLogFile,
    master: MasterDataFile,
    synclog: SyncLogFile,
    pages: PageTable,
    checkpoints: Arc<CheckpointClock>,
    registry: Arc<TransactionRegistry>,
    parent: Mutex<PathBuf>,
    page_size: usize,
    read_only: bool,
    category: BufferCategory,
    batch: AtomicBool,
    cancel: AtomicBool,
    backup: Mutex<Option<BackupState>>,
}

impl VersionFile {
    /// Builds a descriptor. Touches no disk state; call
    /// [`VersionFile::create`] or [`VersionFile::mount`] next.
    pub fn attach(
        options: StorageOptions,
        clock: Arc<TimeStampSource>,
        checkpoints: Arc<CheckpointClock>,
        registry: Arc<TransactionRegistry>,
    ) -> Arc<Self> {
        let extension = options.extension.unwrap_or(FileSizes {
            master: options.page_size as u64 * DEFAULT_EXTENSION_BLOCKS,
            version: options.page_size as u64 * DEFAULT_EXTENSION_BLOCKS,
            sync: options.page_size as u64 * DEFAULT_EXTENSION_BLOCKS,
        });
        let vlog = VersionLogFile::new(
            &options.parent,
            &options.block_options(options.size_max.version, extension.version),
            clock.clone(),
            checkpoints.clone(),
            registry.clone(),
        );
        let master = MasterDataFile::new(
            &options.parent,
            &options.block_options(options.size_max.master, extension.master),
            clock.clone(),
        );
        let synclog = SyncLogFile::new(
            &options.parent,
            &options.block_options(options.size_max.sync, extension.sync),
            clock.clone(),
        );
        Arc::new(Self {
            rwlock: RwLock::new(()),
            vlog,
            master,
            synclog,
            pages: PageTable::new(),
            checkpoints,
            registry,
            parent: Mutex::new(options.parent.clone()),
            page_size: options.page_size,
            read_only: options.read_only,
            category: options.category,
            batch: AtomicBool::new(options.batch),
            cancel: AtomicBool::new(false),
            backup: Mutex::new(None),
        })
    }

    /// Page (block) size of the store.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Usable payload bytes per page.
    pub fn page_content_size(&self) -> usize {
        self.vlog.page_content_size()
    }

    /// Buffer category the store was attached with.
    pub fn category(&self) -> BufferCategory {
        self.category
    }

    /// Directory holding the store's files.
    pub fn parent(&self) -> PathBuf {
        self.parent.lock().clone()
    }

    /// Whether the store is read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Switches batch-insert mode. In batch mode the per-page modifier
    /// lists are not maintained; the caller asserts a single writer and
    /// no concurrent version readers.
    pub fn set_batch(&self, batch: bool) {
        self.batch.store(batch, Ordering::SeqCst);
    }

    /// Whether batch-insert mode is on.
    pub fn is_batch(&self) -> bool {
        self.batch.load(Ordering::SeqCst)
    }

    /// Requests cooperative cancellation of running sync/verify loops.
    pub fn cancel(&self, on: bool) {
        self.cancel.store(on, Ordering::SeqCst);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn vlog(&self) -> &VersionLogFile {
        &self.vlog
    }

    pub(crate) fn master(&self) -> &MasterDataFile {
        &self.master
    }

    pub(crate) fn rwlock(&self) -> &RwLock<()> {
        &self.rwlock
    }

    /// Whether the constituent files exist on disk (the sync log is
    /// legitimately absent).
    pub fn is_accessible(&self) -> bool {
        self.master.block_file().is_accessible() && self.vlog.block_file().is_accessible()
    }

    /// Whether the store is mounted.
    pub fn is_mounted(&self) -> bool {
        self.vlog.block_file().is_mounted()
    }

    /// Number of logical pages.
    pub fn page_count(&self) -> Result<u32> {
        let _shared = self.rwlock.read();
        Ok(self.vlog.read_header()?.page_count)
    }

    /// Current depth of the page→block conversion tree (`None` when no
    /// page has a version in the log).
    pub fn pbct_level(&self) -> Result<Option<u32>> {
        let _shared = self.rwlock.read();
        Ok(self.vlog.read_header()?.pbct_level)
    }

    /// Total physical size of the constituent files in bytes.
    pub fn size(&self) -> Result<u64> {
        let _shared = self.rwlock.read();
        let mut total = self.master.size()? + self.vlog.size()?;
        if self.synclog.is_accessible() {
            total += self.vlog.block_file().block_size() as u64
                * u64::from(self.synclog.frame_count()? + 1);
        }
        Ok(total)
    }

    /// Bytes of the store occupied by live data.
    pub fn bound_size(&self) -> Result<u64> {
        let _shared = self.rwlock.read();
        Ok(self.master.size()? + self.vlog.bound_size()?)
    }

    // ------------------------------------------------------------------
    // control operations

    /// Initialises the master data and version log files. The sync log
    /// is deferred until a sync pass needs it.
    pub fn create(&self, _trans: &Transaction, page_count: u32) -> Result<()> {
        let _exclusive = self.rwlock.write();
        if self.read_only {
            return Err(UmbraError::InvalidArgument(
                "create on a read-only store".into(),
            ));
        }
        self.master.create()?;
        self.vlog.create(page_count)?;
        info!(parent = %self.parent().display(), page_count, "store created");
        Ok(())
    }

    /// Unlinks every constituent file.
    pub fn destroy(&self, _trans: &Transaction) -> Result<()> {
        let _exclusive = self.rwlock.write();
        self.master.destroy()?;
        self.vlog.destroy()?;
        self.synclog.destroy()?;
        self.pages.clear();
        Ok(())
    }

    /// Makes the store available. Mounting missing files succeeds (the
    /// caller may then create). A sync log left behind by a crash is
    /// replayed before reads are admitted.
    pub fn mount(&self, _trans: &Transaction) -> Result<()> {
        let _exclusive = self.rwlock.write();
        self.master.mount();
        self.vlog.mount();
        self.synclog.mount();
        self.recover_pending_sync()?;
        Ok(())
    }

    /// Makes the store unavailable, flushing dirty state first.
    pub fn unmount(&self, _trans: &Transaction) -> Result<()> {
        let _exclusive = self.rwlock.write();
        self.flush_files()?;
        self.master.unmount();
        self.vlog.unmount();
        self.synclog.unmount();
        self.pages.clear();
        Ok(())
    }

    /// Frees every version of pages at or past `page_id` and trims the
    /// files.
    pub fn truncate(&self, _trans: &Transaction, page_id: PageId) -> Result<()> {
        let _exclusive = self.rwlock.write();
        let _structural = self.vlog.structural().lock();
        self.vlog.truncate_from(page_id)?;
        self.master.truncate_to(page_id)?;
        self.pages.discard_from(page_id);
        Ok(())
    }

    /// Renames every constituent file into `new_parent`.
    pub fn move_to(&self, _trans: &Transaction, new_parent: &Path) -> Result<()> {
        let _exclusive = self.rwlock.write();
        self.master.move_to(new_parent)?;
        self.vlog.move_to(new_parent)?;
        self.synclog.move_to(new_parent)?;
        *self.parent.lock() = new_parent.to_path_buf();
        Ok(())
    }

    /// Writes all dirty state to disk.
    pub fn flush(&self, _trans: &Transaction) -> Result<()> {
        let _shared = self.rwlock.read();
        self.flush_files()
    }

    fn flush_files(&self) -> Result<()> {
        self.vlog.block_file().flush()?;
        self.master.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // backup

    /// Starts an online backup: flushing of the version log and master
    /// data is inhibited so the on-disk image stays copyable.
    ///
    /// Under a serialisable version-managed transaction with
    /// `restorable` set, every page is first brought to a state where
    /// the image each live reader needs is reachable through the chain
    /// alone.
    pub fn start_backup(&self, trans: &Transaction, restorable: bool) -> Result<()> {
        let _exclusive = self.rwlock.write();
        let mut backup = self.backup.lock();
        if backup.is_some() {
            return Err(UmbraError::InvalidArgument(
                "backup already in progress".into(),
            ));
        }

        if restorable
            && !trans.is_no_version()
            && trans.isolation() == IsolationLevel::Serializable
        {
            let _structural = self.vlog.structural().lock();
            let mut header_multi = self.vlog.fix_header_multi(FixMode::Write)?;
            let page_count = FileHeader::decode(header_multi.master().content())?.page_count;
            for page_id in 0..page_count {
                let entry = {
                    let header = header_multi.master();
                    match self.vlog.traverse_leaf(header, page_id, FixMode::Read)? {
                        Some(leaf) => {
                            let entry = self.vlog.leaf_entry(&leaf, header, page_id);
                            self.vlog.unfix_leaf(leaf)?;
                            entry.0
                        }
                        None => ILLEGAL_BLOCK_ID,
                    }
                };
                if entry == ILLEGAL_BLOCK_ID {
                    continue;
                }
                let page = self.pages.attach(page_id);
                let src = self.vlog.fix_log(entry, FixMode::Write, Priority::Low)?;
                if let Some((latest, ts)) =
                    self.vlog
                        .allocate_log_for_backup(trans, &mut header_multi, &page, src)?
                {
                    let mut leaf = self.vlog.allocate_leaf_path(&mut header_multi, page_id)?;
                    let master = header_multi.master_mut();
                    self.vlog.set_leaf_entry(&mut leaf, master, page_id, latest, ts)?;
                    self.vlog.unfix_leaf(leaf)?;
                }
            }
            self.vlog.unfix_multi(header_multi)?;
        }

        self.flush_files()?;
        self.vlog.block_file().set_flush_inhibited(true);
        self.master.block_file().set_flush_inhibited(true);
        *backup = Some(BackupState { restorable });
        info!(restorable, "backup started");
        Ok(())
    }

    /// Ends an online backup and re-enables flushing.
    pub fn end_backup(&self, _trans: &Transaction) -> Result<()> {
        let _exclusive = self.rwlock.write();
        let mut backup = self.backup.lock();
        if backup.take().is_none() {
            return Err(UmbraError::InvalidArgument("no backup in progress".into()));
        }
        self.vlog.block_file().set_flush_inhibited(false);
        self.master.block_file().set_flush_inhibited(false);
        self.flush_files()?;
        info!("backup ended");
        Ok(())
    }

    // ------------------------------------------------------------------
    // restore / recover

    /// Makes the version a transaction born at `point` would have seen
    /// the new latest of every page.
    pub fn restore(&self, _trans: &Transaction, point: TimeStamp) -> Result<()> {
        let _exclusive = self.rwlock.write();
        if self.backup.lock().is_some() {
            return Err(UmbraError::InvalidArgument(
                "restore during an in-flight backup; end it first".into(),
            ));
        }
        let _structural = self.vlog.structural().lock();
        if !self.vlog.restore(point)? {
            warn!(point, "store postdates the restore point");
        }
        self.pages.clear();
        self.flush_files()
    }

    /// Rolls the store back to the checkpoint-consistent state at or
    /// before `point`.
    pub fn recover(&self, _trans: &Transaction, point: TimeStamp) -> Result<()> {
        let _exclusive = self.rwlock.write();
        let _structural = self.vlog.structural().lock();
        self.recover_pending_sync()?;
        match self.vlog.recover(point)? {
            Some(page_count) => {
                self.master.truncate_to(page_count)?;
                self.pages.clear();
                self.flush_files()
            }
            None => {
                // The store did not exist at the recovery point.
                warn!(point, "store predates the recovery point; removing files");
                self.master.destroy()?;
                self.vlog.destroy()?;
                self.synclog.destroy()?;
                self.pages.clear();
                Ok(())
            }
        }
    }

    fn recover_pending_sync(&self) -> Result<()> {
        if self.synclog.is_accessible() {
            self.master.replay_sync_log(&self.synclog)?;
            self.synclog.destroy()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // sync engine

    /// Runs one pass of the sync engine: migrates every eligible page's
    /// newest version into the master data file and trims the version
    /// log.
    pub fn sync(&self, trans: &Transaction) -> Result<SyncOutcome> {
        {
            let _exclusive = self.rwlock.write();
            self.recover_pending_sync()?;
        }

        let mut outcome = SyncOutcome::default();
        let eldest = self
            .checkpoints
            .second_most_recent()
            .min(self.registry.earliest_version_reader_birth());
        if eldest == 0 {
            // Without two completed checkpoints nothing can migrate.
            return Ok(outcome);
        }

        let page_count = {
            let _shared = self.rwlock.read();
            if !self.is_accessible() {
                return Ok(outcome);
            }
            self.vlog.read_header()?.page_count
        };

        {
            let _shared = self.rwlock.read();
            let _structural = self.vlog.structural().lock();
            self.synclog.create()?;

            for page_id in 0..page_count {
                if self.cancel_requested() {
                    self.master.flush()?;
                    self.synclog.destroy()?;
                    return Err(UmbraError::Cancelled);
                }
                let mut header = self.vlog.fix_header(FixMode::Write)?;
                let version = FileHeader::decode(header.content())?.version;
                let Some(mut leaf) = self.vlog.traverse_leaf(&header, page_id, FixMode::Write)?
                else {
                    drop(header);
                    continue;
                };
                let (latest, leaf_ts) = self.vlog.leaf_entry(&leaf, &header, page_id);
                if latest == ILLEGAL_BLOCK_ID {
                    self.vlog.unfix_leaf(leaf)?;
                    drop(header);
                    continue;
                }
                let oldest = if version >= VersionNumber::Second {
                    ILLEGAL_TIMESTAMP
                } else {
                    leaf_ts
                };
                let page = self.pages.attach(page_id);
                let result = self.vlog.sync_log(
                    trans,
                    &header,
                    &page,
                    latest,
                    oldest,
                    eldest,
                    &self.master,
                    &self.synclog,
                )?;
                if result == ILLEGAL_TIMESTAMP {
                    self.vlog.set_leaf_entry(
                        &mut leaf,
                        &mut header,
                        page_id,
                        ILLEGAL_BLOCK_ID,
                        ILLEGAL_TIMESTAMP,
                    )?;
                    let emptied = self.vlog.leaf_count(&leaf, &header) == 0;
                    self.vlog.unfix_leaf(leaf)?;
                    if emptied {
                        self.vlog.free_leaf_path(&mut header, page_id)?;
                    }
                    outcome.modified = true;
                } else {
                    if result != oldest {
                        self.vlog
                            .set_leaf_entry(&mut leaf, &mut header, page_id, latest, result)?;
                        outcome.modified = true;
                    }
                    outcome.incomplete = true;
                    self.vlog.unfix_leaf(leaf)?;
                }
                self.vlog.unfix(header)?;
            }
        }

        {
            let _exclusive = self.rwlock.write();
            let _structural = self.vlog.structural().lock();
            let remaining = self.vlog.truncate_all()?;
            outcome.incomplete |= remaining;
            self.master.flush()?;
            self.synclog.destroy()?;
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // page fixes

    /// Fixes a page with default (low) buffer priority.
    pub fn fix_page(
        &self,
        trans: &Transaction,
        page_id: PageId,
        mode: FixMode,
    ) -> Result<PageImage> {
        self.fix_page_with(trans, page_id, mode, Priority::Low)
    }

    /// Fixes a page: returns the image the transaction should see
    /// (read), or the version block it should write into (write).
    pub fn fix_page_with(
        &self,
        trans: &Transaction,
        page_id: PageId,
        mode: FixMode,
        priority: Priority,
    ) -> Result<PageImage> {
        let _shared = self.rwlock.read();
        match mode {
            FixMode::Read => self.fix_page_read(trans, page_id, priority),
            FixMode::Write | FixMode::Allocate => {
                self.fix_page_write(trans, page_id, mode, priority)
            }
        }
    }

    fn fix_page_read(
        &self,
        trans: &Transaction,
        page_id: PageId,
        priority: Priority,
    ) -> Result<PageImage> {
        let header = self.vlog.fix_header(FixMode::Read)?;
        let h = FileHeader::decode(header.content())?;
        if page_id >= h.page_count {
            return Err(UmbraError::InvalidArgument(format!(
                "page {page_id} outside the store's {} pages",
                h.page_count
            )));
        }
        let page = self.pages.attach(page_id);
        let (latest, leaf_ts) = match self.vlog.traverse_leaf(&header, page_id, FixMode::Read)? {
            Some(leaf) => {
                let entry = self.vlog.leaf_entry(&leaf, &header, page_id);
                self.vlog.unfix_leaf(leaf)?;
                entry
            }
            None => (ILLEGAL_BLOCK_ID, ILLEGAL_TIMESTAMP),
        };
        let oldest = if h.version >= VersionNumber::Second {
            ILLEGAL_TIMESTAMP
        } else {
            leaf_ts
        };
        drop(header);

        if latest != ILLEGAL_BLOCK_ID {
            if let Some(buf) = self
                .vlog
                .traverse_log(trans, &page, latest, oldest, priority)?
            {
                return Ok(PageImage::new(page, buf, ImageSource::VersionLog, false));
            }
        }
        let buf = self.master.fix_page(page_id, FixMode::Read)?;
        Ok(PageImage::new(page, buf, ImageSource::Master, false))
    }

    fn fix_page_write(
        &self,
        trans: &Transaction,
        page_id: PageId,
        mode: FixMode,
        priority: Priority,
    ) -> Result<PageImage> {
        if self.read_only {
            return Err(UmbraError::InvalidArgument(
                "write fix on a read-only store".into(),
            ));
        }
        if trans.category() != TxCategory::ReadWrite {
            return Err(UmbraError::InvalidArgument(
                "write fix under a read-only transaction".into(),
            ));
        }

        let _structural = self.vlog.structural().lock();
        let mut header_multi = self.vlog.fix_header_multi(FixMode::Write)?;

        {
            let master = header_multi.master_mut();
            let mut h = FileHeader::decode(master.content())?;
            if page_id >= h.page_count {
                h.page_count = page_id + 1;
                h.encode(master.content_mut()?);
                master.dirty();
            }
        }

        let page = self.pages.attach(page_id);
        let (latest, leaf_ts, version) = {
            let header = header_multi.master();
            let h = FileHeader::decode(header.content())?;
            let entry = match self.vlog.traverse_leaf(header, page_id, FixMode::Read)? {
                Some(leaf) => {
                    let entry = self.vlog.leaf_entry(&leaf, header, page_id);
                    self.vlog.unfix_leaf(leaf)?;
                    entry
                }
                None => (ILLEGAL_BLOCK_ID, ILLEGAL_TIMESTAMP),
            };
            (entry.0, entry.1, h.version)
        };

        let src = if latest != ILLEGAL_BLOCK_ID {
            self.vlog.fix_log(latest, FixMode::Write, priority)?
        } else {
            self.master.fix_page(page_id, FixMode::Write)?
        };
        let oldest = if version >= VersionNumber::Second {
            ILLEGAL_TIMESTAMP
        } else {
            leaf_ts
        };

        let allocated = self.vlog.allocate_log(
            trans,
            &mut header_multi,
            &page,
            src,
            oldest,
            priority,
            self.is_batch(),
        )?;

        if allocated.id() != latest {
            let mut leaf = self.vlog.allocate_leaf_path(&mut header_multi, page_id)?;
            let master = header_multi.master_mut();
            self.vlog.set_leaf_entry(
                &mut leaf,
                master,
                page_id,
                allocated.id(),
                allocated.last_modification(),
            )?;
            self.vlog.unfix_leaf(leaf)?;
        }
        self.vlog.unfix_multi(header_multi)?;
        Ok(PageImage::new(page, allocated, ImageSource::VersionLog, true))
    }

    /// Unfixes a page image. For a write fix, `dirty` records whether
    /// the caller actually modified the payload; the block is stamped
    /// and the page's leaf timestamp refreshed either way (the version
    /// block itself was materialised by the fix).
    pub fn unfix_page(&self, image: PageImage, dirty: bool) -> Result<()> {
        let _shared = self.rwlock.read();
        let (page, mut buf, source, writable) = image.into_parts();
        if source == ImageSource::Master || !writable {
            return Ok(());
        }
        let _structural = self.vlog.structural().lock();
        let buf_id = buf.id();

        if dirty {
            let mut rec = LogRecord::decode(buf.content())?;
            if rec.category == Category::Copy {
                // No longer a plain copy of an older version.
                rec.category = Category::Newer;
                rec.encode(buf.content_mut()?);
            }
            buf.dirty();
        }
        let Some(ts) = self.vlog.unfix(buf)? else {
            return Ok(());
        };

        // The leaf records the newest version's stamp; keep it current.
        let mut header = self.vlog.fix_header(FixMode::Write)?;
        let version = FileHeader::decode(header.content())?.version;
        if version >= VersionNumber::Second {
            if let Some(mut leaf) = self
                .vlog
                .traverse_leaf(&header, page.id(), FixMode::Write)?
            {
                let (latest, _) = self.vlog.leaf_entry(&leaf, &header, page.id());
                if latest == buf_id {
                    self.vlog
                        .set_leaf_entry(&mut leaf, &mut header, page.id(), latest, ts)?;
                }
                self.vlog.unfix_leaf(leaf)?;
            }
        }
        self.vlog.unfix(header)?;
        Ok(())
    }

    /// Reads a page image into the buffer cache ahead of use.
    pub fn fetch(&self, trans: &Transaction, page_id: PageId) -> Result<()> {
        let _ = self.fix_page(trans, page_id, FixMode::Read)?;
        Ok(())
    }
}
