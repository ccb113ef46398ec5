//! The version log file: the hot, mutable file of a version store.
//!
//! Holds the multiplexed file header (which doubles as the root of the
//! page→block conversion tree), the allocation tables, the rest of the
//! tree, and every version block newer than the master data image.

pub mod alloc;
pub mod header;
pub mod log;
pub mod multiplex;
pub mod pbct;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::block::{
    content_size, BlockBuf, BlockId, PageId, TimeStamp, ILLEGAL_BLOCK_ID, ILLEGAL_TIMESTAMP,
    MULTIPLEX_COUNT,
};
use crate::buffer::{BlockFile, BlockFileOptions, FixMode, Priority};
use crate::error::{Result, UmbraError};
use crate::master::MasterDataFile;
use crate::page::PageRecord;
use crate::synclog::SyncLogFile;
use crate::txn::{CheckpointClock, TimeStampSource, Transaction, TransactionRegistry};
use crate::vlog::alloc::AllocGeom;
use crate::vlog::header::{FileHeader, VersionNumber};
use crate::vlog::log::{Category, LogRecord, LOG_HEADER_LEN};
use crate::vlog::multiplex::{MultiplexBlock, MultiplexTable};
use crate::vlog::pbct::PbctGeom;

/// File name of the version log within a store directory.
pub const VERSION_LOG_NAME: &str = "VERSION.SYD";

const N: u32 = MULTIPLEX_COUNT as u32;

/// A leaf of the conversion tree as reached by a traversal: either the
/// root leaf living inside the header block, or an owned leaf block.
pub enum LeafRef {
    /// The leaf occupies the head of the header block's content.
    Root,
    /// A distinct leaf block.
    Owned(BlockBuf),
}

/// The version log file of one store.
pub struct VersionLogFile {
    file: BlockFile,
    multiplex: MultiplexTable,
    structural: Mutex<()>,
    clock: Arc<TimeStampSource>,
    checkpoints: Arc<CheckpointClock>,
    registry: Arc<TransactionRegistry>,
}

impl VersionLogFile {
    /// Creates a descriptor for the version log under `parent`.
    pub fn new(
        parent: &Path,
        options: &BlockFileOptions,
        clock: Arc<TimeStampSource>,
        checkpoints: Arc<CheckpointClock>,
        registry: Arc<TransactionRegistry>,
    ) -> Self {
        Self {
            file: BlockFile::new(parent.join(VERSION_LOG_NAME), options, clock.clone()),
            multiplex: MultiplexTable::new(),
            structural: Mutex::new(()),
            clock,
            checkpoints,
            registry,
        }
    }

    /// The underlying block file.
    pub fn block_file(&self) -> &BlockFile {
        &self.file
    }

    /// Serialises structural mutation (allocation, tree growth, header
    /// updates) across writers; the facade holds it for every write fix.
    pub(crate) fn structural(&self) -> &Mutex<()> {
        &self.structural
    }

    /// Absolute path of the file.
    pub fn path(&self) -> PathBuf {
        self.file.path()
    }

    fn content_len(&self) -> usize {
        content_size(self.file.block_size())
    }

    fn pbct_geom(&self) -> PbctGeom {
        PbctGeom::new(self.content_len())
    }

    /// Usable page-image bytes per version block.
    pub fn page_content_size(&self) -> usize {
        self.content_len() - LOG_HEADER_LEN
    }

    // ------------------------------------------------------------------
    // lifecycle

    /// Initialises the file: the multiplexed header with an empty tree.
    pub fn create(&self, page_count: u32) -> Result<()> {
        if self.file.is_mounted_and_accessible() && self.file.block_count()? >= u64::from(N) {
            return Ok(());
        }
        self.file.create()?;
        self.file.ensure_blocks(u64::from(N))?;
        let mut master = self.fix_header_mode(FixMode::Allocate)?;
        let header = FileHeader {
            version: VersionNumber::CURRENT,
            block_count: N,
            page_count,
            pbct_level: None,
            creation: self.clock.next(),
        };
        header.encode(master.content_mut()?);
        master.dirty();
        self.file.unfix(master)?;
        self.file.flush()?;
        Ok(())
    }

    /// Unlinks the file and forgets all selection state.
    pub fn destroy(&self) -> Result<()> {
        self.file.destroy()?;
        self.multiplex.clear_from(0);
        Ok(())
    }

    /// Marks the file available.
    pub fn mount(&self) {
        self.file.mount();
    }

    /// Marks the file unavailable.
    pub fn unmount(&self) {
        self.file.unmount();
        self.multiplex.clear_from(0);
    }

    /// Renames the file into a new parent directory.
    pub fn move_to(&self, parent: &Path) -> Result<()> {
        self.file.move_to(parent.join(VERSION_LOG_NAME))
    }

    // ------------------------------------------------------------------
    // header

    fn fix_header_mode(&self, mode: FixMode) -> Result<BlockBuf> {
        multiplex::fix_master(
            &self.file,
            &self.multiplex,
            &self.checkpoints,
            0,
            mode,
            Priority::High,
            None,
        )
    }

    /// Fixes the master replica of the file header.
    pub fn fix_header(&self, mode: FixMode) -> Result<BlockBuf> {
        self.fix_header_mode(mode)
    }

    /// Fixes the header with every replica still needed for recovery.
    pub fn fix_header_multi(&self, mode: FixMode) -> Result<MultiplexBlock> {
        multiplex::fix_master_and_slaves(
            &self.file,
            &self.multiplex,
            &self.checkpoints,
            0,
            mode,
            Priority::High,
            None,
        )
    }

    /// Reads the decoded header.
    pub fn read_header(&self) -> Result<FileHeader> {
        let buf = self.fix_header(FixMode::Read)?;
        FileHeader::decode(buf.content())
    }

    /// Unfixes every replica of a multiplex group.
    pub fn unfix_multi(&self, multi: MultiplexBlock) -> Result<()> {
        for memory in multi.memories {
            if let Some(buf) = memory {
                self.file.unfix(buf)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // allocation

    fn fix_alloc_table_multi(&self, table: BlockId, mode: FixMode) -> Result<MultiplexBlock> {
        // The freed-blocks-applied flag only describes the epoch the
        // replica was written in, so the first write of a new epoch
        // clears it.
        let clear_flag = |buf: &mut BlockBuf| {
            if let Ok(content) = buf.content_mut() {
                alloc::set_apply_free(content, false);
            }
        };
        multiplex::fix_master_and_slaves(
            &self.file,
            &self.multiplex,
            &self.checkpoints,
            table,
            mode,
            Priority::High,
            Some(&clear_flag),
        )
    }

    fn fix_alloc_table(&self, table: BlockId, mode: FixMode) -> Result<BlockBuf> {
        let clear_flag = |buf: &mut BlockBuf| {
            if let Ok(content) = buf.content_mut() {
                alloc::set_apply_free(content, false);
            }
        };
        multiplex::fix_master(
            &self.file,
            &self.multiplex,
            &self.checkpoints,
            table,
            mode,
            Priority::High,
            Some(&clear_flag),
        )
    }

    fn extend_to(&self, block: BlockId) -> Result<()> {
        self.file.ensure_blocks(u64::from(block))
    }

    fn header_version(&self, header_multi: &MultiplexBlock) -> Result<VersionNumber> {
        FileHeader::decode(header_multi.master().content()).map(|h| h.version)
    }

    /// Binds `n` consecutive blocks, extending the file as needed, and
    /// returns the first id (always divisible by `n`).
    pub fn allocate(&self, header_multi: &mut MultiplexBlock, n: u32) -> Result<BlockId> {
        debug_assert!(n > 0);

        // Blocks recoverable from an older replica must not be handed
        // out again, so the bound state is the union over every fixed
        // replica, and the block count is the maximum.
        let mut max_block_count = 0u32;
        let mut v = VersionNumber::First;
        for memory in header_multi.memories.iter().flatten() {
            let h = FileHeader::decode(memory.content())?;
            if h.block_count >= max_block_count {
                max_block_count = h.block_count;
                v = h.version;
            }
        }
        let geom = AllocGeom::new(v, self.content_len());

        let mut second: Option<TimeStamp> = None;
        let mut need_apply: Option<bool> = None;

        let mut table = AllocGeom::first_table();
        while table < max_block_count {
            let mut table_multi = self.fix_alloc_table_multi(table, FixMode::Write)?;

            if v >= VersionNumber::Second
                && !alloc::is_apply_free(table_multi.master().content())
            {
                if need_apply.is_none() {
                    let s = self.checkpoints.second_most_recent();
                    // Reclaiming is only safe once every transaction
                    // began after the second most recent checkpoint.
                    let pass = self
                        .registry
                        .oldest_live_birth()
                        .map_or(true, |b| b > s);
                    second = Some(s);
                    need_apply = Some(pass);
                }
                if need_apply == Some(true) {
                    self.apply_free_to(&mut table_multi, second.unwrap(), &geom)?;
                }
            }

            let mut max_count = 0u32;
            for memory in table_multi.memories.iter().flatten() {
                max_count = max_count.max(alloc::count(memory.content()));
            }

            if n <= geom.bits.saturating_sub(max_count) {
                if let Some(begin) = self.search_table(
                    header_multi,
                    &mut table_multi,
                    table,
                    &geom,
                    n,
                    max_block_count,
                )? {
                    self.unfix_multi(table_multi)?;
                    return Ok(begin);
                }
            }
            self.unfix_multi(table_multi)?;
            table = geom.next_table(table);
        }

        // No run fits in any existing table: bind everything up to a new
        // table and carve the run out of it.
        self.extend_to(table)?;
        {
            let master = header_multi.master_mut();
            let mut h = FileHeader::decode(master.content())?;
            if h.block_count < table {
                h.block_count = table;
                h.encode(master.content_mut()?);
                master.dirty();
            }
        }
        let mut table_buf = self.fix_alloc_table(table, FixMode::Allocate)?;
        alloc::initialize(table_buf.content_mut()?);

        let begin = (table + N + n - 1) / n * n;
        let end = begin + n;
        self.extend_to(end)?;
        {
            let master = header_multi.master_mut();
            let mut h = FileHeader::decode(master.content())?;
            h.block_count = end;
            h.encode(master.content_mut()?);
            master.dirty();
        }
        let idx = (begin - geom.first_managed(table)) as usize;
        alloc::set_bound_run(table_buf.content_mut()?, &geom, idx, n as usize, true);
        alloc::set_newest_run(table_buf.content_mut()?, &geom, idx, n as usize, true);
        table_buf.dirty();
        self.file.unfix(table_buf)?;
        trace!(begin, n, "vlog.allocate.new_table");
        Ok(begin)
    }

    fn apply_free_to(
        &self,
        table_multi: &mut MultiplexBlock,
        second: TimeStamp,
        geom: &AllocGeom,
    ) -> Result<()> {
        let mut old: Option<Vec<u8>> = None;
        for (i, memory) in table_multi.memories.iter().enumerate() {
            if i == table_multi.master {
                continue;
            }
            if let Some(buf) = memory {
                if buf.last_modification() < second {
                    old = Some(buf.content().to_vec());
                }
            }
        }
        let master = table_multi.master_mut();
        if let Some(old) = old {
            alloc::apply_free(master.content_mut()?, &old, geom);
        } else {
            alloc::set_apply_free(master.content_mut()?, true);
        }
        master.dirty();
        Ok(())
    }

    fn search_table(
        &self,
        header_multi: &mut MultiplexBlock,
        table_multi: &mut MultiplexBlock,
        table: BlockId,
        geom: &AllocGeom,
        n: u32,
        max_block_count: u32,
    ) -> Result<Option<BlockId>> {
        let mut rest = n;
        for w in 0..geom.bitmap_len {
            let mut word = 0u32;
            for memory in table_multi.memories.iter().flatten() {
                word |= alloc::in_use_word(memory.content(), geom, w);
            }
            if word == u32::MAX {
                rest = n;
                continue;
            }
            for k in 0..32usize {
                if word & (1 << k) != 0 {
                    rest = n;
                    continue;
                }
                rest -= 1;
                if rest != 0 {
                    continue;
                }
                let end = geom.first_managed(table) + (32 * w + k) as u32 + 1;
                let begin = end - n;
                if begin % n != 0 {
                    // The run must start on a multiple of its length.
                    rest = 1;
                    continue;
                }
                if end > max_block_count {
                    self.extend_to(end)?;
                }
                {
                    let master = header_multi.master_mut();
                    let mut h = FileHeader::decode(master.content())?;
                    if end > h.block_count {
                        h.block_count = end;
                        h.encode(master.content_mut()?);
                        master.dirty();
                    }
                }
                let idx = (begin - geom.first_managed(table)) as usize;
                let master = table_multi.master_mut();
                alloc::set_bound_run(master.content_mut()?, geom, idx, n as usize, true);
                alloc::set_newest_run(master.content_mut()?, geom, idx, n as usize, true);
                master.dirty();
                return Ok(Some(begin));
            }
        }
        Ok(None)
    }

    /// Releases `n` consecutive blocks starting at `id`.
    pub fn free(&self, v: VersionNumber, id: BlockId, n: u32) -> Result<()> {
        debug_assert!(id != ILLEGAL_BLOCK_ID);
        let geom = AllocGeom::new(v, self.content_len());
        let table = geom.table_for(id);
        let mut buf = self.fix_alloc_table(table, FixMode::Write)?;
        let idx = geom.bit_index(id);
        alloc::set_bound_run(buf.content_mut()?, &geom, idx, n as usize, false);
        alloc::set_newest_run(buf.content_mut()?, &geom, idx, n as usize, false);
        buf.dirty();
        self.file.unfix(buf)?;
        Ok(())
    }

    /// Flags or unflags a block as holding the newest version.
    pub fn set_newest(&self, v: VersionNumber, id: BlockId, on: bool) -> Result<()> {
        if v < VersionNumber::Second {
            return Ok(());
        }
        let geom = AllocGeom::new(v, self.content_len());
        let table = geom.table_for(id);
        let mut buf = self.fix_alloc_table(table, FixMode::Write)?;
        let idx = geom.bit_index(id);
        alloc::set_newest_run(buf.content_mut()?, &geom, idx, 1, on);
        buf.dirty();
        self.file.unfix(buf)?;
        Ok(())
    }

    /// Whether a block's in-use bit is set.
    pub fn is_bound(&self, v: VersionNumber, id: BlockId) -> Result<bool> {
        let geom = AllocGeom::new(v, self.content_len());
        let table = geom.table_for(id);
        let buf = self.fix_alloc_table(table, FixMode::Read)?;
        Ok(alloc::get_bound(buf.content(), &geom, geom.bit_index(id)))
    }

    /// Whether a block's newest-version bit is set.
    pub fn is_newest(&self, v: VersionNumber, id: BlockId) -> Result<bool> {
        let geom = AllocGeom::new(v, self.content_len());
        let table = geom.table_for(id);
        let buf = self.fix_alloc_table(table, FixMode::Read)?;
        Ok(alloc::get_newest(buf.content(), &geom, geom.bit_index(id)))
    }

    /// Forces a block's in-use bit on (verification repair).
    pub(crate) fn mark_bound(&self, v: VersionNumber, id: BlockId) -> Result<()> {
        let geom = AllocGeom::new(v, self.content_len());
        let table = geom.table_for(id);
        let mut buf = self.fix_alloc_table(table, FixMode::Write)?;
        let idx = geom.bit_index(id);
        alloc::set_bound_run(buf.content_mut()?, &geom, idx, 1, true);
        buf.dirty();
        self.file.unfix(buf)?;
        Ok(())
    }

    /// Rewrites an allocation table's count word from its bitmap
    /// (verification repair).
    pub(crate) fn recount_table(&self, v: VersionNumber, table: BlockId) -> Result<()> {
        let geom = AllocGeom::new(v, self.content_len());
        let mut buf = self.fix_alloc_table(table, FixMode::Write)?;
        alloc::recount(buf.content_mut()?, &geom);
        buf.dirty();
        self.file.unfix(buf)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // version blocks

    /// Fixes the master replica of a multiplexed metadata group
    /// (verification walks).
    pub fn fix_meta_group(&self, base: BlockId, mode: FixMode) -> Result<BlockBuf> {
        multiplex::fix_master(
            &self.file,
            &self.multiplex,
            &self.checkpoints,
            MultiplexTable::normalize(base),
            mode,
            Priority::Low,
            None,
        )
    }

    /// Fixes the master replica of an allocation table (verification).
    pub fn fix_table(&self, table: BlockId, mode: FixMode) -> Result<BlockBuf> {
        self.fix_alloc_table(table, mode)
    }

    /// Fixes a version block, checking the id is in version territory.
    pub fn fix_log(&self, id: BlockId, mode: FixMode, priority: Priority) -> Result<BlockBuf> {
        if log::is_illegal_log_id(id) {
            return Err(UmbraError::Corruption(format!(
                "block {id} cannot hold a version"
            )));
        }
        self.file.fix(id, mode, priority)
    }

    /// Allocates and initialises a fresh version block.
    pub fn allocate_log_block(
        &self,
        header_multi: &mut MultiplexBlock,
        priority: Priority,
    ) -> Result<BlockBuf> {
        let id = self.allocate(header_multi, 1)?;
        let mut buf = self.file.fix(id, FixMode::Allocate, priority)?;
        LogRecord::unlinked().encode(buf.content_mut()?);
        buf.dirty();
        Ok(buf)
    }

    /// Unfixes a block through the underlying file.
    pub fn unfix(&self, buf: BlockBuf) -> Result<Option<TimeStamp>> {
        self.file.unfix(buf)
    }

    // ------------------------------------------------------------------
    // tree traversal

    fn fix_pbct_block(&self, id: BlockId, mode: FixMode) -> Result<BlockBuf> {
        multiplex::fix_master(
            &self.file,
            &self.multiplex,
            &self.checkpoints,
            MultiplexTable::normalize(id),
            mode,
            Priority::Middle,
            None,
        )
    }

    /// Walks the tree to the leaf responsible for `page_id`.
    ///
    /// `None` means no leaf exists and the page's latest version lives in
    /// the master data file.
    pub fn traverse_leaf(
        &self,
        header: &BlockBuf,
        page_id: PageId,
        mode: FixMode,
    ) -> Result<Option<LeafRef>> {
        let h = FileHeader::decode(header.content())?;
        let geom = self.pbct_geom();
        let Some(level) = h.pbct_level else {
            return Ok(None);
        };
        if level == 0 {
            return Ok(Some(LeafRef::Root));
        }
        let mut id = pbct::node::child(header.content(), geom.node_slot(page_id, 0, level));
        let mut current = 1u32;
        loop {
            if id == ILLEGAL_BLOCK_ID {
                return Ok(None);
            }
            if current == level {
                return Ok(Some(LeafRef::Owned(self.fix_pbct_block(id, mode)?)));
            }
            let node_buf = self.fix_pbct_block(id, FixMode::Read)?;
            id = pbct::node::child(
                node_buf.content(),
                geom.node_slot(page_id, current, level),
            );
            current += 1;
        }
    }

    /// The `(latest block, timestamp)` entry for `page_id`.
    pub fn leaf_entry(
        &self,
        leaf: &LeafRef,
        header: &BlockBuf,
        page_id: PageId,
    ) -> (BlockId, TimeStamp) {
        let geom = self.pbct_geom();
        let slot = geom.leaf_slot(page_id);
        let content = match leaf {
            LeafRef::Root => header.content(),
            LeafRef::Owned(buf) => buf.content(),
        };
        (
            pbct::leaf::latest(content, slot),
            pbct::leaf::timestamp(content, slot),
        )
    }

    /// Records the entry for `page_id`, dirtying whichever block holds it.
    pub fn set_leaf_entry(
        &self,
        leaf: &mut LeafRef,
        header: &mut BlockBuf,
        page_id: PageId,
        latest: BlockId,
        ts: TimeStamp,
    ) -> Result<()> {
        let geom = self.pbct_geom();
        let slot = geom.leaf_slot(page_id);
        match leaf {
            LeafRef::Root => {
                let content = header.content_mut()?;
                pbct::leaf::set_latest(content, slot, latest);
                pbct::leaf::set_timestamp(content, slot, ts);
                header.dirty();
            }
            LeafRef::Owned(buf) => {
                let content = buf.content_mut()?;
                pbct::leaf::set_latest(content, slot, latest);
                pbct::leaf::set_timestamp(content, slot, ts);
                buf.dirty();
            }
        }
        Ok(())
    }

    /// Number of entries recorded in the leaf.
    pub fn leaf_count(&self, leaf: &LeafRef, header: &BlockBuf) -> u32 {
        match leaf {
            LeafRef::Root => pbct::leaf::count(header.content()),
            LeafRef::Owned(buf) => pbct::leaf::count(buf.content()),
        }
    }

    /// Unfixes an owned leaf; the root leaf travels with the header.
    pub fn unfix_leaf(&self, leaf: LeafRef) -> Result<()> {
        if let LeafRef::Owned(buf) = leaf {
            self.file.unfix(buf)?;
        }
        Ok(())
    }

    fn allocate_pbct_group(
        &self,
        header_multi: &mut MultiplexBlock,
        is_leaf: bool,
    ) -> Result<BlockBuf> {
        let geom = self.pbct_geom();
        let base = self.allocate(header_multi, N)?;
        let mut buf = self.fix_pbct_block(base, FixMode::Allocate)?;
        if is_leaf {
            pbct::leaf::initialize(buf.content_mut()?, geom.leaf_capacity(true));
        } else {
            pbct::node::initialize(buf.content_mut()?, geom.node_capacity(true));
        }
        buf.dirty();
        Ok(buf)
    }

    /// Walks to the leaf for `page_id`, growing the tree and allocating
    /// nodes as needed.
    pub fn allocate_leaf_path(
        &self,
        header_multi: &mut MultiplexBlock,
        page_id: PageId,
    ) -> Result<LeafRef> {
        let geom = self.pbct_geom();
        let target = geom.required_level(page_id);

        {
            let master = header_multi.master_mut();
            let mut h = FileHeader::decode(master.content())?;
            if h.pbct_level.is_none() {
                h.pbct_level = Some(0);
                pbct::leaf::initialize(master.content_mut()?, geom.leaf_capacity(false));
                h.encode(master.content_mut()?);
                master.dirty();
            }
        }

        // Raise the tree until it can address the page: the current root
        // content moves into a fresh block and the in-header root becomes
        // a one-child node above it.
        loop {
            let level = {
                let h = FileHeader::decode(header_multi.master().content())?;
                h.pbct_level.unwrap()
            };
            if level >= target {
                break;
            }
            let moved = if level > 0 {
                let mut node_buf = self.allocate_pbct_group(header_multi, false)?;
                pbct::node::copy(
                    node_buf.content_mut()?,
                    header_multi.master().content(),
                    geom.node_capacity(false),
                );
                let id = node_buf.id();
                self.file.unfix(node_buf)?;
                id
            } else {
                let mut leaf_buf = self.allocate_pbct_group(header_multi, true)?;
                pbct::leaf::copy(
                    leaf_buf.content_mut()?,
                    header_multi.master().content(),
                    geom.leaf_capacity(false),
                );
                let id = leaf_buf.id();
                self.file.unfix(leaf_buf)?;
                id
            };
            let master = header_multi.master_mut();
            let mut h = FileHeader::decode(master.content())?;
            h.pbct_level = Some(level + 1);
            let content = master.content_mut()?;
            pbct::node::initialize(content, geom.node_capacity(false));
            pbct::node::set_child(content, 0, moved);
            h.encode(content);
            master.dirty();
        }

        let level = {
            let h = FileHeader::decode(header_multi.master().content())?;
            h.pbct_level.unwrap()
        };
        if level == 0 {
            return Ok(LeafRef::Root);
        }

        // Descend, allocating missing children.
        let mut parent: Option<BlockBuf> = None;
        let mut id =
            pbct::node::child(header_multi.master().content(), geom.node_slot(page_id, 0, level));
        let mut current = 1u32;
        loop {
            if id == ILLEGAL_BLOCK_ID {
                let is_leaf = current == level;
                let child = self.allocate_pbct_group(header_multi, is_leaf)?;
                let child_id = child.id();
                let slot = geom.node_slot(page_id, current - 1, level);
                match parent.as_mut() {
                    None => {
                        let master = header_multi.master_mut();
                        pbct::node::set_child(master.content_mut()?, slot, child_id);
                        master.dirty();
                    }
                    Some(node) => {
                        pbct::node::set_child(node.content_mut()?, slot, child_id);
                        node.dirty();
                    }
                }
                if is_leaf {
                    if let Some(node) = parent.take() {
                        self.file.unfix(node)?;
                    }
                    return Ok(LeafRef::Owned(child));
                }
                if let Some(node) = parent.take() {
                    self.file.unfix(node)?;
                }
                parent = Some(child);
                id = ILLEGAL_BLOCK_ID;
                current += 1;
            } else if current == level {
                if let Some(node) = parent.take() {
                    self.file.unfix(node)?;
                }
                return Ok(LeafRef::Owned(self.fix_pbct_block(id, FixMode::Write)?));
            } else {
                let node_buf = self.fix_pbct_block(id, FixMode::Write)?;
                if let Some(node) = parent.take() {
                    self.file.unfix(node)?;
                }
                id = pbct::node::child(
                    node_buf.content(),
                    geom.node_slot(page_id, current, level),
                );
                parent = Some(node_buf);
                current += 1;
            }
        }
    }

    /// Prunes the path to `page_id`'s leaf: empty leaves and nodes are
    /// freed bottom-up, and an empty root collapses the tree.
    pub fn free_leaf_path(&self, header: &mut BlockBuf, page_id: PageId) -> Result<()> {
        let mut h = FileHeader::decode(header.content())?;
        let Some(level) = h.pbct_level else {
            return Ok(());
        };
        let v = h.version;
        let mut dirty = false;
        let root_empty = {
            let content = header.content_mut()?;
            self.free_path_at(v, content, page_id, 0, level, &mut dirty)?
        };
        if dirty {
            header.dirty();
        }
        if root_empty {
            h.pbct_level = None;
            h.encode(header.content_mut()?);
            header.dirty();
        }
        Ok(())
    }

    fn free_path_at(
        &self,
        v: VersionNumber,
        content: &mut [u8],
        page_id: PageId,
        current: u32,
        level: u32,
        dirty: &mut bool,
    ) -> Result<bool> {
        let geom = self.pbct_geom();
        if current == level {
            return Ok(pbct::leaf::count(content) == 0);
        }
        let slot = geom.node_slot(page_id, current, level);
        let child = pbct::node::child(content, slot);
        if child != ILLEGAL_BLOCK_ID {
            let mut child_buf = self.fix_pbct_block(child, FixMode::Write)?;
            let mut child_dirty = false;
            let freed = self.free_path_at(
                v,
                child_buf.content_mut()?,
                page_id,
                current + 1,
                level,
                &mut child_dirty,
            )?;
            if freed {
                let base = MultiplexTable::normalize(child);
                drop(child_buf);
                self.free(v, base, N)?;
                self.multiplex.detach(base);
                pbct::node::set_child(content, slot, ILLEGAL_BLOCK_ID);
                *dirty = true;
            } else if child_dirty {
                child_buf.dirty();
                self.file.unfix(child_buf)?;
            }
        }
        Ok(pbct::node::count(content) == 0)
    }

    // ------------------------------------------------------------------
    // version chain walk

    /// Chooses the version block a transaction should see for a page.
    ///
    /// `None` means no block in the chain is in scope and the caller must
    /// fall through to the master data file.
    pub fn traverse_log(
        &self,
        trans: &Transaction,
        page: &PageRecord,
        latest: BlockId,
        oldest: TimeStamp,
        priority: Priority,
    ) -> Result<Option<BlockBuf>> {
        if latest == ILLEGAL_BLOCK_ID {
            return Ok(None);
        }
        let log_buf = self.fix_log(latest, FixMode::Read, priority)?;
        let rec = LogRecord::decode(log_buf.content())?;
        if !rec.preserves(page.id()) {
            return Err(UmbraError::PreservedDifferentPage {
                expected: page.id(),
                found: rec.page_id,
            });
        }
        if trans.is_no_version() {
            return Ok(Some(log_buf));
        }

        let modifiers = page.latch().lock();

        if trans.birth() > log_buf.last_modification() {
            let first = self.checkpoints.most_recent();
            let copy_this_epoch = rec.category == Category::Copy
                && log_buf.last_modification() > first;
            let overlapping =
                !trans.starting_list().is_empty() && trans.overlaps(&modifiers);
            if !copy_this_epoch && !overlapping {
                return Ok(Some(log_buf));
            }
        }

        if oldest != ILLEGAL_TIMESTAMP && rec.older_timestamp < oldest {
            return Ok(None);
        }
        let mut id = rec.older;
        let mut expected = rec.older_timestamp;
        while id != ILLEGAL_BLOCK_ID {
            let buf = self.fix_log(id, FixMode::Read, priority)?;
            let rec = LogRecord::decode(buf.content())?;
            if !rec.preserves(page.id()) {
                return Err(UmbraError::PreservedDifferentPage {
                    expected: page.id(),
                    found: rec.page_id,
                });
            }
            if buf.last_modification() != expected {
                // The link is broken; only corruption gets here.
                warn!(
                    block = id,
                    expected,
                    found = buf.last_modification(),
                    "version chain link mismatch"
                );
                break;
            }
            if trans.birth() > buf.last_modification() {
                return Ok(Some(buf));
            }
            if oldest != ILLEGAL_TIMESTAMP && rec.older_timestamp < oldest {
                break;
            }
            id = rec.older;
            expected = rec.older_timestamp;
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // write path

    /// Materialises the version block an updater should write to.
    ///
    /// `src` is the page's current latest (a version block, or the master
    /// image for a page with no log entry). The result is the new latest;
    /// it may be `src` itself when no new version is required.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_log(
        &self,
        trans: &Transaction,
        header_multi: &mut MultiplexBlock,
        page: &PageRecord,
        mut src: BlockBuf,
        oldest: TimeStamp,
        priority: Priority,
        batch: bool,
    ) -> Result<BlockBuf> {
        let first = self.checkpoints.most_recent();
        let after_most_recent = src.last_modification() > first;
        let mut src_rec = LogRecord::decode(src.content())?;
        let src_id = src.id();

        if !src_rec.preserves(page.id()) {
            return Err(UmbraError::PreservedDifferentPage {
                expected: page.id(),
                found: src_rec.page_id,
            });
        }

        if (src_rec.category == Category::Copy || batch) && after_most_recent {
            // The latest was created this epoch and its image still
            // exists one version down (or the caller asserted a single
            // writer), so it can be updated in place.
            return Ok(src);
        }

        let mut modifiers = page.latch().lock();
        let mut in_progress = false;
        let mut overlapped = false;
        let mut start: Option<TimeStamp> = None;

        if !modifiers.is_empty() {
            in_progress =
                self.registry
                    .in_progress_excluding(trans.id(), &modifiers, after_most_recent);
            if !in_progress {
                let (ov, first_clear) = self
                    .registry
                    .overlapping_readers(src.last_modification(), &modifiers);
                overlapped = ov;
                start = first_clear;
            } else if after_most_recent {
                // Another updater produced this latest within the same
                // epoch; both keep writing the same version and readers
                // resolve the overlap through the modifier list.
                return Ok(src);
            }
        }

        let v = self.header_version(header_multi)?;

        // The previous version can be recycled as the new latest when it
        // exists, postdates the last checkpoint, and no running reader
        // can still reach it.
        let reuse = !(src_rec.older == ILLEGAL_BLOCK_ID
            || (v == VersionNumber::First && src_rec.older_timestamp < oldest)
            || src_rec.older_timestamp < first
            || self.registry.refers_to_previous(
                src_rec.older_timestamp,
                src.last_modification(),
                &modifiers,
            ));

        let mut dst0 = if reuse {
            self.fix_log(src_rec.older, FixMode::Write, priority)?
        } else {
            self.allocate_log_block(header_multi, priority)?
        };

        if reuse {
            let prev_rec = LogRecord::decode(dst0.content())?;
            src_rec.older = prev_rec.older;
            src_rec.physical_log = prev_rec.physical_log;
            src_rec.older_timestamp = prev_rec.older_timestamp;
            src_rec.encode(src.content_mut()?);
            src.dirty();
            debug_assert!(src_rec.category != Category::Oldest);
        }

        dst0.copy_from(&src);
        let mut dst0_rec = LogRecord::decode(dst0.content())?;
        dst0_rec.category = Category::Copy;
        dst0_rec.page_id = page.id();
        dst0_rec.encode(dst0.content_mut()?);
        dst0.dirty();

        if v >= VersionNumber::Second {
            if reuse {
                self.set_newest(v, dst0.id(), true)?;
            }
            if src_rec.category != Category::Oldest {
                self.set_newest(v, src_id, false)?;
            }
        }

        let allocated = if in_progress {
            // The latest's updaters are still running and the latest
            // predates the checkpoint: it becomes a physical-log target
            // only, invisible to version readers.
            debug_assert!(!reuse);
            if src_rec.category != Category::Oldest {
                dst0_rec.physical_log = src_id;
            } else {
                dst0_rec.older_timestamp = ILLEGAL_TIMESTAMP;
            }
            dst0_rec.encode(dst0.content_mut()?);
            dst0
        } else if !overlapped {
            // Plain case: the old latest becomes the previous version.
            if src_rec.category != Category::Oldest {
                let link_ts = src.last_modification();
                if src.is_dirty() {
                    src.unfix_at(link_ts);
                }
                dst0_rec.older = src_id;
                dst0_rec.physical_log = ILLEGAL_BLOCK_ID;
                dst0_rec.older_timestamp = link_ts;
            } else {
                dst0_rec.older_timestamp = ILLEGAL_TIMESTAMP;
            }
            dst0_rec.encode(dst0.content_mut()?);
            self.file.unfix(src)?;
            return self.finish_allocate_log(trans, page, &mut *modifiers, dst0, batch);
        } else if after_most_recent && src_rec.category != Category::Oldest {
            // Readers that started while the modifiers ran must keep
            // seeing the old latest: back-date it below the earliest
            // reader born after the modifiers finished.
            let link_ts = match start {
                Some(s) => s - 1,
                None => self.clock.next(),
            };
            src.unfix_at(link_ts);
            dst0_rec.older = src_id;
            dst0_rec.physical_log = ILLEGAL_BLOCK_ID;
            dst0_rec.older_timestamp = link_ts;
            dst0_rec.encode(dst0.content_mut()?);
            self.file.unfix(src)?;
            return self.finish_allocate_log(trans, page, &mut *modifiers, dst0, batch);
        } else {
            // Overlapping readers exist but the latest predates the
            // checkpoint: it cannot be back-dated (the older image on
            // disk is still needed), so it becomes a physical-log target
            // and a back-dated copy is inserted between it and the new
            // latest.
            if v >= VersionNumber::Second {
                self.set_newest(v, dst0.id(), false)?;
            }
            debug_assert!(!reuse);
            if src_rec.category != Category::Oldest {
                dst0_rec.physical_log = src_id;
            } else {
                dst0_rec.older_timestamp = ILLEGAL_TIMESTAMP;
            }
            dst0_rec.encode(dst0.content_mut()?);
            let link_ts = match start {
                Some(s) => s - 1,
                None => self.clock.next(),
            };
            let dst0_id = dst0.id();
            dst0.unfix_at(link_ts);
            self.file.unfix(dst0)?;

            let mut dst1 = self.allocate_log_block(header_multi, priority)?;
            dst1.copy_from(&src);
            let mut dst1_rec = LogRecord::decode(dst1.content())?;
            dst1_rec.category = Category::Copy;
            dst1_rec.page_id = page.id();
            dst1_rec.older = dst0_id;
            dst1_rec.physical_log = ILLEGAL_BLOCK_ID;
            dst1_rec.older_timestamp = link_ts;
            dst1_rec.encode(dst1.content_mut()?);
            dst1.dirty();
            dst1
        };

        self.finish_allocate_log(trans, page, &mut *modifiers, allocated, batch)
    }

    fn finish_allocate_log(
        &self,
        trans: &Transaction,
        _page: &PageRecord,
        modifiers: &mut smallvec::SmallVec<[crate::txn::TxId; 4]>,
        allocated: BlockBuf,
        batch: bool,
    ) -> Result<BlockBuf> {
        // The new latest has exactly one creator from any reader's
        // perspective.
        modifiers.clear();
        if !batch {
            modifiers.push(trans.id());
        }
        Ok(allocated)
    }

    /// Prepares a page for online backup under a serialisable
    /// version-managed transaction: ensures the image every live reader
    /// needs is reachable through the chain alone, without modifier
    /// lists (which do not survive into a restored copy).
    ///
    /// Returns the page's new `(latest id, timestamp)` leaf entry when
    /// it changed.
    pub fn allocate_log_for_backup(
        &self,
        trans: &Transaction,
        header_multi: &mut MultiplexBlock,
        page: &PageRecord,
        mut src: BlockBuf,
    ) -> Result<Option<(BlockId, TimeStamp)>> {
        let _ = trans;
        let mut modifiers = page.latch().lock();
        let src_id = src.id();
        let src_rec = LogRecord::decode(src.content())?;

        if self.registry.any_in_progress(&modifiers) {
            if src.last_modification() > self.checkpoints.most_recent() {
                // Refreshing the latest's stamp makes every reader's
                // choice derivable from timestamps alone.
                src.dirty();
                let ts = self.file.unfix(src)?;
                modifiers.clear();
                return Ok(ts.map(|ts| (src_id, ts)));
            }
        } else {
            let (overlapped, _) = self
                .registry
                .overlapping_readers(src.last_modification(), &modifiers);
            if !overlapped {
                modifiers.clear();
                self.file.unfix(src)?;
                return Ok(None);
            }
        }

        let (_, start) = self
            .registry
            .overlapping_readers(src.last_modification(), &modifiers);

        let mut dst = self.allocate_log_block(header_multi, Priority::Low)?;
        dst.copy_from(&src);
        let mut dst_rec = LogRecord::decode(dst.content())?;
        dst_rec.category = Category::Copy;
        dst_rec.page_id = page.id();
        if src_rec.category != Category::Oldest {
            // The copy takes the original's place in the chain; the
            // original stays only as a physical-log target, invisible
            // to version readers.
            dst_rec.physical_log = src_id;
            let v = self.header_version(header_multi)?;
            if v >= VersionNumber::Second {
                self.set_newest(v, src_id, false)?;
            }
        } else {
            dst_rec.older = ILLEGAL_BLOCK_ID;
            dst_rec.older_timestamp = ILLEGAL_TIMESTAMP;
            dst_rec.physical_log = ILLEGAL_BLOCK_ID;
        }
        dst_rec.encode(dst.content_mut()?);
        let link_ts = match start {
            Some(s) => s - 1,
            None => self.clock.next(),
        };
        dst.unfix_at(link_ts);
        let dst_id = dst.id();
        self.file.unfix(dst)?;
        self.file.unfix(src)?;
        modifiers.clear();
        trace!(page = page.id(), block = dst_id, "vlog.backup.new_latest");
        Ok(Some((dst_id, link_ts)))
    }

    // ------------------------------------------------------------------
    // freeing chains

    /// Releases a version block and everything below it in its chain.
    pub fn free_log(&self, v: VersionNumber, mut id: BlockId, oldest: TimeStamp) -> Result<()> {
        let mut expected = ILLEGAL_TIMESTAMP;
        while id != ILLEGAL_BLOCK_ID {
            let buf = self.fix_log(id, FixMode::Read, Priority::Low)?;
            if expected != ILLEGAL_TIMESTAMP && buf.last_modification() != expected {
                warn!(block = id, "broken chain link while freeing");
                break;
            }
            let rec = LogRecord::decode(buf.content())?;
            self.free(v, id, 1)?;
            if v >= VersionNumber::Second {
                // Later formats only release the newest block; the rest
                // of the chain is reclaimed lazily by the allocator.
                break;
            }
            self.free_physical_log(v, rec.physical_log)?;
            if rec.older_timestamp < oldest {
                break;
            }
            id = rec.older;
            expected = rec.older_timestamp;
        }
        Ok(())
    }

    fn free_physical_log(&self, v: VersionNumber, mut id: BlockId) -> Result<()> {
        while id != ILLEGAL_BLOCK_ID {
            let buf = self.fix_log(id, FixMode::Read, Priority::Low)?;
            let rec = LogRecord::decode(buf.content())?;
            self.free(v, id, 1)?;
            id = rec.physical_log;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // sync

    /// One page's share of a sync pass.
    ///
    /// When the latest version is old enough and unreferenced, its image
    /// is promoted into the master data file (through the sync log) and
    /// the whole chain is released; [`ILLEGAL_TIMESTAMP`] is returned to
    /// tell the caller to clear the page's leaf entry. Otherwise the
    /// oldest timestamp still needed is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn sync_log(
        &self,
        trans: &Transaction,
        header: &BlockBuf,
        page: &PageRecord,
        latest: BlockId,
        oldest: TimeStamp,
        eldest: TimeStamp,
        master: &MasterDataFile,
        synclog: &SyncLogFile,
    ) -> Result<TimeStamp> {
        let _ = trans;
        debug_assert!(latest != ILLEGAL_BLOCK_ID);
        let h = FileHeader::decode(header.content())?;

        let log_buf = self.fix_log(latest, FixMode::Read, Priority::Low)?;

        if log_buf.last_modification() < eldest {
            let mut modifiers = page.latch().lock();
            if !self.registry.any_in_progress(&modifiers)
                && !self
                    .registry
                    .refers_to_latest(log_buf.last_modification(), &modifiers)
            {
                // Nothing running can see any version but this one:
                // promote it to master and drop the chain.
                modifiers.clear();
                master.sync_data(page.id(), &log_buf, synclog)?;
                self.free_log(h.version, latest, oldest)?;
                trace!(page = page.id(), "vlog.sync.promoted");
                return Ok(ILLEGAL_TIMESTAMP);
            }
        }

        if h.version < VersionNumber::Second {
            let rec = LogRecord::decode(log_buf.content())?;
            if oldest < rec.older_timestamp {
                let mut id = rec.older;
                while id != ILLEGAL_BLOCK_ID {
                    let buf = self.fix_log(id, FixMode::Read, Priority::Low)?;
                    let rec = LogRecord::decode(buf.content())?;
                    if rec.older_timestamp < oldest {
                        return Ok(buf.last_modification());
                    }
                    if buf.last_modification() < eldest {
                        // Everything below this block is out of every
                        // reader's reach; it becomes the new oldest.
                        self.free_log(h.version, rec.older, oldest)?;
                        return Ok(buf.last_modification());
                    }
                    if rec.older_timestamp == oldest {
                        break;
                    }
                    id = rec.older;
                }
            }
        }

        Ok(oldest)
    }

    // ------------------------------------------------------------------
    // truncation

    fn last_bound_block(&self, v: VersionNumber, block_count: u32) -> Result<BlockId> {
        let geom = AllocGeom::new(v, self.content_len());
        let mut table = geom.table_for(block_count - 1);
        loop {
            let multi = self.fix_alloc_table_multi(table, FixMode::Read)?;
            let managed = geom.first_managed(table);
            let limit = (block_count.saturating_sub(managed)).min(geom.bits) as usize;
            let mut found: Option<usize> = None;
            for idx in (0..limit).rev() {
                let mut set = false;
                for memory in multi.memories.iter().flatten() {
                    set |= alloc::get_bound(memory.content(), &geom, idx);
                }
                if set {
                    found = Some(idx);
                    break;
                }
            }
            self.unfix_multi(multi)?;
            if let Some(idx) = found {
                return Ok(managed + idx as u32);
            }
            if table == AllocGeom::first_table() {
                return Ok(N - 1);
            }
            table -= geom.bits + N;
        }
    }

    /// Trims trailing unbound blocks; returns whether anything beyond
    /// the header remains.
    pub fn truncate_all(&self) -> Result<bool> {
        let mut multi = self.fix_header_multi(FixMode::Write)?;
        let mut max = 0u32;
        let mut empty = true;
        let mut v = VersionNumber::CURRENT;
        for memory in multi.memories.iter().flatten() {
            let h = FileHeader::decode(memory.content())?;
            v = h.version;
            max = max.max(h.block_count);
            if !h.is_pbct_empty() {
                empty = false;
            }
        }

        if max > N {
            let keep = if empty {
                N
            } else {
                self.last_bound_block(v, max)? + 1
            };
            self.multiplex.clear_from(keep);
            {
                let master = multi.master_mut();
                let mut h = FileHeader::decode(master.content())?;
                if h.block_count > keep {
                    h.block_count = keep;
                    h.encode(master.content_mut()?);
                    master.dirty();
                }
            }
            // Replicas from older epochs may still claim more blocks;
            // truncating below them would break recovery.
            max = keep;
            for memory in multi.memories.iter().flatten() {
                let h = FileHeader::decode(memory.content())?;
                max = max.max(h.block_count);
            }
        }
        self.unfix_multi(multi)?;
        self.file.flush()?;
        self.file.truncate_blocks(u64::from(max))?;
        Ok(max > N)
    }

    /// Releases every version of pages at or past `page_id`, lowers the
    /// page count, and trims.
    pub fn truncate_from(&self, page_id: PageId) -> Result<bool> {
        {
            let mut header = self.fix_header(FixMode::Write)?;
            let h = FileHeader::decode(header.content())?;
            if h.page_count <= page_id {
                drop(header);
                return Ok(self.file.block_count()? > u64::from(N));
            }
            let v = h.version;
            let geom = self.pbct_geom();

            if let Some(level) = h.pbct_level {
                let per_leaf = geom.pages_per_leaf(level) as u32;
                let mut j = page_id / per_leaf * per_leaf;
                while j < h.page_count {
                    let leaf = self.traverse_leaf(&header, j, FixMode::Write)?;
                    if let Some(mut leaf) = leaf {
                        let entries =
                            (h.page_count - j).min(per_leaf);
                        let from = page_id.saturating_sub(j);
                        for i in from..entries {
                            let page = j + i;
                            let (latest, leaf_ts) = self.leaf_entry(&leaf, &header, page);
                            if latest != ILLEGAL_BLOCK_ID {
                                let oldest = if v >= VersionNumber::Second {
                                    ILLEGAL_TIMESTAMP
                                } else {
                                    leaf_ts
                                };
                                self.free_log(v, latest, oldest)?;
                                self.set_leaf_entry(
                                    &mut leaf,
                                    &mut header,
                                    page,
                                    ILLEGAL_BLOCK_ID,
                                    ILLEGAL_TIMESTAMP,
                                )?;
                            }
                        }
                        let emptied = self.leaf_count(&leaf, &header) == 0;
                        self.unfix_leaf(leaf)?;
                        if emptied {
                            self.free_leaf_path(&mut header, j)?;
                        }
                    }
                    j += per_leaf;
                }
            }

            let mut h = FileHeader::decode(header.content())?;
            h.page_count = page_id;
            h.encode(header.content_mut()?);
            header.dirty();
            self.file.unfix(header)?;
        }
        self.truncate_all()
    }

    // ------------------------------------------------------------------
    // restore / recover

    /// Makes the version a transaction born at `point` would see the new
    /// latest of every page. `false` means the file postdates `point`.
    pub fn restore(&self, point: TimeStamp) -> Result<bool> {
        let mut header = match self.fix_header(FixMode::Write) {
            Ok(buf) => buf,
            Err(UmbraError::BadDataPage { .. }) => return Ok(false),
            Err(other) => return Err(other),
        };
        let h = FileHeader::decode(header.content())?;
        if point < h.creation {
            return Ok(false);
        }
        let v = h.version;

        for page in 0..h.page_count {
            let Some(mut leaf) = self.traverse_leaf(&header, page, FixMode::Write)? else {
                continue;
            };
            let (latest, leaf_ts) = self.leaf_entry(&leaf, &header, page);
            if latest == ILLEGAL_BLOCK_ID {
                self.unfix_leaf(leaf)?;
                continue;
            }
            let oldest = if v >= VersionNumber::Second {
                ILLEGAL_TIMESTAMP
            } else {
                leaf_ts
            };

            let mut free_list: Vec<BlockId> = Vec::new();
            let mut keeper = latest;
            let mut keeper_ts = ILLEGAL_TIMESTAMP;
            loop {
                if keeper == ILLEGAL_BLOCK_ID {
                    break;
                }
                let buf = self.fix_log(keeper, FixMode::Read, Priority::Low)?;
                if buf.last_modification() < point {
                    keeper_ts = buf.last_modification();
                    break;
                }
                free_list.push(keeper);
                let rec = LogRecord::decode(buf.content())?;
                if v == VersionNumber::First && rec.older_timestamp < oldest {
                    // The walk exhausted the file-resident versions; the
                    // survivor is the master image.
                    keeper = ILLEGAL_BLOCK_ID;
                    break;
                }
                keeper = rec.older;
            }

            if !free_list.is_empty() {
                let new_ts = if keeper == ILLEGAL_BLOCK_ID {
                    ILLEGAL_TIMESTAMP
                } else if v >= VersionNumber::Second {
                    keeper_ts
                } else {
                    leaf_ts
                };
                self.set_leaf_entry(&mut leaf, &mut header, page, keeper, new_ts)?;
                if v >= VersionNumber::Second {
                    if keeper != ILLEGAL_BLOCK_ID {
                        self.set_newest(v, keeper, true)?;
                    }
                    self.set_newest(v, free_list[0], false)?;
                }
                for id in free_list.iter().rev() {
                    self.free(v, *id, 1)?;
                }
            }
            self.unfix_leaf(leaf)?;
        }
        self.file.unfix(header)?;
        Ok(true)
    }

    /// Rolls the file back to the checkpoint-consistent state at or
    /// before `point`. Returns the page count as of that state, or
    /// `None` when the file did not exist then.
    pub fn recover(&self, point: TimeStamp) -> Result<Option<u32>> {
        let Some(header) = multiplex::recover_master(&self.file, &self.multiplex, 0, point)?
        else {
            return Ok(None);
        };
        let h = FileHeader::decode(header.content())?;
        if h.creation == 0 || point < h.creation {
            // A zero creation stamp is a replica that never got past its
            // initial zero fill.
            return Ok(None);
        }

        let geom = AllocGeom::new(h.version, self.content_len());
        let mut table = AllocGeom::first_table();
        while table < h.block_count {
            if multiplex::recover_master(&self.file, &self.multiplex, table, point)?.is_none() {
                warn!(table, "allocation table unrecoverable");
            }
            table = geom.next_table(table);
        }

        if let Some(level) = h.pbct_level {
            self.recover_pbct(&header, 0, level, point)?;
        }
        self.file.flush()?;
        Ok(Some(h.page_count))
    }

    fn recover_pbct(
        &self,
        node: &BlockBuf,
        current: u32,
        level: u32,
        point: TimeStamp,
    ) -> Result<()> {
        if current >= level {
            return Ok(());
        }
        let geom = self.pbct_geom();
        let capacity = geom.node_capacity(current != 0);
        for i in 0..capacity {
            let id = pbct::node::child(node.content(), i);
            if id == ILLEGAL_BLOCK_ID {
                continue;
            }
            match multiplex::recover_master(
                &self.file,
                &self.multiplex,
                MultiplexTable::normalize(id),
                point,
            )? {
                Some(child) => self.recover_pbct(&child, current + 1, level, point)?,
                None => warn!(block = id, "tree node unrecoverable"),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // sizes

    /// Physical size of the file in bytes.
    pub fn size(&self) -> Result<u64> {
        self.file.size()
    }

    /// Bytes occupied by bound blocks (header, tables, and everything
    /// their bitmaps account for).
    pub fn bound_size(&self) -> Result<u64> {
        let bs = self.file.block_size() as u64;
        let h = self.read_header()?;
        let geom = AllocGeom::new(h.version, self.content_len());
        let mut total = u64::from(N) * bs;
        let mut table = AllocGeom::first_table();
        while table < h.block_count {
            let buf = self.fix_alloc_table(table, FixMode::Read)?;
            total += u64::from(N) * bs;
            total += u64::from(alloc::count(buf.content())) * bs;
            table = geom.next_table(table);
        }
        Ok(total)
    }
}
