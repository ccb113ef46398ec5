//! Integrity verification.
//!
//! A full check walks every layer of a store: the header, the
//! conversion tree, every page's version chain, the physical-log
//! chains, the allocation tables, and the master data file. Each
//! inconsistency is streamed into the caller's progress sink as a
//! [`Finding`]; the treatment flags decide whether the check repairs
//! what it can, keeps going, or aborts on the first hit.

use rustc_hash::FxHashSet;
use tracing::warn;

use crate::block::{BlockId, PageId, ILLEGAL_BLOCK_ID, ILLEGAL_TIMESTAMP, MULTIPLEX_COUNT};
use crate::buffer::FixMode;
use crate::error::{Result, UmbraError, VerifyKind};
use crate::file::VersionFile;
use crate::txn::Transaction;
use crate::vlog::alloc::{self, AllocGeom};
use crate::vlog::header::{FileHeader, VersionNumber};
use crate::vlog::log::{self, LogRecord};
use crate::vlog::pbct::{leaf, node, PbctGeom};

const N: u32 = MULTIPLEX_COUNT as u32;

/// What to do with findings.
#[derive(Clone, Copy, Debug)]
pub struct Treatment {
    /// Repair correctable findings in place.
    pub correct: bool,
    /// Keep checking after a finding instead of aborting.
    pub continue_on_error: bool,
}

impl Default for Treatment {
    fn default() -> Self {
        Self {
            correct: false,
            continue_on_error: true,
        }
    }
}

/// Parameters of one verification run.
#[derive(Clone, Copy, Debug, Default)]
pub struct VerifyOptions {
    /// Treatment of findings.
    pub treatment: Treatment,
    /// Also require that every bound block was visited (full coverage).
    pub overall: bool,
}

/// One inconsistency discovered by verification.
#[derive(Clone, Debug)]
pub struct Finding {
    /// Classification of the inconsistency.
    pub kind: VerifyKind,
    /// Page involved, when page-scoped.
    pub page: Option<PageId>,
    /// Block involved, when block-scoped.
    pub block: Option<BlockId>,
    /// Human-readable description.
    pub detail: String,
    /// Whether the run repaired it.
    pub corrected: bool,
}

/// Summary of a verification run.
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Every finding, in discovery order.
    pub findings: Vec<Finding>,
}

impl VerifyReport {
    /// Whether the store checked out clean (ignoring corrected findings).
    pub fn consistent(&self) -> bool {
        self.findings.iter().all(|f| f.corrected)
    }
}

struct Verification<'a, F: FnMut(&Finding)> {
    file: &'a VersionFile,
    options: VerifyOptions,
    progress: F,
    report: VerifyReport,
    /// Blocks of the version log visited during the check.
    fixed: Vec<bool>,
    /// Version blocks already claimed by some chain.
    claimed: FxHashSet<BlockId>,
    version: VersionNumber,
}

impl<'a, F: FnMut(&Finding)> Verification<'a, F> {
    fn report(
        &mut self,
        kind: VerifyKind,
        page: Option<PageId>,
        block: Option<BlockId>,
        detail: String,
        corrected: bool,
    ) -> Result<()> {
        let finding = Finding {
            kind,
            page,
            block,
            detail,
            corrected,
        };
        warn!(?kind, page, block, corrected, "verify finding");
        (self.progress)(&finding);
        self.report.findings.push(finding);
        if !self.options.treatment.continue_on_error && !corrected {
            return Err(UmbraError::VerifyAborted(format!(
                "aborting on first finding: {kind:?}"
            )));
        }
        Ok(())
    }

    fn mark(&mut self, id: BlockId, n: u32) {
        for b in id..id + n {
            if let Some(slot) = self.fixed.get_mut(b as usize) {
                *slot = true;
            }
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.file.cancel_requested() {
            return Err(UmbraError::Cancelled);
        }
        Ok(())
    }

    // -- header ---------------------------------------------------------

    fn check_header(&mut self, header: &FileHeader) -> Result<()> {
        let physical = self.file.vlog().block_file().block_count()?;
        if u64::from(header.block_count) > physical {
            self.report(
                VerifyKind::BlockCountInconsistent,
                None,
                None,
                format!(
                    "header claims {} blocks but the file holds {physical}",
                    header.block_count
                ),
                false,
            )?;
        }
        let master_blocks = self.file.master().block_count()?;
        if master_blocks > u64::from(header.page_count) {
            self.report(
                VerifyKind::PageCountInconsistent,
                None,
                None,
                format!(
                    "master data holds {master_blocks} blocks for {} pages",
                    header.page_count
                ),
                false,
            )?;
        }
        Ok(())
    }

    // -- conversion tree ------------------------------------------------

    fn check_tree(&mut self, header: &FileHeader) -> Result<()> {
        let Some(level) = header.pbct_level else {
            return Ok(());
        };
        let vlog = self.file.vlog();
        let geom = PbctGeom::new(crate::block::content_size(self.file.page_size()));
        let root = vlog.fix_header(FixMode::Read)?;
        self.walk_tree_node(root.content(), &geom, 0, level)?;
        Ok(())
    }

    fn walk_tree_node(
        &mut self,
        content: &[u8],
        geom: &PbctGeom,
        current: u32,
        level: u32,
    ) -> Result<()> {
        let is_root = current == 0;
        if current == level {
            let capacity = geom.leaf_capacity(!is_root);
            let actual = leaf::occupancy(content, capacity);
            if actual != leaf::count(content) {
                self.report(
                    VerifyKind::LatestCountInconsistent,
                    None,
                    None,
                    format!(
                        "leaf counter {} but {actual} recorded entries",
                        leaf::count(content)
                    ),
                    false,
                )?;
            }
            return Ok(());
        }
        let capacity = geom.node_capacity(!is_root);
        let actual = node::occupancy(content, capacity);
        if actual != node::count(content) {
            self.report(
                VerifyKind::ChildCountInconsistent,
                None,
                None,
                format!(
                    "node counter {} but {actual} recorded children",
                    node::count(content)
                ),
                false,
            )?;
        }
        for i in 0..capacity {
            let child = node::child(content, i);
            if child == ILLEGAL_BLOCK_ID {
                continue;
            }
            if log::is_illegal_log_id(child) || child as usize >= self.fixed.len() {
                self.report(
                    VerifyKind::ChildCountInconsistent,
                    None,
                    Some(child),
                    "child pointer outside the file".into(),
                    false,
                )?;
                continue;
            }
            self.mark(child, N);
            let child_buf = self.file.vlog().fix_meta_group(child, FixMode::Read)?;
            self.walk_tree_node(child_buf.content(), geom, current + 1, level)?;
        }
        Ok(())
    }

    // -- version chains -------------------------------------------------

    fn check_pages(&mut self, header: &FileHeader) -> Result<()> {
        for page_id in 0..header.page_count {
            self.check_cancel()?;
            let vlog = self.file.vlog();
            let head = vlog.fix_header(FixMode::Read)?;
            let entry = match vlog.traverse_leaf(&head, page_id, FixMode::Read)? {
                Some(leaf_ref) => {
                    let entry = vlog.leaf_entry(&leaf_ref, &head, page_id);
                    vlog.unfix_leaf(leaf_ref)?;
                    entry
                }
                None => (ILLEGAL_BLOCK_ID, ILLEGAL_TIMESTAMP),
            };
            drop(head);
            if entry.0 != ILLEGAL_BLOCK_ID {
                self.check_chain(page_id, entry.0, entry.1)?;
            }
        }
        Ok(())
    }

    fn check_chain(&mut self, page_id: PageId, latest: BlockId, leaf_ts: u64) -> Result<()> {
        let vlog = self.file.vlog();
        let mut chain: FxHashSet<BlockId> = FxHashSet::default();
        let mut id = latest;
        let mut expected = ILLEGAL_TIMESTAMP;
        let mut first = true;

        while id != ILLEGAL_BLOCK_ID {
            if log::is_illegal_log_id(id) || u64::from(id) >= self.fixed.len() as u64 {
                self.report(
                    VerifyKind::VersionLogIdInconsistent,
                    Some(page_id),
                    Some(id),
                    "version block id outside version territory".into(),
                    false,
                )?;
                return Ok(());
            }
            if !chain.insert(id) {
                self.report(
                    VerifyKind::VersionLogIdInconsistent,
                    Some(page_id),
                    Some(id),
                    "version chain revisits a block".into(),
                    false,
                )?;
                return Ok(());
            }
            if !self.claimed.insert(id) {
                self.report(
                    VerifyKind::OlderNotIdentical,
                    Some(page_id),
                    Some(id),
                    "version block claimed by two chains".into(),
                    false,
                )?;
                return Ok(());
            }
            self.mark(id, 1);

            let buf = match vlog.fix_log(id, FixMode::Read, crate::buffer::Priority::Low) {
                Ok(buf) => buf,
                Err(UmbraError::BadDataPage { .. }) => {
                    self.report(
                        VerifyKind::VersionLogIdInconsistent,
                        Some(page_id),
                        Some(id),
                        "version block unreadable".into(),
                        false,
                    )?;
                    return Ok(());
                }
                Err(other) => return Err(other),
            };
            let rec = LogRecord::decode(buf.content())?;

            if !rec.preserves(page_id) {
                self.report(
                    VerifyKind::PreservedDifferentPage,
                    Some(page_id),
                    Some(id),
                    format!("block preserves page {}", rec.page_id),
                    false,
                )?;
                return Ok(());
            }

            if self.version == VersionNumber::First
                && !first
                && buf.last_modification() != expected
            {
                self.report(
                    VerifyKind::OlderTimeStampInconsistent,
                    Some(page_id),
                    Some(id),
                    format!(
                        "link expected stamp {expected}, block carries {}",
                        buf.last_modification()
                    ),
                    false,
                )?;
                return Ok(());
            }

            if !vlog.is_bound(self.version, id)? {
                let corrected = self.options.treatment.correct;
                if corrected {
                    vlog.mark_bound(self.version, id)?;
                }
                self.report(
                    VerifyKind::AllocationBitInconsistent,
                    Some(page_id),
                    Some(id),
                    "reachable version block not marked in use".into(),
                    corrected,
                )?;
            }

            if first {
                if self.version >= VersionNumber::Second {
                    if !vlog.is_newest(self.version, id)? {
                        self.report(
                            VerifyKind::AllocationBitInconsistent,
                            Some(page_id),
                            Some(id),
                            "latest version not marked newest".into(),
                            false,
                        )?;
                    }
                    if leaf_ts != buf.last_modification() {
                        self.report(
                            VerifyKind::OldestTimeStampInconsistent,
                            Some(page_id),
                            Some(id),
                            format!(
                                "leaf stamp {leaf_ts} but latest carries {}",
                                buf.last_modification()
                            ),
                            false,
                        )?;
                    }
                }
                first = false;
            }

            if self.version >= VersionNumber::Second {
                // Linked blocks below the latest may already be lazily
                // reclaimed; only the latest is guaranteed to exist.
                break;
            }

            self.check_physical_chain(page_id, rec.physical_log, &mut chain)?;

            if leaf_ts != ILLEGAL_TIMESTAMP && rec.older_timestamp < leaf_ts {
                break;
            }
            expected = rec.older_timestamp;
            id = rec.older;
        }
        Ok(())
    }

    fn check_physical_chain(
        &mut self,
        page_id: PageId,
        mut id: BlockId,
        chain: &mut FxHashSet<BlockId>,
    ) -> Result<()> {
        let vlog = self.file.vlog();
        while id != ILLEGAL_BLOCK_ID {
            if log::is_illegal_log_id(id)
                || u64::from(id) >= self.fixed.len() as u64
                || !chain.insert(id)
            {
                self.report(
                    VerifyKind::PhysicalLogIdInconsistent,
                    Some(page_id),
                    Some(id),
                    "physical log link out of range or cyclic".into(),
                    false,
                )?;
                return Ok(());
            }
            self.claimed.insert(id);
            self.mark(id, 1);
            let buf = vlog.fix_log(id, FixMode::Read, crate::buffer::Priority::Low)?;
            let rec = LogRecord::decode(buf.content())?;
            if !vlog.is_bound(self.version, id)? {
                self.report(
                    VerifyKind::AllocationBitInconsistent,
                    Some(page_id),
                    Some(id),
                    "physical log block not marked in use".into(),
                    false,
                )?;
            }
            id = rec.physical_log;
        }
        Ok(())
    }

    // -- allocation tables ----------------------------------------------

    fn check_allocation(&mut self, header: &FileHeader) -> Result<()> {
        let vlog = self.file.vlog();
        let geom = AllocGeom::new(
            self.version,
            crate::block::content_size(self.file.page_size()),
        );
        let mut table = AllocGeom::first_table();
        while table < header.block_count {
            self.check_cancel()?;
            self.mark(table, N);
            let buf = vlog.fix_table(table, FixMode::Read)?;
            let content = buf.content().to_vec();
            drop(buf);

            let popcount = alloc::popcount_in_use(&content, &geom);
            if popcount != alloc::count(&content) {
                let corrected = self.options.treatment.correct;
                if corrected {
                    vlog.recount_table(self.version, table)?;
                }
                self.report(
                    VerifyKind::AllocationBitInconsistent,
                    None,
                    Some(table),
                    format!(
                        "table counter {} but {popcount} bits set",
                        alloc::count(&content)
                    ),
                    corrected,
                )?;
            }

            if self.version >= VersionNumber::Second {
                for w in 0..geom.bitmap_len {
                    let stray = alloc::newest_word(&content, &geom, w)
                        & !alloc::in_use_word(&content, &geom, w);
                    if stray != 0 {
                        self.report(
                            VerifyKind::AllocationBitInconsistent,
                            None,
                            Some(table),
                            format!("newest bits without in-use bits in word {w}"),
                            false,
                        )?;
                    }
                }
            }

            if self.options.overall {
                let managed = geom.first_managed(table);
                let limit = header
                    .block_count
                    .saturating_sub(managed)
                    .min(geom.bits) as usize;
                for idx in 0..limit {
                    let block = managed + idx as u32;
                    if !alloc::get_bound(&content, &geom, idx) {
                        continue;
                    }
                    if self.fixed[block as usize] {
                        continue;
                    }
                    // A bound block no chain reached: garbage awaiting
                    // lazy reclamation is lawful (bound, not newest);
                    // anything still flagged newest is a leak.
                    if self.version >= VersionNumber::Second
                        && !alloc::get_newest(&content, &geom, idx)
                    {
                        continue;
                    }
                    let corrected = self.options.treatment.correct;
                    if corrected {
                        vlog.free(self.version, block, 1)?;
                    }
                    self.report(
                        VerifyKind::AllocationBitInconsistent,
                        None,
                        Some(block),
                        "bound block unreachable from any structure".into(),
                        corrected,
                    )?;
                }
            }
            table = geom.next_table(table);
        }
        Ok(())
    }
}

impl VersionFile {
    /// Runs a full integrity check, streaming findings into `progress`.
    ///
    /// With `overall` set the check additionally requires every bound
    /// block to be reachable. Returns the collected report; aborts with
    /// `VerifyAborted` when the treatment forbids continuing, and with
    /// `Cancelled` when the store's cancel flag is raised mid-run.
    pub fn verify(
        &self,
        trans: &Transaction,
        options: VerifyOptions,
        progress: impl FnMut(&Finding),
    ) -> Result<VerifyReport> {
        let _ = trans;
        let _shared = self.rwlock().read();
        let _structural = self.vlog().structural().lock();
        if !self.is_accessible() {
            return Ok(VerifyReport::default());
        }

        let header = self.vlog().read_header()?;
        let mut verification = Verification {
            file: self,
            options,
            progress,
            report: VerifyReport::default(),
            fixed: vec![false; header.block_count as usize],
            claimed: FxHashSet::default(),
            version: header.version,
        };

        verification.mark(0, N);
        verification.check_header(&header)?;
        verification.check_tree(&header)?;
        verification.check_pages(&header)?;
        verification.check_allocation(&header)?;

        Ok(verification.report)
    }
}
