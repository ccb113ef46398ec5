//! Multiplexed block selection.
//!
//! Every metadata block of the version log file (header, allocation
//! tables, tree nodes and leaves) is stored as a group of
//! [`MULTIPLEX_COUNT`] consecutive physical blocks. Within one checkpoint
//! epoch at most one replica of a group is written, so after a crash the
//! group can always be rolled back to the state it had at either of the
//! last two checkpoints. Selection is by last-modification timestamp:
//! readers take the newest replica, writers overwrite the oldest with the
//! newest content.
//!
//! The per-group timestamps are cached in a hash table so steady-state
//! selection fixes only one replica.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::block::{BlockBuf, BlockId, TimeStamp, ILLEGAL_TIMESTAMP, MULTIPLEX_COUNT};
use crate::buffer::{BlockFile, FixMode, Priority};
use crate::error::{Result, UmbraError};
use crate::txn::CheckpointClock;

const N: usize = MULTIPLEX_COUNT;

/// Cached replica timestamps for one multiplex group.
#[derive(Debug)]
pub struct MultiplexSlot {
    stamps: Mutex<[TimeStamp; N]>,
}

impl MultiplexSlot {
    fn new() -> Self {
        Self {
            stamps: Mutex::new([ILLEGAL_TIMESTAMP; N]),
        }
    }
}

/// Table of cached selection state, keyed by group base id.
#[derive(Debug, Default)]
pub struct MultiplexTable {
    slots: Mutex<FxHashMap<BlockId, Arc<MultiplexSlot>>>,
}

impl MultiplexTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, base: BlockId) -> Arc<MultiplexSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(base).or_insert_with(|| Arc::new(MultiplexSlot::new())))
    }

    /// Discards the cached state of one group (called when the group is
    /// freed).
    pub fn detach(&self, base: BlockId) {
        self.slots.lock().remove(&base);
    }

    /// Discards all cached state for groups at or past `from` (truncate),
    /// or everything when `from` is 0 (unmount, destroy).
    pub fn clear_from(&self, from: BlockId) {
        self.slots.lock().retain(|base, _| *base < from);
    }

    /// Rounds a block id down to the base of its multiplex group.
    pub fn normalize(id: BlockId) -> BlockId {
        id / N as BlockId * N as BlockId
    }
}

/// A fixed multiplex group: the master replica plus any slaves still
/// required for rollback to the second most recent checkpoint.
pub struct MultiplexBlock {
    /// Fixed replicas by position; absent entries are not needed for
    /// recovery.
    pub memories: [Option<BlockBuf>; N],
    /// Index of the master replica in `memories`.
    pub master: usize,
}

impl MultiplexBlock {
    /// The master replica.
    pub fn master(&self) -> &BlockBuf {
        self.memories[self.master].as_ref().unwrap()
    }

    /// The master replica, mutably.
    pub fn master_mut(&mut self) -> &mut BlockBuf {
        self.memories[self.master].as_mut().unwrap()
    }

    /// Takes the master replica out of the group.
    pub fn take_master(&mut self) -> BlockBuf {
        self.memories[self.master].take().unwrap()
    }
}

/// Fixes one replica, reporting an unreadable block as `None` so the
/// caller can fail over to another replica.
fn try_fix(
    file: &BlockFile,
    id: BlockId,
    mode: FixMode,
    priority: Priority,
) -> Result<Option<BlockBuf>> {
    match file.fix(id, mode, priority) {
        Ok(buf) => Ok(Some(buf)),
        Err(UmbraError::BadDataPage { .. }) => Ok(None),
        Err(other) => Err(other),
    }
}

/// Fixes the master replica of the group based at `base`.
///
/// Read fixes return the most recently written replica. Write fixes
/// return the *oldest* replica with the newest content copied in and the
/// buffer marked dirty, so the previous epoch's image survives on disk.
/// Allocate fixes initialise the whole group: replicas `1..N` are stamped
/// `most_recent_checkpoint + i` immediately, replica 0 is returned with a
/// pending stamp of `most_recent_checkpoint + N`.
///
/// A replica that fails its checksum is skipped (and healed by the next
/// write fix, which overwrites it with the newest content); the error
/// only surfaces when every replica is unreadable.
///
/// `init` runs once on the returned buffer whenever a write fix starts a
/// new epoch for the group (the copy-forward case).
pub fn fix_master(
    file: &BlockFile,
    table: &MultiplexTable,
    checkpoints: &CheckpointClock,
    base: BlockId,
    mode: FixMode,
    priority: Priority,
    init: Option<&dyn Fn(&mut BlockBuf)>,
) -> Result<BlockBuf> {
    let slot = table.attach(base);
    let mut stamps = slot.stamps.lock();
    let first = checkpoints.most_recent();

    if mode == FixMode::Allocate {
        let mut master = file.fix(base, FixMode::Allocate, priority)?;
        master.unfix_at(first + N as u64);
        stamps[0] = first + N as u64;
        for i in 1..N {
            let mut replica = file.fix(base + i as BlockId, FixMode::Allocate, priority)?;
            replica.unfix_at(first + i as u64);
            file.unfix(replica)?;
            stamps[i] = first + i as u64;
        }
        return Ok(master);
    }

    let fix_mode = mode;
    let mut memories: [Option<BlockBuf>; N] = [None, None, None];
    let mut dead = [false; N];
    let mut latest: Option<usize> = None;
    for i in 0..N {
        if stamps[i] == ILLEGAL_TIMESTAMP {
            match try_fix(file, base + i as BlockId, fix_mode, priority)? {
                Some(tmp) => {
                    stamps[i] = tmp.last_modification();
                    if stamps[i] > first {
                        // Only one replica per group is written after a
                        // checkpoint, so this is the most recent one.
                        return Ok(tmp);
                    }
                    if latest.map_or(true, |l| stamps[i] > stamps[l]) {
                        latest = Some(i);
                    }
                    memories[i] = Some(tmp);
                }
                None => {
                    warn!(block = base + i as BlockId, "skipping unreadable replica");
                    dead[i] = true;
                }
            }
        } else {
            if stamps[i] > first {
                return file.fix(base + i as BlockId, fix_mode, priority);
            }
            if latest.map_or(true, |l| stamps[i] > stamps[l]) {
                latest = Some(i);
            }
        }
    }

    let Some(latest) = latest else {
        return Err(UmbraError::BadDataPage {
            path: file.path(),
            block: base,
        });
    };

    if mode == FixMode::Read {
        return match memories[latest].take() {
            Some(m) => Ok(m),
            None => file.fix(base + latest as BlockId, FixMode::Read, priority),
        };
    }

    // Write: the oldest replica becomes the master for this epoch with
    // the newest content copied in. The rotation makes the replica after
    // the latest the oldest one; if it is unreadable, this write heals
    // it.
    let oldest = (latest + 1) % N;
    let src = match memories[latest].take() {
        Some(m) => m,
        None => file.fix(base + latest as BlockId, FixMode::Read, priority)?,
    };
    let mut dst = if dead[oldest] {
        file.fix(base + oldest as BlockId, FixMode::Allocate, priority)?
    } else {
        match memories[oldest].take() {
            Some(m) => m,
            None => file.fix(base + oldest as BlockId, FixMode::Write, priority)?,
        }
    };
    dst.copy_from(&src);
    dst.dirty();
    stamps[oldest] = first + 1;
    if let Some(init) = init {
        init(&mut dst);
    }
    Ok(dst)
}

/// Fixes the master replica and every slave still inside a recovery
/// horizon.
///
/// Slaves outside both horizons are released immediately; the caller sees
/// only replicas whose content could still become authoritative after a
/// rollback, which is exactly the set whose block/bit counts must be
/// honoured when allocating.
pub fn fix_master_and_slaves(
    file: &BlockFile,
    table: &MultiplexTable,
    checkpoints: &CheckpointClock,
    base: BlockId,
    mode: FixMode,
    priority: Priority,
    init: Option<&dyn Fn(&mut BlockBuf)>,
) -> Result<MultiplexBlock> {
    let slot = table.attach(base);
    let mut stamps = slot.stamps.lock();
    let first = checkpoints.most_recent();

    if mode == FixMode::Allocate {
        let mut master = file.fix(base, FixMode::Allocate, priority)?;
        master.unfix_at(first + N as u64);
        stamps[0] = first + N as u64;
        for i in 1..N {
            let mut replica = file.fix(base + i as BlockId, FixMode::Allocate, priority)?;
            replica.unfix_at(first + i as u64);
            file.unfix(replica)?;
            stamps[i] = first + i as u64;
        }
        return Ok(MultiplexBlock {
            memories: [Some(master), None, None],
            master: 0,
        });
    }

    let second = checkpoints.second_most_recent();
    let fix_mode = mode;
    let mut memories: [Option<BlockBuf>; N] = [None, None, None];
    let mut dead = [false; N];

    // Probe every replica whose stamp is not yet cached.
    for i in 0..N {
        if stamps[i] != ILLEGAL_TIMESTAMP {
            continue;
        }
        match try_fix(file, base + i as BlockId, fix_mode, priority)? {
            Some(m) => {
                stamps[i] = m.last_modification();
                memories[i] = Some(m);
            }
            None => {
                warn!(block = base + i as BlockId, "skipping unreadable replica");
                dead[i] = true;
            }
        }
    }

    let mut recent: Option<usize> = None;
    let mut latest: Option<usize> = None;
    for i in 0..N {
        if dead[i] {
            continue;
        }
        if stamps[i] > first {
            // At most one replica per group is written after a
            // checkpoint.
            recent = Some(i);
            break;
        }
        if latest.map_or(true, |l| stamps[i] > stamps[l]) {
            latest = Some(i);
        }
    }

    let mut ensure = |memories: &mut [Option<BlockBuf>; N], i: usize| -> Result<()> {
        if memories[i].is_none() {
            memories[i] = try_fix(file, base + i as BlockId, fix_mode, priority)?;
        }
        Ok(())
    };

    if let Some(i) = recent {
        // Recovery can only ever resurrect the replica one before the
        // recent one or one after it.
        let older = (i + N - 1) % N;
        let oldest = (i + 1) % N;
        ensure(&mut memories, i)?;
        if memories[i].is_none() {
            return Err(UmbraError::BadDataPage {
                path: file.path(),
                block: base + i as BlockId,
            });
        }
        if dead[older] || stamps[older] > first {
            memories[older] = None;
        } else {
            ensure(&mut memories, older)?;
        }
        if dead[older] || dead[oldest] || !(stamps[older] > second && stamps[oldest] < second) {
            memories[oldest] = None;
        } else {
            ensure(&mut memories, oldest)?;
        }
        return Ok(MultiplexBlock {
            memories,
            master: i,
        });
    }

    let Some(latest) = latest else {
        return Err(UmbraError::BadDataPage {
            path: file.path(),
            block: base,
        });
    };

    // No replica written since the most recent checkpoint.
    let older = (latest + N - 1) % N;
    let oldest = (latest + 1) % N;
    ensure(&mut memories, latest)?;
    if memories[latest].is_none() {
        return Err(UmbraError::BadDataPage {
            path: file.path(),
            block: base + latest as BlockId,
        });
    }
    if dead[older] || !(stamps[latest] > second && stamps[older] < second) {
        memories[older] = None;
    } else {
        ensure(&mut memories, older)?;
    }

    if mode == FixMode::Read {
        memories[oldest] = None;
        return Ok(MultiplexBlock {
            memories,
            master: latest,
        });
    }

    let mut dst = if dead[oldest] {
        memories[oldest] = None;
        file.fix(base + oldest as BlockId, FixMode::Allocate, priority)?
    } else {
        ensure(&mut memories, oldest)?;
        match memories[oldest].take() {
            Some(m) => m,
            None => file.fix(base + oldest as BlockId, FixMode::Write, priority)?,
        }
    };
    {
        let src_image = memories[latest].as_ref().unwrap();
        dst.copy_from(src_image);
    }
    dst.dirty();
    stamps[oldest] = first + 1;
    if let Some(init) = init {
        init(&mut dst);
    }
    memories[oldest] = Some(dst);
    Ok(MultiplexBlock {
        memories,
        master: oldest,
    })
}

/// Recovers a multiplex group to its state at or before `point`.
///
/// Replicas that cannot be read are zeroed ready for re-initialisation;
/// replicas written after `point` are reset. The most recent remaining
/// replica is returned. `None` means every replica was unreadable or too
/// new, which signals that the file predates `point`.
pub fn recover_master(
    file: &BlockFile,
    table: &MultiplexTable,
    base: BlockId,
    point: TimeStamp,
) -> Result<Option<BlockBuf>> {
    let slot = table.attach(base);
    let mut stamps = slot.stamps.lock();

    let mut memories: [Option<BlockBuf>; N] = [None, None, None];
    let mut oldest_ts = ILLEGAL_TIMESTAMP;
    for i in 0..N {
        match file.fix(base + i as BlockId, FixMode::Write, Priority::Low) {
            Ok(m) => {
                stamps[i] = m.last_modification();
                if oldest_ts == ILLEGAL_TIMESTAMP || stamps[i] < oldest_ts {
                    oldest_ts = stamps[i];
                }
                memories[i] = Some(m);
            }
            Err(UmbraError::BadDataPage { .. }) => {
                stamps[i] = ILLEGAL_TIMESTAMP;
            }
            Err(other) => return Err(other),
        }
    }

    if oldest_ts == ILLEGAL_TIMESTAMP || oldest_ts > point {
        return Ok(None);
    }

    let mut latest: Option<usize> = None;
    for i in 0..N {
        if stamps[i] == ILLEGAL_TIMESTAMP {
            if memories[i].is_none() {
                let mut m = file.fix(base + i as BlockId, FixMode::Allocate, Priority::Low)?;
                m.unfix_at(0);
                file.unfix(m)?;
            }
        } else if stamps[i] > point {
            let mut m = memories[i].take().unwrap();
            m.reset();
            m.unfix_at(0);
            file.unfix(m)?;
            stamps[i] = ILLEGAL_TIMESTAMP;
        } else if latest.map_or(true, |l| stamps[i] > stamps[l]) {
            latest = Some(i);
        }
    }

    Ok(latest.and_then(|l| memories[l].take()))
}
