//! Block-grained cached file I/O.
//!
//! Every constituent file of a version store is accessed through a
//! [`BlockFile`]: blocks are fixed into owned buffers, mutated, and
//! unfixed back. Dirty blocks accumulate in a write-back map and reach
//! disk on [`BlockFile::flush`] (or when the map outgrows the cache and
//! flushing is not inhibited by a backup). Every block carries a CRC32
//! trailer; a mismatch on read surfaces as `BadDataPage`, which the
//! multiplex layer uses for replica failover.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use crc32fast::hash;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::block::{BlockBuf, BlockId, TimeStamp, BLOCK_TRAILER_LEN};
use crate::error::{Result, UmbraError};
use crate::txn::TimeStampSource;

/// Default number of clean blocks kept cached per file.
pub const DEFAULT_CACHE_BLOCKS: usize = 256;

/// How a block is being fixed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FixMode {
    /// The buffer will only be read.
    Read,
    /// The buffer may be mutated and written back.
    Write,
    /// The buffer initialises a block that has never been written; no
    /// disk read is performed.
    Allocate,
}

/// Buffer replacement hint carried through fix calls.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Priority {
    /// Discarded from the cache readily.
    #[default]
    Low,
    /// Kept for a while.
    Middle,
    /// Kept as long as possible.
    High,
}

/// Which buffer category a file's cache belongs to.
///
/// Kept as a configuration surface; all categories currently share the
/// same per-file cache behavior.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BufferCategory {
    /// Ordinary durable data.
    #[default]
    Normal,
    /// Data that does not survive restarts.
    Temporary,
    /// Data never written back.
    ReadOnly,
}

/// Construction parameters for a [`BlockFile`].
#[derive(Clone, Debug)]
pub struct BlockFileOptions {
    /// Block size in bytes (a power of two).
    pub block_size: usize,
    /// Maximum file size in bytes; 0 means unbounded.
    pub size_max: u64,
    /// Growth unit in bytes when the file extends.
    pub extension_size: u64,
    /// Number of clean blocks cached.
    pub cache_blocks: usize,
    /// Whether the file may be written.
    pub read_only: bool,
}

struct State {
    path: PathBuf,
    file: Option<File>,
    mounted: bool,
    clean: LruCache<BlockId, Vec<u8>>,
    dirty: FxHashMap<BlockId, Vec<u8>>,
    flush_inhibited: bool,
}

impl State {
    fn zero_or_absent(&mut self, id: BlockId, block_size: usize) -> bool {
        let offset = u64::from(id) * block_size as u64;
        let Some(file) = self.file.as_mut() else {
            return true;
        };
        let Ok(meta) = file.metadata() else {
            return true;
        };
        if offset + block_size as u64 > meta.len() {
            return true;
        }
        let mut data = vec![0u8; block_size];
        if file.seek(SeekFrom::Start(offset)).is_err() || file.read_exact(&mut data).is_err() {
            return false;
        }
        data.iter().all(|b| *b == 0)
    }
}

/// A block-addressed file with a write-back cache.
pub struct BlockFile {
    block_size: usize,
    size_max: u64,
    extension_size: u64,
    read_only: bool,
    clock: Arc<TimeStampSource>,
    state: Mutex<State>,
}

impl BlockFile {
    /// Creates a descriptor for the file at `path`. Touches no disk state.
    pub fn new(path: PathBuf, options: &BlockFileOptions, clock: Arc<TimeStampSource>) -> Self {
        let cache = NonZeroUsize::new(options.cache_blocks.max(1)).unwrap();
        Self {
            block_size: options.block_size,
            size_max: options.size_max,
            extension_size: options.extension_size.max(options.block_size as u64),
            read_only: options.read_only,
            clock,
            state: Mutex::new(State {
                path,
                file: None,
                mounted: true,
                clean: LruCache::new(cache),
                dirty: FxHashMap::default(),
                flush_inhibited: false,
            }),
        }
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Absolute path of the underlying file.
    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    /// Creates the underlying file. Succeeds if it already exists.
    pub fn create(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&st.path)?;
            st.file = Some(file);
        }
        st.mounted = true;
        Ok(())
    }

    /// Unlinks the underlying file and discards all cached state.
    pub fn destroy(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.file = None;
        st.clean.clear();
        st.dirty.clear();
        if st.path.exists() {
            std::fs::remove_file(&st.path)?;
        }
        Ok(())
    }

    /// Marks the file available. Mounting a missing file succeeds; the
    /// caller may create it afterwards.
    pub fn mount(&self) {
        self.state.lock().mounted = true;
    }

    /// Marks the file unavailable and drops cached state.
    pub fn unmount(&self) {
        let mut st = self.state.lock();
        st.mounted = false;
        st.file = None;
        st.clean.clear();
        st.dirty.clear();
    }

    /// Whether the underlying file exists on disk.
    pub fn is_accessible(&self) -> bool {
        self.state.lock().path.exists()
    }

    /// Whether the file is mounted.
    pub fn is_mounted(&self) -> bool {
        self.state.lock().mounted
    }

    /// Whether the file is mounted and exists on disk.
    pub fn is_mounted_and_accessible(&self) -> bool {
        let st = self.state.lock();
        st.mounted && st.path.exists()
    }

    /// Physical size of the file in bytes.
    pub fn size(&self) -> Result<u64> {
        let mut st = self.state.lock();
        match self.open_handle(&mut st) {
            Ok(file) => Ok(file.metadata()?.len()),
            Err(_) => Ok(0),
        }
    }

    /// Number of whole blocks the physical file currently holds.
    pub fn block_count(&self) -> Result<u64> {
        Ok(self.size()? / self.block_size as u64)
    }

    /// Renames the underlying file, flushing dirty blocks first. A
    /// missing file (never created) simply records the new path.
    pub fn move_to(&self, new_path: PathBuf) -> Result<()> {
        let mut st = self.state.lock();
        self.flush_locked(&mut st)?;
        st.file = None;
        if st.path.exists() {
            std::fs::rename(&st.path, &new_path)?;
        }
        st.path = new_path;
        Ok(())
    }

    /// Inhibits or re-enables flushing. While inhibited, dirty blocks
    /// stay in memory so the on-disk image remains copyable.
    pub fn set_flush_inhibited(&self, inhibited: bool) {
        self.state.lock().flush_inhibited = inhibited;
    }

    /// Fixes one block.
    pub fn fix(&self, id: BlockId, mode: FixMode, _priority: Priority) -> Result<BlockBuf> {
        debug_assert_ne!(id, crate::block::ILLEGAL_BLOCK_ID);
        if mode == FixMode::Allocate {
            return Ok(BlockBuf::new(id, vec![0u8; self.block_size], true));
        }
        let mut st = self.state.lock();
        let data = self.load_locked(&mut st, id)?;
        Ok(BlockBuf::new(id, data, mode == FixMode::Write))
    }

    /// Fixes a block that may never have been written.
    ///
    /// Returns `None` when the block lies beyond the file end or reads
    /// as all zeroes (the fill of an extension that was never stamped).
    /// A block with actual content that fails its checksum still
    /// surfaces as `BadDataPage`.
    pub fn fix_existing(
        &self,
        id: BlockId,
        mode: FixMode,
        _priority: Priority,
    ) -> Result<Option<BlockBuf>> {
        let mut st = self.state.lock();
        match self.load_locked(&mut st, id) {
            Ok(data) => Ok(Some(BlockBuf::new(id, data, mode == FixMode::Write))),
            Err(UmbraError::BadDataPage { .. }) if st.zero_or_absent(id, self.block_size) => {
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// Unfixes a buffer. A dirty buffer is stamped (with its explicit
    /// unfix timestamp if one was set, otherwise a fresh clock value) and
    /// written back to the cache; the stamp is returned. A clean buffer
    /// is simply discarded.
    pub fn unfix(&self, mut buf: BlockBuf) -> Result<Option<TimeStamp>> {
        if !buf.is_dirty() {
            return Ok(None);
        }
        if self.read_only {
            return Err(UmbraError::InvalidArgument(
                "dirty unfix on a read-only file".into(),
            ));
        }
        let ts = buf
            .take_unfix_timestamp()
            .unwrap_or_else(|| self.clock.next());
        buf.set_last_modification(ts);
        self.clock.advance_past(ts);
        let id = buf.id();
        let mut st = self.state.lock();
        st.clean.pop(&id);
        st.dirty.insert(id, buf.into_data());
        if !st.flush_inhibited && st.dirty.len() > st.clean.cap().get() {
            self.flush_locked(&mut st)?;
        }
        Ok(Some(ts))
    }

    /// Writes every dirty block to disk and syncs.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.flush_locked(&mut st)
    }

    /// Grows the file so that at least `count` blocks exist, rounding the
    /// growth to the extension size. Fails with `StorageFull` when the
    /// configured maximum would be exceeded.
    pub fn ensure_blocks(&self, count: u64) -> Result<()> {
        let mut st = self.state.lock();
        let needed = count * self.block_size as u64;
        let file = self.open_handle(&mut st)?;
        let len = file.metadata()?.len();
        if len >= needed {
            return Ok(());
        }
        let grown = needed.div_ceil(self.extension_size) * self.extension_size;
        let target = if self.size_max != 0 && grown > self.size_max {
            if needed > self.size_max {
                warn!(
                    path = %st.path.display(),
                    needed,
                    max = self.size_max,
                    "file size limit exceeded"
                );
                return Err(UmbraError::StorageFull {
                    path: st.path.clone(),
                    max: self.size_max,
                });
            }
            needed
        } else {
            grown
        };
        file.set_len(target)?;
        Ok(())
    }

    /// Shrinks the file to exactly `count` blocks, discarding any cached
    /// blocks past the new end.
    pub fn truncate_blocks(&self, count: u64) -> Result<()> {
        let mut st = self.state.lock();
        st.dirty.retain(|id, _| u64::from(*id) < count);
        let stale: Vec<BlockId> = st
            .clean
            .iter()
            .filter_map(|(id, _)| (u64::from(*id) >= count).then_some(*id))
            .collect();
        for id in stale {
            st.clean.pop(&id);
        }
        let len = count * self.block_size as u64;
        let file = self.open_handle(&mut st)?;
        if file.metadata()?.len() > len {
            file.set_len(len)?;
        }
        Ok(())
    }

    fn open_handle<'a>(&self, st: &'a mut State) -> Result<&'a mut File> {
        if !st.mounted {
            return Err(UmbraError::InvalidArgument(
                "access to an unmounted file".into(),
            ));
        }
        if st.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(!self.read_only)
                .open(&st.path)?;
            st.file = Some(file);
        }
        Ok(st.file.as_mut().unwrap())
    }

    fn load_locked(&self, st: &mut State, id: BlockId) -> Result<Vec<u8>> {
        if let Some(data) = st.dirty.get(&id) {
            return Ok(data.clone());
        }
        if let Some(data) = st.clean.get(&id) {
            return Ok(data.clone());
        }
        let block_size = self.block_size;
        let offset = u64::from(id) * block_size as u64;
        let path = st.path.clone();
        let file = self.open_handle(st)?;
        let len = file.metadata()?.len();
        if offset + block_size as u64 > len {
            return Err(UmbraError::BadDataPage { path, block: id });
        }
        let mut data = vec![0u8; block_size];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;
        verify_trailer(&data).map_err(|_| UmbraError::BadDataPage { path, block: id })?;
        st.clean.put(id, data.clone());
        Ok(data)
    }

    fn flush_locked(&self, st: &mut State) -> Result<()> {
        if st.dirty.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<BlockId> = st.dirty.keys().copied().collect();
        ids.sort_unstable();
        let block_size = self.block_size;
        let max_id = u64::from(*ids.last().unwrap());
        {
            let file = self.open_handle(st)?;
            let needed = (max_id + 1) * block_size as u64;
            if file.metadata()?.len() < needed {
                file.set_len(needed)?;
            }
        }
        for id in ids {
            let mut data = st.dirty.remove(&id).unwrap();
            apply_trailer(&mut data);
            let file = self.open_handle(st)?;
            file.seek(SeekFrom::Start(u64::from(id) * block_size as u64))?;
            file.write_all(&data)?;
            st.clean.put(id, data);
        }
        self.open_handle(st)?.sync_data()?;
        Ok(())
    }
}

fn apply_trailer(data: &mut [u8]) {
    let payload_end = data.len() - BLOCK_TRAILER_LEN;
    let digest = hash(&data[..payload_end]);
    data[payload_end..].copy_from_slice(&digest.to_le_bytes());
}

fn verify_trailer(data: &[u8]) -> std::result::Result<(), ()> {
    let payload_end = data.len() - BLOCK_TRAILER_LEN;
    let stored = u32::from_le_bytes(data[payload_end..].try_into().unwrap());
    if hash(&data[..payload_end]) == stored {
        Ok(())
    } else {
        Err(())
    }
}
