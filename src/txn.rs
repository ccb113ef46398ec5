//! Transaction records and the collaborators the store consumes.
//!
//! The store does not manage transactions itself. It consumes three
//! services owned by the surrounding system: a monotonic timestamp source,
//! a checkpoint clock carrying the last two checkpoint completion
//! timestamps, and a registry of live transactions that answers the
//! overlap questions the version chain walk and the sync engine ask.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::block::{TimeStamp, ILLEGAL_TIMESTAMP};

/// Identifier of a transaction, unique for the life of the process.
pub type TxId = u64;

/// Monotonic clock that hands out block timestamps.
///
/// Every dirty unfix is stamped from here; checkpoint completions are
/// recorded from the same sequence, so block stamps and checkpoint stamps
/// are totally ordered.
#[derive(Debug)]
pub struct TimeStampSource {
    next: AtomicU64,
}

impl Default for TimeStampSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeStampSource {
    /// Creates a source whose first value is 1; 0 is reserved for blocks
    /// never written.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next timestamp.
    pub fn next(&self) -> TimeStamp {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns the most recently handed-out timestamp without advancing.
    pub fn last(&self) -> TimeStamp {
        self.next.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Guarantees that every future timestamp exceeds `ts`.
    ///
    /// Reserved sentinel stamps (checkpoint + replica position) are
    /// written without consulting the clock; pushing the clock past them
    /// keeps all stamps within one multiplex group distinct.
    pub fn advance_past(&self, ts: TimeStamp) {
        self.next
            .fetch_max(ts.saturating_add(1), Ordering::SeqCst);
    }
}

/// The two checkpoint completion timestamps the store consumes.
///
/// A multiplex group is recoverable to either of the epochs these two
/// stamps delimit; everything older is fair game for reuse.
#[derive(Debug, Default)]
pub struct CheckpointClock {
    stamps: Mutex<(TimeStamp, TimeStamp)>,
}

impl CheckpointClock {
    /// Creates a clock with no completed checkpoints (both stamps zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the completion of a checkpoint at a fresh timestamp.
    pub fn checkpoint(&self, source: &TimeStampSource) -> TimeStamp {
        let ts = source.next();
        let mut stamps = self.stamps.lock();
        stamps.1 = stamps.0;
        stamps.0 = ts;
        ts
    }

    /// Timestamp of the most recent checkpoint completion.
    pub fn most_recent(&self) -> TimeStamp {
        self.stamps.lock().0
    }

    /// Timestamp of the checkpoint before the most recent one.
    pub fn second_most_recent(&self) -> TimeStamp {
        self.stamps.lock().1
    }
}

/// Isolation level a transaction runs under.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum IsolationLevel {
    /// Reads see the committed latest; no snapshot is maintained.
    ReadCommitted,
    /// Reads see the snapshot as of the transaction's birth.
    RepeatableRead,
    /// Snapshot reads plus the right to start a restorable backup.
    Serializable,
}

/// Whether a transaction may update pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    /// May update; always reads the latest version.
    ReadWrite,
    /// Never updates; may read a snapshot.
    ReadOnly,
}

/// The transaction record the store consumes on every fix.
#[derive(Clone, Debug)]
pub struct Transaction {
    id: TxId,
    birth: TimeStamp,
    category: Category,
    isolation: IsolationLevel,
    no_version: bool,
    /// Read-write transactions that were live when this one started,
    /// ascending by start time.
    starting: SmallVec<[TxId; 4]>,
}

impl Transaction {
    /// Transaction identifier.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Birth timestamp used to resolve the snapshot.
    pub fn birth(&self) -> TimeStamp {
        self.birth
    }

    /// Category of the transaction.
    pub fn category(&self) -> Category {
        self.category
    }

    /// Isolation level of the transaction.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// True when this transaction always reads the latest version.
    pub fn is_no_version(&self) -> bool {
        self.no_version
    }

    /// Read-write transactions live at this transaction's start.
    pub fn starting_list(&self) -> &[TxId] {
        &self.starting
    }

    /// Whether any of the given modifiers was live when this transaction
    /// started.
    pub fn overlaps(&self, modifiers: &[TxId]) -> bool {
        modifiers.iter().any(|m| self.starting.contains(m))
    }
}

#[derive(Debug)]
struct Active {
    id: TxId,
    birth: TimeStamp,
    category: Category,
    versioned: bool,
    starting: SmallVec<[TxId; 4]>,
    /// Set while this updater shares the latest version of some page with
    /// another live updater; suppresses new version-managed readers.
    deterrent: bool,
}

/// Registry of live transactions.
///
/// Owned by the surrounding system; the store only asks it questions.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    active: Mutex<Vec<Active>>,
}

impl TransactionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a read-write transaction. Read-write transactions are
    /// always no-version: they read the latest version of every page.
    pub fn begin_read_write(&self, source: &TimeStampSource) -> Transaction {
        self.begin(source, Category::ReadWrite, IsolationLevel::ReadCommitted)
    }

    /// Starts a read-only transaction at the given isolation level.
    ///
    /// The reader is version-managed when the isolation level maintains a
    /// snapshot and no live updater currently shares a latest version with
    /// another updater; otherwise it is downgraded to no-version.
    pub fn begin_read_only(
        &self,
        source: &TimeStampSource,
        isolation: IsolationLevel,
    ) -> Transaction {
        self.begin(source, Category::ReadOnly, isolation)
    }

    fn begin(
        &self,
        source: &TimeStampSource,
        category: Category,
        isolation: IsolationLevel,
    ) -> Transaction {
        let birth = source.next();
        let mut active = self.active.lock();
        let starting: SmallVec<[TxId; 4]> = active
            .iter()
            .filter(|a| a.category == Category::ReadWrite)
            .map(|a| a.id)
            .collect();
        let suppressed = active.iter().any(|a| a.deterrent);
        let no_version = match category {
            Category::ReadWrite => true,
            Category::ReadOnly => isolation < IsolationLevel::RepeatableRead || suppressed,
        };
        let tx = Transaction {
            id: birth,
            birth,
            category,
            isolation,
            no_version,
            starting,
        };
        active.push(Active {
            id: tx.id,
            birth,
            category,
            versioned: !no_version,
            starting: tx.starting.clone(),
            deterrent: false,
        });
        tx
    }

    /// Ends a transaction. The record must not be used afterwards.
    pub fn end(&self, tx: &Transaction) {
        let mut active = self.active.lock();
        active.retain(|a| a.id != tx.id);
    }

    /// Whether any of the given transactions is still live read-write.
    pub fn any_in_progress(&self, ids: &[TxId]) -> bool {
        let active = self.active.lock();
        active
            .iter()
            .any(|a| a.category == Category::ReadWrite && ids.contains(&a.id))
    }

    /// Whether any modifier other than `me` is still live read-write.
    ///
    /// When one is and `mark_deterrent` is set, the live modifiers are
    /// flagged so that new version-managed readers are suppressed until
    /// they all finish.
    pub fn in_progress_excluding(
        &self,
        me: TxId,
        ids: &[TxId],
        mark_deterrent: bool,
    ) -> bool {
        let mut active = self.active.lock();
        let mut found = false;
        for a in active.iter_mut() {
            if a.id != me && a.category == Category::ReadWrite && ids.contains(&a.id) {
                found = true;
                if mark_deterrent {
                    a.deterrent = true;
                }
            }
        }
        found
    }

    /// Whether a live version-managed reader refers to a latest version
    /// last modified at `t` by the given modifiers.
    pub fn refers_to_latest(&self, t: TimeStamp, modifiers: &[TxId]) -> bool {
        let active = self.active.lock();
        active.iter().any(|a| {
            a.versioned
                && a.birth > t
                && !modifiers.iter().any(|m| a.starting.contains(m))
        })
    }

    /// Whether a live version-managed reader refers to the second-newest
    /// version: born after the previous version's stamp and either before
    /// the latest's stamp or overlapping its modifiers.
    pub fn refers_to_previous(
        &self,
        older_ts: TimeStamp,
        latest_ts: TimeStamp,
        modifiers: &[TxId],
    ) -> bool {
        let active = self.active.lock();
        active.iter().any(|a| {
            a.versioned
                && a.birth > older_ts
                && (a.birth <= latest_ts || modifiers.iter().any(|m| a.starting.contains(m)))
        })
    }

    /// Looks for live version-managed readers born after `t`.
    ///
    /// Returns whether any such reader started while one of the modifiers
    /// was still running, and the birth of the earliest one that started
    /// after every modifier had finished.
    pub fn overlapping_readers(
        &self,
        t: TimeStamp,
        modifiers: &[TxId],
    ) -> (bool, Option<TimeStamp>) {
        let active = self.active.lock();
        let mut overlapped = false;
        let mut first_clear: Option<TimeStamp> = None;
        for a in active.iter() {
            if !a.versioned || a.birth <= t {
                continue;
            }
            if modifiers.iter().any(|m| a.starting.contains(m)) {
                overlapped = true;
            } else if first_clear.map_or(true, |b| a.birth < b) {
                first_clear = Some(a.birth);
            }
        }
        (overlapped, first_clear)
    }

    /// Birth of the oldest live transaction, if any.
    pub fn oldest_live_birth(&self) -> Option<TimeStamp> {
        let active = self.active.lock();
        active.iter().map(|a| a.birth).min()
    }

    /// Birth of the earliest live version-managed reader.
    ///
    /// [`ILLEGAL_TIMESTAMP`] when none is live, so callers can take a
    /// minimum against checkpoint stamps directly.
    pub fn earliest_version_reader_birth(&self) -> TimeStamp {
        let active = self.active.lock();
        active
            .iter()
            .filter(|a| a.versioned)
            .map(|a| a.birth)
            .min()
            .unwrap_or(ILLEGAL_TIMESTAMP)
    }
}
