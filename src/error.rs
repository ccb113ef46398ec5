use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::block::{BlockId, PageId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UmbraError>;

/// Errors surfaced by the versioned page store.
#[derive(Debug, Error)]
pub enum UmbraError {
    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A block failed its checksum or structural check on read.
    #[error("bad data page: block {block} of {path}")]
    BadDataPage {
        /// File the block was read from.
        path: PathBuf,
        /// Block that failed verification.
        block: BlockId,
    },
    /// A version block's embedded page id disagrees with the id it was
    /// reached under.
    #[error("block preserves page {found}, expected page {expected}")]
    PreservedDifferentPage {
        /// Page id the caller was resolving.
        expected: PageId,
        /// Page id stored in the block.
        found: PageId,
    },
    /// An allocation would exceed the configured file-size maximum.
    #[error("storage full: {path} would exceed {max} bytes")]
    StorageFull {
        /// File that refused to grow.
        path: PathBuf,
        /// Configured maximum in bytes.
        max: u64,
    },
    /// An integrity check reached a non-continuable state.
    #[error("verification aborted: {0}")]
    VerifyAborted(String),
    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,
    /// Interface misuse by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An on-disk structure is damaged beyond what multiplexing can mask.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

/// Kinds of inconsistency an integrity check can report.
///
/// Each finding is streamed into the verification progress with one of
/// these kinds; the treatment flags decide whether the check corrects,
/// continues, or aborts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyKind {
    /// Header block count disagrees with the physical file.
    BlockCountInconsistent,
    /// Header page count disagrees with the mapped pages or master size.
    PageCountInconsistent,
    /// Allocation-table bit or counter disagrees with reachable blocks.
    AllocationBitInconsistent,
    /// A tree node's child counter disagrees with its child pointers.
    ChildCountInconsistent,
    /// A leaf's latest counter disagrees with its recorded entries.
    LatestCountInconsistent,
    /// A chain link's recorded timestamp disagrees with the linked block.
    OlderTimeStampInconsistent,
    /// A leaf's oldest timestamp disagrees with the chain it indexes.
    OldestTimeStampInconsistent,
    /// Two chains reach the same version block.
    OlderNotIdentical,
    /// A physical-log link is out of range or cyclic.
    PhysicalLogIdInconsistent,
    /// A version block id is out of range or repeats within its chain.
    VersionLogIdInconsistent,
    /// A version block preserves a different page than the one indexing it.
    PreservedDifferentPage,
}

impl VerifyKind {
    /// Whether a finding of this kind can be repaired in place when the
    /// treatment requests correction.
    pub fn correctable(self) -> bool {
        matches!(
            self,
            VerifyKind::AllocationBitInconsistent
                | VerifyKind::ChildCountInconsistent
                | VerifyKind::LatestCountInconsistent
        )
    }
}
