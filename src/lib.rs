//! # Umbra - Versioned Page Store
//!
//! Umbra is the versioned page store at the heart of a transactional
//! database: an array of fixed-size logical pages, each with multiple
//! time-ordered versions, spread over three files per store directory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use umbra::{
//!     CheckpointClock, FixMode, StorageOptions, TimeStampSource,
//!     TransactionRegistry, VersionFile,
//! };
//!
//! let clock = Arc::new(TimeStampSource::new());
//! let checkpoints = Arc::new(CheckpointClock::new());
//! let registry = Arc::new(TransactionRegistry::new());
//!
//! let store = VersionFile::attach(
//!     StorageOptions::new("/tmp/store").page_size(4096),
//!     clock.clone(),
//!     checkpoints,
//!     registry.clone(),
//! );
//!
//! let writer = registry.begin_read_write(&clock);
//! store.create(&writer, 0)?;
//! let mut page = store.fix_page(&writer, 0, FixMode::Write)?;
//! page.content_mut()?.fill(0xAA);
//! store.unfix_page(page, true)?;
//! registry.end(&writer);
//! # Ok::<(), umbra::UmbraError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Master data file** (`MASTER.SYD`): one block per page, holding
//!   the oldest durable image.
//! - **Version log file** (`VERSION.SYD`): the multiplexed file header,
//!   allocation tables, the page→block conversion tree, and every newer
//!   version, chained per page.
//! - **Sync log file** (`SYNCLOG.SYD`): present only while the sync
//!   engine migrates versions into master; replayed after a crash.
//!
//! Metadata blocks are written three-fold and selected by timestamp, so
//! any group can be rolled back to either of the last two checkpoint
//! epochs. Snapshot readers resolve their version by birth timestamp
//! against each page's chain, without ever blocking writers.

pub mod block;
pub mod buffer;
pub mod error;
pub mod file;
pub mod master;
pub mod page;
pub mod synclog;
pub mod txn;
pub mod verify;
pub mod vlog;

// Re-export the main public API
pub use crate::block::{BlockId, PageId, TimeStamp, ILLEGAL_BLOCK_ID, ILLEGAL_TIMESTAMP};
pub use crate::buffer::{BufferCategory, FixMode, Priority};
pub use crate::error::{Result, UmbraError, VerifyKind};
pub use crate::file::{FileSizes, StorageOptions, SyncOutcome, VersionFile};
pub use crate::page::{ImageSource, PageImage};
pub use crate::txn::{
    Category, CheckpointClock, IsolationLevel, TimeStampSource, Transaction,
    TransactionRegistry, TxId,
};
pub use crate::verify::{Finding, Treatment, VerifyOptions, VerifyReport};
