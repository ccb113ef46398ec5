#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use umbra::{
    CheckpointClock, FixMode, ImageSource, IsolationLevel, Result, StorageOptions,
    TimeStampSource, TransactionRegistry, UmbraError, VersionFile, VerifyOptions,
};

const PAGE_SIZE: usize = 1024;

struct Harness {
    store: Arc<VersionFile>,
    clock: Arc<TimeStampSource>,
    registry: Arc<TransactionRegistry>,
    checkpoints: Arc<CheckpointClock>,
}

fn open_store(dir: &Path) -> Harness {
    let clock = Arc::new(TimeStampSource::new());
    let checkpoints = Arc::new(CheckpointClock::new());
    let registry = Arc::new(TransactionRegistry::new());
    let store = VersionFile::attach(
        StorageOptions::new(dir).page_size(PAGE_SIZE),
        clock.clone(),
        checkpoints.clone(),
        registry.clone(),
    );
    Harness {
        store,
        clock,
        registry,
        checkpoints,
    }
}

fn write_page(h: &Harness, page: u32, fill: u8) -> Result<()> {
    let tx = h.registry.begin_read_write(&h.clock);
    let mut image = h.store.fix_page(&tx, page, FixMode::Write)?;
    image.content_mut()?.fill(fill);
    h.store.unfix_page(image, true)?;
    h.registry.end(&tx);
    Ok(())
}

fn two_checkpoints(h: &Harness) -> Result<()> {
    h.checkpoints.checkpoint(&h.clock);
    h.checkpoints.checkpoint(&h.clock);
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.flush(&tx)?;
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn sync_promotes_the_newest_version_into_master() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);

    write_page(&h, 0, 0xAA)?;
    write_page(&h, 0, 0xBB)?;
    two_checkpoints(&h)?;

    let tx = h.registry.begin_read_write(&h.clock);
    let outcome = h.store.sync(&tx)?;
    assert!(outcome.modified);

    // The page now reads from the master data file.
    let image = h.store.fix_page(&tx, 0, FixMode::Read)?;
    assert_eq!(image.source(), ImageSource::Master);
    assert!(image.content().iter().all(|b| *b == 0xBB));

    // The version log shrank back to roughly header plus one
    // allocation table.
    let vlog_blocks = dir
        .path()
        .join("VERSION.SYD")
        .metadata()
        .unwrap()
        .len()
        / PAGE_SIZE as u64;
    assert!(
        vlog_blocks <= 9,
        "version log still holds {vlog_blocks} blocks"
    );

    // No sync log is left behind.
    assert!(!dir.path().join("SYNCLOG.SYD").exists());
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn sync_without_two_checkpoints_is_a_no_op() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&h, 0, 0x31)?;
    h.checkpoints.checkpoint(&h.clock);

    let tx = h.registry.begin_read_write(&h.clock);
    let outcome = h.store.sync(&tx)?;
    assert!(!outcome.modified);
    let image = h.store.fix_page(&tx, 0, FixMode::Read)?;
    assert_eq!(image.source(), ImageSource::VersionLog);
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn sync_skips_pages_pinned_by_a_live_reader() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);

    let reader = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::RepeatableRead);
    write_page(&h, 0, 0x61)?;
    two_checkpoints(&h)?;

    // The reader predates the page's only version, so migration would
    // change what it reads; the pass must leave the page alone.
    let tx = h.registry.begin_read_write(&h.clock);
    let outcome = h.store.sync(&tx)?;
    assert!(outcome.incomplete);
    let image = h.store.fix_page(&tx, 0, FixMode::Read)?;
    assert_eq!(image.source(), ImageSource::VersionLog);
    h.registry.end(&tx);
    h.registry.end(&reader);
    Ok(())
}

#[test]
fn writes_resume_on_top_of_a_synced_master_image() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);

    write_page(&h, 0, 0x71)?;
    two_checkpoints(&h)?;
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.sync(&tx)?;
    h.registry.end(&tx);

    write_page(&h, 0, 0x72)?;
    let tx = h.registry.begin_read_write(&h.clock);
    let image = h.store.fix_page(&tx, 0, FixMode::Read)?;
    assert_eq!(image.source(), ImageSource::VersionLog);
    assert!(image.content().iter().all(|b| *b == 0x72));

    let report = h.store.verify(&tx, VerifyOptions::default(), |_| {})?;
    assert!(
        report.consistent(),
        "unexpected findings: {:?}",
        report.findings
    );
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn cancelled_sync_returns_cleanly() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&h, 0, 0x81)?;
    two_checkpoints(&h)?;

    h.store.cancel(true);
    let tx = h.registry.begin_read_write(&h.clock);
    match h.store.sync(&tx) {
        Err(UmbraError::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    h.store.cancel(false);

    // The aborted pass left no stale sync log behind.
    assert!(!dir.path().join("SYNCLOG.SYD").exists());
    let outcome = h.store.sync(&tx)?;
    assert!(outcome.modified);
    h.registry.end(&tx);
    Ok(())
}
