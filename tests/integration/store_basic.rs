#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use umbra::{
    CheckpointClock, FixMode, ImageSource, IsolationLevel, Result, StorageOptions,
    TimeStampSource, TransactionRegistry, UmbraError, VersionFile,
};

struct Harness {
    store: Arc<VersionFile>,
    clock: Arc<TimeStampSource>,
    registry: Arc<TransactionRegistry>,
    checkpoints: Arc<CheckpointClock>,
}

fn open_store(dir: &Path, page_size: usize) -> Harness {
    let clock = Arc::new(TimeStampSource::new());
    let checkpoints = Arc::new(CheckpointClock::new());
    let registry = Arc::new(TransactionRegistry::new());
    let store = VersionFile::attach(
        StorageOptions::new(dir).page_size(page_size),
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

#[test]
fn create_write_read_roundtrip() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path(), 1024);

    let t1 = h.registry.begin_read_write(&h.clock);
    h.store.create(&t1, 0)?;
    let mut image = h.store.fix_page(&t1, 0, FixMode::Write)?;
    image.content_mut()?.fill(0xAA);
    h.store.unfix_page(image, true)?;
    h.registry.end(&t1);

    let t2 = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::RepeatableRead);
    let image = h.store.fix_page(&t2, 0, FixMode::Read)?;
    assert_eq!(image.source(), ImageSource::VersionLog);
    assert!(image.content().iter().all(|b| *b == 0xAA));
    h.registry.end(&t2);

    assert_eq!(h.store.page_count()?, 1);
    Ok(())
}

#[test]
fn reopen_preserves_written_pages() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path(), 1024);

    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&h, 0, 0x42)?;
    write_page(&h, 1, 0x43)?;
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.flush(&tx)?;
    h.registry.end(&tx);
    drop(h.store);

    // Reattach against the same external services; only the in-memory
    // caches are lost.
    let store = VersionFile::attach(
        StorageOptions::new(dir.path()).page_size(1024),
        h.clock.clone(),
        h.checkpoints.clone(),
        h.registry.clone(),
    );
    let tx = h.registry.begin_read_write(&h.clock);
    store.mount(&tx)?;
    let image = store.fix_page(&tx, 0, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0x42));
    let image = store.fix_page(&tx, 1, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0x43));
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn read_of_unknown_page_is_rejected() {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path(), 1024);
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0).unwrap();
    match h.store.fix_page(&tx, 5, FixMode::Read) {
        Err(UmbraError::InvalidArgument(_)) => {}
        other => panic!("expected invalid argument, got {other:?}"),
    }
    h.registry.end(&tx);
}

#[test]
fn write_fix_requires_a_read_write_transaction() {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path(), 1024);
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0).unwrap();
    h.registry.end(&tx);
    write_page(&h, 0, 0x01).unwrap();

    let reader = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::RepeatableRead);
    match h.store.fix_page(&reader, 0, FixMode::Write) {
        Err(UmbraError::InvalidArgument(_)) => {}
        other => panic!("expected invalid argument, got {other:?}"),
    }
    h.registry.end(&reader);
}

#[test]
fn no_version_reader_always_sees_the_latest() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path(), 1024);
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&h, 0, 0x10)?;

    // Born before the update, but no-version readers resolve at fix
    // time.
    let reader = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::ReadCommitted);
    assert!(reader.is_no_version());
    write_page(&h, 0, 0x20)?;
    let image = h.store.fix_page(&reader, 0, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0x20));
    h.registry.end(&reader);
    Ok(())
}

#[test]
fn repeated_writes_by_one_transaction_are_visible_to_it() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path(), 1024);
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;

    for round in 1..=4u8 {
        let mut image = h.store.fix_page(&tx, 0, FixMode::Write)?;
        image.content_mut()?.fill(round);
        h.store.unfix_page(image, true)?;
        let check = h.store.fix_page(&tx, 0, FixMode::Read)?;
        assert!(check.content().iter().all(|b| *b == round));
    }
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn batch_insert_updates_the_latest_in_place() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path(), 1024);
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.store.set_batch(true);

    let mut image = h.store.fix_page(&tx, 0, FixMode::Write)?;
    image.content_mut()?.fill(0x77);
    h.store.unfix_page(image, true)?;

    // In batch mode the modifier list is not maintained, so a second
    // write keeps mutating the same version block.
    let first_size = h.store.size()?;
    let mut image = h.store.fix_page(&tx, 0, FixMode::Write)?;
    image.content_mut()?.fill(0x78);
    h.store.unfix_page(image, true)?;
    assert_eq!(h.store.size()?, first_size);

    h.store.set_batch(false);
    let check = h.store.fix_page(&tx, 0, FixMode::Read)?;
    assert!(check.content().iter().all(|b| *b == 0x78));
    h.registry.end(&tx);
    Ok(())
}
