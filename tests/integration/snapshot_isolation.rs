#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use umbra::{
    CheckpointClock, FixMode, IsolationLevel, Result, StorageOptions, TimeStampSource,
    TransactionRegistry, VersionFile,
};

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
        StorageOptions::new(dir).page_size(1024),
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

fn read_page(h: &Harness, tx: &umbra::Transaction, page: u32) -> Result<u8> {
    let image = h.store.fix_page(tx, page, FixMode::Read)?;
    let byte = image.content()[0];
    assert!(
        image.content().iter().all(|b| *b == byte),
        "page image must be uniform"
    );
    Ok(byte)
}

#[test]
fn snapshot_reader_keeps_its_birth_version() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);

    write_page(&h, 0, 0xAA)?;
    let t2 = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::RepeatableRead);
    write_page(&h, 0, 0xBB)?;

    // T2 was born between the two commits and must keep seeing 0xAA.
    assert_eq!(read_page(&h, &t2, 0)?, 0xAA);
    assert_eq!(read_page(&h, &t2, 0)?, 0xAA);
    h.registry.end(&t2);

    let t4 = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::RepeatableRead);
    assert_eq!(read_page(&h, &t4, 0)?, 0xBB);
    h.registry.end(&t4);
    Ok(())
}

#[test]
fn reader_overlapping_a_live_updater_goes_to_the_older_version() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&h, 0, 0xAA)?;

    // T3 updates the page but stays open.
    let t3 = h.registry.begin_read_write(&h.clock);
    let mut image = h.store.fix_page(&t3, 0, FixMode::Write)?;
    image.content_mut()?.fill(0xBB);
    h.store.unfix_page(image, true)?;

    // A reader that starts while T3 runs overlaps the modifier list and
    // must see the pre-update image, before and after T3 finishes.
    let reader = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::RepeatableRead);
    assert_eq!(read_page(&h, &reader, 0)?, 0xAA);
    h.registry.end(&t3);
    assert_eq!(read_page(&h, &reader, 0)?, 0xAA);
    h.registry.end(&reader);

    let after = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::RepeatableRead);
    assert_eq!(read_page(&h, &after, 0)?, 0xBB);
    h.registry.end(&after);
    Ok(())
}

#[test]
fn sync_between_reads_cannot_change_a_snapshot() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);

    write_page(&h, 0, 0xAA)?;
    h.checkpoints.checkpoint(&h.clock);
    h.checkpoints.checkpoint(&h.clock);
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.flush(&tx)?;
    h.registry.end(&tx);

    let reader = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::RepeatableRead);
    let before = read_page(&h, &reader, 0)?;
    write_page(&h, 0, 0xBB)?;

    let tx = h.registry.begin_read_write(&h.clock);
    h.store.sync(&tx)?;
    h.registry.end(&tx);

    let after = read_page(&h, &reader, 0)?;
    assert_eq!(before, after);
    assert_eq!(after, 0xAA);
    h.registry.end(&reader);
    Ok(())
}

#[test]
fn each_commit_forms_a_new_version_in_the_chain() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);

    let mut readers = Vec::new();
    for value in 1..=3u8 {
        write_page(&h, 0, value)?;
        readers.push((
            value,
            h.registry
                .begin_read_only(&h.clock, IsolationLevel::RepeatableRead),
        ));
    }

    // Every reader pinned the version that was the latest at its birth.
    for (expected, reader) in &readers {
        assert_eq!(read_page(&h, reader, 0)?, *expected);
    }
    for (_, reader) in &readers {
        h.registry.end(reader);
    }
    Ok(())
}
