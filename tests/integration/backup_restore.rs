#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use umbra::{
    CheckpointClock, FixMode, IsolationLevel, Result, StorageOptions, TimeStampSource,
    TransactionRegistry, UmbraError, VersionFile,
};

const PAGE_SIZE: usize = 1024;

struct Harness {
    clock: Arc<TimeStampSource>,
    registry: Arc<TransactionRegistry>,
    checkpoints: Arc<CheckpointClock>,
}

fn services() -> Harness {
    Harness {
        clock: Arc::new(TimeStampSource::new()),
        registry: Arc::new(TransactionRegistry::new()),
        checkpoints: Arc::new(CheckpointClock::new()),
    }
}

fn attach(dir: &Path, h: &Harness) -> Arc<VersionFile> {
    VersionFile::attach(
        StorageOptions::new(dir).page_size(PAGE_SIZE),
        h.clock.clone(),
        h.checkpoints.clone(),
        h.registry.clone(),
    )
}

fn write_page(store: &VersionFile, h: &Harness, page: u32, fill: u8) -> Result<()> {
    let tx = h.registry.begin_read_write(&h.clock);
    let mut image = store.fix_page(&tx, page, FixMode::Write)?;
    image.content_mut()?.fill(fill);
    store.unfix_page(image, true)?;
    h.registry.end(&tx);
    Ok(())
}

fn read_byte(store: &VersionFile, tx: &umbra::Transaction, page: u32) -> Result<u8> {
    let image = store.fix_page(tx, page, FixMode::Read)?;
    Ok(image.content()[0])
}

fn copy_store(from: &Path, to: &Path) {
    for name in ["MASTER.SYD", "VERSION.SYD", "SYNCLOG.SYD"] {
        let src = from.join(name);
        if src.exists() {
            std::fs::copy(&src, to.join(name)).unwrap();
        }
    }
}

#[test]
fn backup_copy_recovers_to_the_backup_transaction_snapshot() -> Result<()> {
    let dir = tempdir().unwrap();
    let backup_dir = tempdir().unwrap();
    let h = services();
    let store = attach(dir.path(), &h);

    let tx = h.registry.begin_read_write(&h.clock);
    store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&store, &h, 0, 0xAA)?;
    write_page(&store, &h, 0, 0xBB)?;
    h.checkpoints.checkpoint(&h.clock);
    let tx = h.registry.begin_read_write(&h.clock);
    store.flush(&tx)?;
    h.registry.end(&tx);

    let backup_tx = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::Serializable);
    store.start_backup(&backup_tx, true)?;

    // A concurrent writer keeps going; its update must not reach the
    // on-disk image while the backup copies files.
    write_page(&store, &h, 0, 0xCC)?;
    copy_store(dir.path(), backup_dir.path());

    store.end_backup(&backup_tx)?;
    h.registry.end(&backup_tx);

    // The live store sees the newest version.
    let tx = h.registry.begin_read_write(&h.clock);
    assert_eq!(read_byte(&store, &tx, 0)?, 0xCC);
    h.registry.end(&tx);

    // The copy, recovered to the backup transaction's birth, reads the
    // snapshot the backup transaction saw.
    let copy = attach(backup_dir.path(), &h);
    let tx = h.registry.begin_read_write(&h.clock);
    copy.mount(&tx)?;
    copy.recover(&tx, backup_tx.birth())?;
    assert_eq!(read_byte(&copy, &tx, 0)?, 0xBB);
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn restore_rewinds_the_latest_to_a_point_in_time() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = services();
    let store = attach(dir.path(), &h);

    let tx = h.registry.begin_read_write(&h.clock);
    store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&store, &h, 0, 0xAA)?;
    write_page(&store, &h, 0, 0xBB)?;
    let point = h.clock.next();
    write_page(&store, &h, 0, 0xCC)?;

    let tx = h.registry.begin_read_write(&h.clock);
    assert_eq!(read_byte(&store, &tx, 0)?, 0xCC);
    store.restore(&tx, point)?;
    assert_eq!(read_byte(&store, &tx, 0)?, 0xBB);
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn restore_is_refused_while_a_backup_runs() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = services();
    let store = attach(dir.path(), &h);

    let tx = h.registry.begin_read_write(&h.clock);
    store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&store, &h, 0, 0x01)?;

    let backup_tx = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::Serializable);
    store.start_backup(&backup_tx, false)?;

    let tx = h.registry.begin_read_write(&h.clock);
    match store.restore(&tx, h.clock.next()) {
        Err(UmbraError::InvalidArgument(_)) => {}
        other => panic!("expected refusal, got {other:?}"),
    }
    store.end_backup(&backup_tx)?;
    store.restore(&tx, h.clock.next())?;
    h.registry.end(&tx);
    h.registry.end(&backup_tx);
    Ok(())
}

#[test]
fn backup_cannot_be_started_twice() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = services();
    let store = attach(dir.path(), &h);
    let tx = h.registry.begin_read_write(&h.clock);
    store.create(&tx, 0)?;
    h.registry.end(&tx);

    let backup_tx = h
        .registry
        .begin_read_only(&h.clock, IsolationLevel::Serializable);
    store.start_backup(&backup_tx, false)?;
    match store.start_backup(&backup_tx, false) {
        Err(UmbraError::InvalidArgument(_)) => {}
        other => panic!("expected refusal, got {other:?}"),
    }
    store.end_backup(&backup_tx)?;
    h.registry.end(&backup_tx);
    Ok(())
}
