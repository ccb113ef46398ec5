#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use umbra::{
    CheckpointClock, FixMode, Result, StorageOptions, TimeStampSource, TransactionRegistry,
    VersionFile, VerifyOptions,
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

fn zero_block(path: &Path, block: u64) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(block * PAGE_SIZE as u64)).unwrap();
    file.write_all(&vec![0u8; PAGE_SIZE]).unwrap();
    file.sync_data().unwrap();
}

#[test]
fn zeroed_replicas_are_failed_over_and_the_store_verifies_clean() -> Result<()> {
    let dir = tempdir().unwrap();
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
    store.unmount(&tx)?;
    h.registry.end(&tx);
    drop(store);

    // A crash tears one replica of the file header group and one of the
    // first allocation table group.
    let vlog_path = dir.path().join("VERSION.SYD");
    zero_block(&vlog_path, 2);
    zero_block(&vlog_path, 5);

    let store = attach(dir.path(), &h);
    let tx = h.registry.begin_read_write(&h.clock);
    store.mount(&tx)?;

    let image = store.fix_page(&tx, 0, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0xBB));

    let report = store.verify(&tx, VerifyOptions::default(), |_| {})?;
    assert!(
        report.consistent(),
        "unexpected findings: {:?}",
        report.findings
    );
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn write_fix_heals_a_torn_replica() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = services();
    let store = attach(dir.path(), &h);

    let tx = h.registry.begin_read_write(&h.clock);
    store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&store, &h, 0, 0x11)?;
    h.checkpoints.checkpoint(&h.clock);
    let tx = h.registry.begin_read_write(&h.clock);
    store.flush(&tx)?;
    store.unmount(&tx)?;
    h.registry.end(&tx);
    drop(store);

    let vlog_path = dir.path().join("VERSION.SYD");
    zero_block(&vlog_path, 1);

    let store = attach(dir.path(), &h);
    let tx = h.registry.begin_read_write(&h.clock);
    store.mount(&tx)?;
    h.registry.end(&tx);

    // A new epoch's header write rotates onto the torn replica and
    // rewrites it whole.
    write_page(&store, &h, 0, 0x22)?;
    write_page(&store, &h, 0, 0x33)?;
    let tx = h.registry.begin_read_write(&h.clock);
    store.flush(&tx)?;

    let image = store.fix_page(&tx, 0, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0x33));
    let report = store.verify(&tx, VerifyOptions::default(), |_| {})?;
    assert!(report.consistent());
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn recovery_rolls_a_group_back_to_the_checkpoint_epoch() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = services();
    let store = attach(dir.path(), &h);

    let tx = h.registry.begin_read_write(&h.clock);
    store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&store, &h, 0, 0x51)?;
    h.checkpoints.checkpoint(&h.clock);
    let point = h.clock.next();
    let tx = h.registry.begin_read_write(&h.clock);
    store.flush(&tx)?;
    h.registry.end(&tx);

    // Updates after the recovery point must vanish.
    write_page(&store, &h, 0, 0x52)?;
    let tx = h.registry.begin_read_write(&h.clock);
    store.flush(&tx)?;
    store.recover(&tx, point)?;

    let image = store.fix_page(&tx, 0, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0x51));
    h.registry.end(&tx);
    Ok(())
}
