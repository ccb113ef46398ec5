#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use umbra::{
    CheckpointClock, FixMode, Result, StorageOptions, TimeStampSource, TransactionRegistry,
    UmbraError, VersionFile, VerifyKind, VerifyOptions,
};

const PAGE_SIZE: usize = 1024;

struct Harness {
    store: Arc<VersionFile>,
    clock: Arc<TimeStampSource>,
    registry: Arc<TransactionRegistry>,
}

fn open_store(dir: &Path) -> Harness {
    let clock = Arc::new(TimeStampSource::new());
    let checkpoints = Arc::new(CheckpointClock::new());
    let registry = Arc::new(TransactionRegistry::new());
    let store = VersionFile::attach(
        StorageOptions::new(dir).page_size(PAGE_SIZE),
        clock.clone(),
        checkpoints,
        registry.clone(),
    );
    Harness {
        store,
        clock,
        registry,
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
fn truncate_is_idempotent() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);

    for page in 0..10u32 {
        write_page(&h, page, page as u8 + 1)?;
    }

    let tx = h.registry.begin_read_write(&h.clock);
    h.store.truncate(&tx, 5)?;
    assert_eq!(h.store.page_count()?, 5);
    let size_once = h.store.size()?;

    h.store.truncate(&tx, 5)?;
    assert_eq!(h.store.page_count()?, 5);
    assert_eq!(h.store.size()?, size_once);

    for page in 0..5u32 {
        let image = h.store.fix_page(&tx, page, FixMode::Read)?;
        assert!(image.content().iter().all(|b| *b == page as u8 + 1));
    }
    match h.store.fix_page(&tx, 7, FixMode::Read) {
        Err(UmbraError::InvalidArgument(_)) => {}
        other => panic!("expected invalid argument, got {other:?}"),
    }

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
fn truncate_to_zero_empties_the_store() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);

    for page in 0..8u32 {
        write_page(&h, page, 0x99)?;
    }
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.truncate(&tx, 0)?;
    assert_eq!(h.store.page_count()?, 0);
    assert_eq!(h.store.pbct_level()?, None);

    // Writing again after a full truncate starts from scratch.
    h.registry.end(&tx);
    write_page(&h, 0, 0x17)?;
    let tx = h.registry.begin_read_write(&h.clock);
    let image = h.store.fix_page(&tx, 0, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0x17));
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn verify_reports_a_torn_version_block() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&h, 0, 0xEE)?;
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.flush(&tx)?;
    h.store.unmount(&tx)?;
    h.registry.end(&tx);
    drop(h.store);

    // The first version block of a fresh store lands right after the
    // header and first allocation table; tear a byte in its payload.
    let vlog = dir.path().join("VERSION.SYD");
    let mut file = OpenOptions::new().write(true).open(&vlog).unwrap();
    file.seek(SeekFrom::Start(6 * PAGE_SIZE as u64 + 40)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    file.sync_data().unwrap();
    drop(file);

    let clock = h.clock.clone();
    let registry = h.registry.clone();
    let store = VersionFile::attach(
        StorageOptions::new(dir.path()).page_size(PAGE_SIZE),
        clock.clone(),
        Arc::new(CheckpointClock::new()),
        registry.clone(),
    );
    let tx = registry.begin_read_write(&clock);
    store.mount(&tx)?;

    let report = store.verify(&tx, VerifyOptions::default(), |_| {})?;
    assert!(!report.consistent());
    assert!(report
        .findings
        .iter()
        .any(|f| f.kind == VerifyKind::VersionLogIdInconsistent));

    // The unprotected read path propagates the damage.
    assert!(store.fix_page(&tx, 0, FixMode::Read).is_err());
    registry.end(&tx);
    Ok(())
}

#[test]
fn cancellation_aborts_verification() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&h, 0, 0x44)?;

    h.store.cancel(true);
    let tx = h.registry.begin_read_write(&h.clock);
    match h.store.verify(&tx, VerifyOptions::default(), |_| {}) {
        Err(UmbraError::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    h.store.cancel(false);
    let report = h.store.verify(&tx, VerifyOptions::default(), |_| {})?;
    assert!(report.consistent());
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn abort_on_first_finding_stops_the_run() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;
    h.registry.end(&tx);
    write_page(&h, 0, 0x55)?;
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.flush(&tx)?;
    h.store.unmount(&tx)?;
    h.registry.end(&tx);
    drop(h.store);

    let vlog = dir.path().join("VERSION.SYD");
    let mut file = OpenOptions::new().write(true).open(&vlog).unwrap();
    file.seek(SeekFrom::Start(6 * PAGE_SIZE as u64 + 40)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    file.sync_data().unwrap();
    drop(file);

    let store = VersionFile::attach(
        StorageOptions::new(dir.path()).page_size(PAGE_SIZE),
        h.clock.clone(),
        Arc::new(CheckpointClock::new()),
        h.registry.clone(),
    );
    let tx = h.registry.begin_read_write(&h.clock);
    store.mount(&tx)?;

    let options = VerifyOptions {
        treatment: umbra::Treatment {
            correct: false,
            continue_on_error: false,
        },
        overall: false,
    };
    match store.verify(&tx, options, |_| {}) {
        Err(UmbraError::VerifyAborted(_)) => {}
        other => panic!("expected abort, got {other:?}"),
    }
    h.registry.end(&tx);
    Ok(())
}
