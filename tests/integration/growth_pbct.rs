#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use umbra::{
    CheckpointClock, FixMode, Result, StorageOptions, TimeStampSource, TransactionRegistry,
    VersionFile, VerifyOptions,
};

// A small block size keeps tree fan-outs low so depth growth is cheap
// to provoke.
const PAGE_SIZE: usize = 512;

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
        StorageOptions::new(dir).page_size(PAGE_SIZE).cache_blocks(512),
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

fn fill_for(page: u32) -> u8 {
    (page % 251) as u8
}

#[test]
fn tree_depth_grows_by_at_most_one_per_write() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;

    let total: u32 = 2_000;
    let mut last_level: Option<u32> = None;
    for page in 0..total {
        let mut image = h.store.fix_page(&tx, page, FixMode::Write)?;
        let fill = fill_for(page);
        image.content_mut()?.fill(fill);
        h.store.unfix_page(image, true)?;

        let level = h.store.pbct_level()?;
        match (last_level, level) {
            (None, Some(l)) => assert!(l <= 1, "fresh tree jumped to level {l}"),
            (Some(prev), Some(now)) => {
                assert!(now >= prev, "tree depth shrank during growth");
                assert!(now - prev <= 1, "tree depth jumped from {prev} to {now}");
            }
            (_, None) => panic!("tree vanished while pages were being written"),
        }
        last_level = level;
    }
    assert!(last_level.unwrap() >= 1, "test never left the root leaf");

    // Every written image is recoverable.
    for page in (0..total).step_by(97).chain([0, total - 1]) {
        let image = h.store.fix_page(&tx, page, FixMode::Read)?;
        let fill = fill_for(page);
        assert!(
            image.content().iter().all(|b| *b == fill),
            "page {page} lost its image"
        );
    }
    assert_eq!(h.store.page_count()?, total);
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn grown_store_passes_full_verification() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;

    for page in 0..300u32 {
        let mut image = h.store.fix_page(&tx, page, FixMode::Write)?;
        image.content_mut()?.fill(fill_for(page));
        h.store.unfix_page(image, true)?;
    }
    h.store.flush(&tx)?;

    let options = VerifyOptions {
        overall: true,
        ..VerifyOptions::default()
    };
    let mut streamed = 0usize;
    let report = h.store.verify(&tx, options, |_| streamed += 1)?;
    assert!(
        report.consistent(),
        "unexpected findings: {:?}",
        report.findings
    );
    assert_eq!(streamed, report.findings.len());
    h.registry.end(&tx);
    Ok(())
}

#[test]
fn sparse_page_ids_grow_the_tree_eagerly() -> Result<()> {
    let dir = tempdir().unwrap();
    let h = open_store(dir.path());
    let tx = h.registry.begin_read_write(&h.clock);
    h.store.create(&tx, 0)?;

    // Jump straight to a high page id: the tree must reach the level
    // that addresses it in one allocation.
    let far: u32 = 10_000;
    let mut image = h.store.fix_page(&tx, far, FixMode::Write)?;
    image.content_mut()?.fill(0x5A);
    h.store.unfix_page(image, true)?;

    assert!(h.store.pbct_level()?.unwrap_or(0) >= 2);
    assert_eq!(h.store.page_count()?, far + 1);

    let image = h.store.fix_page(&tx, far, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0x5A));

    // Intermediate pages exist but have never been written; they read
    // as the empty master image.
    let image = h.store.fix_page(&tx, far / 2, FixMode::Read)?;
    assert!(image.content().iter().all(|b| *b == 0));
    h.registry.end(&tx);
    Ok(())
}
