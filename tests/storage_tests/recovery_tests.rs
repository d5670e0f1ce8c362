//! Tests for Page Store recovery
//!
//! These tests verify:
//! - Torn appends roll back silently (header/meta disagreement)
//! - CRC failures reach the error reporter; Discard is the default
//! - Recover keeps the longest well-formed prefix
//! - FileLength failures (recorded size beyond the file)
//! - Staging files are rolled forward when valid, dropped when not
//! - A stage left by a crashed multi-process writer is applied before the
//!   next write, so later writes survive reopen

use std::fs::OpenOptions as FsOpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use mapkv::codec::{encode_record, Encode};
use mapkv::config::StoreMode;
use mapkv::notify::{ErrorType, Handlers, RecoverStrategy};
use mapkv::storage::{MetaFile, MetaInfo, OpenOptions, PageStore, StagedWrite, StorePaths};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// `k0`..`k4` holding i64 values: every record is 18 bytes
const RECORD_LEN: usize = 4 + 2 + 4 + 8;

type Reports = Arc<Mutex<Vec<(String, ErrorType)>>>;

fn handlers_with(strategy: RecoverStrategy) -> (Arc<Handlers>, Reports) {
    let handlers = Arc::new(Handlers::default());
    let reports: Reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    handlers.set_error_reporter(Some(Arc::new(move |id: &str, kind: ErrorType| {
        sink.lock().push((id.to_string(), kind));
        strategy
    })));
    (handlers, reports)
}

fn open_with(root: &Path, handlers: Arc<Handlers>) -> PageStore {
    PageStore::open_in_dir(
        root,
        OpenOptions {
            mmap_id: "store".to_string(),
            mode: StoreMode::SingleProcess,
            page_size: 4096,
            crypter: None,
            handlers,
        },
    )
    .unwrap()
}

fn open_multi(root: &Path) -> PageStore {
    PageStore::open_in_dir(
        root,
        OpenOptions {
            mmap_id: "store".to_string(),
            mode: StoreMode::MultiProcess,
            page_size: 4096,
            crypter: None,
            handlers: Arc::new(Handlers::default()),
        },
    )
    .unwrap()
}

/// Stage `content` as the generation after the one currently on disk
fn plant_stage(root: &Path, content: Vec<u8>, sequence_step: u32) {
    let meta_file = MetaFile::open(&paths(root).meta).unwrap();
    let current = meta_file.read().unwrap();
    drop(meta_file);

    let crc = crc32fast::hash(&content);
    let staged = StagedWrite {
        meta: MetaInfo {
            crc_digest: crc,
            actual_size: content.len() as u64,
            last_confirmed_size: content.len() as u64,
            last_confirmed_crc: crc,
            ..MetaInfo::fresh(current.sequence + sequence_step, current.iv)
        },
        content,
    };
    staged.persist(&paths(root).stage).unwrap();
}

fn populate(root: &Path) {
    let mut store = open_with(root, Arc::new(Handlers::default()));
    for i in 0..5i64 {
        store.set(&format!("k{}", i), &i.encode()).unwrap();
    }
    store.close().unwrap();
}

fn paths(root: &Path) -> StorePaths {
    StorePaths::new(root, "store")
}

fn write_at(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = FsOpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

fn rewrite_meta(root: &Path, edit: impl FnOnce(&mut MetaInfo)) {
    let meta_file = MetaFile::open(&paths(root).meta).unwrap();
    let mut meta = meta_file.read().unwrap();
    edit(&mut meta);
    meta_file.write(&meta).unwrap();
}

fn keys(store: &mut PageStore) -> Vec<String> {
    let mut keys = store.keys().unwrap();
    keys.sort();
    keys
}

// =============================================================================
// Torn Write Tests
// =============================================================================

#[test]
fn test_header_ahead_of_meta_rolls_back() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    // Record bytes and header written, meta not: header claims more
    let header = (5 * RECORD_LEN + RECORD_LEN) as u32;
    write_at(&paths(temp.path()).data, 0, &header.to_le_bytes());

    let (handlers, reports) = handlers_with(RecoverStrategy::Discard);
    let mut store = open_with(temp.path(), handlers);

    assert!(reports.lock().is_empty());
    assert_eq!(store.count().unwrap(), 5);
    assert_eq!(store.actual_size(), (5 * RECORD_LEN) as u64);
}

#[test]
fn test_meta_ahead_of_header_is_accepted() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    // Meta written, header still at the previous size
    let header = (4 * RECORD_LEN) as u32;
    write_at(&paths(temp.path()).data, 0, &header.to_le_bytes());

    let (handlers, reports) = handlers_with(RecoverStrategy::Discard);
    let mut store = open_with(temp.path(), handlers);

    assert!(reports.lock().is_empty());
    assert_eq!(store.count().unwrap(), 5);
}

#[test]
fn test_torn_last_record_rolls_back_to_confirmed() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    // Last record's value never reached the disk
    let last_value = 4 + 4 * RECORD_LEN + 10;
    write_at(&paths(temp.path()).data, last_value as u64, &[0xee; 8]);

    let (handlers, reports) = handlers_with(RecoverStrategy::Discard);
    let mut store = open_with(temp.path(), handlers);

    assert!(reports.lock().is_empty());
    assert_eq!(keys(&mut store), vec!["k0", "k1", "k2", "k3"]);
}

// =============================================================================
// Error Reporter Tests
// =============================================================================

#[test]
fn test_crc_failure_defaults_to_discard() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    write_at(&paths(temp.path()).data, 4 + 5, &[b'X']);

    // No reporter registered
    let mut store = open_with(temp.path(), Arc::new(Handlers::default()));
    assert_eq!(store.count().unwrap(), 0);
    assert_eq!(store.total_size().unwrap(), 4096);
}

#[test]
fn test_crc_failure_is_reported() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    write_at(&paths(temp.path()).data, 4 + 5, &[b'X']);

    let (handlers, reports) = handlers_with(RecoverStrategy::Discard);
    let mut store = open_with(temp.path(), handlers);

    assert_eq!(
        reports.lock().as_slice(),
        &[("store".to_string(), ErrorType::CrcCheckFail)]
    );
    assert_eq!(store.count().unwrap(), 0);
}

#[test]
fn test_unrecognized_strategy_maps_to_discard() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    write_at(&paths(temp.path()).data, 4 + 5, &[b'X']);

    let (handlers, _) = handlers_with(RecoverStrategy::from_raw(-1));
    let mut store = open_with(temp.path(), handlers);
    assert_eq!(store.count().unwrap(), 0);
}

#[test]
fn test_recover_keeps_well_formed_prefix() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    // Break the key length of the third record
    let third = 4 + 2 * RECORD_LEN;
    write_at(&paths(temp.path()).data, third as u64, &[0xff, 0xff, 0xff, 0x7f]);

    {
        let (handlers, reports) = handlers_with(RecoverStrategy::Recover);
        let mut store = open_with(temp.path(), handlers);

        assert_eq!(reports.lock().len(), 1);
        assert_eq!(keys(&mut store), vec!["k0", "k1"]);
        store.close().unwrap();
    }

    // The rewritten files are clean
    assert!(PageStore::is_file_valid(&paths(temp.path())).unwrap());
    let (handlers, reports) = handlers_with(RecoverStrategy::Discard);
    let mut store = open_with(temp.path(), handlers);
    assert!(reports.lock().is_empty());
    assert_eq!(store.count().unwrap(), 2);
}

#[test]
fn test_file_length_failure() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    write_at(&paths(temp.path()).data, 0, &0x00ff_ffffu32.to_le_bytes());
    rewrite_meta(temp.path(), |meta| {
        meta.actual_size = 0x00ff_ffff;
        meta.last_confirmed_size = 0x00ff_ffff;
    });
    assert!(!PageStore::is_file_valid(&paths(temp.path())).unwrap());

    let (handlers, reports) = handlers_with(RecoverStrategy::Recover);
    let mut store = open_with(temp.path(), handlers);

    assert_eq!(
        reports.lock().as_slice(),
        &[("store".to_string(), ErrorType::FileLength)]
    );
    // Recovery clamps to the file and keeps every intact record
    assert_eq!(store.count().unwrap(), 5);
}

// =============================================================================
// Staging Tests
// =============================================================================

#[test]
fn test_valid_staging_is_rolled_forward() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    let meta_file = MetaFile::open(&paths(temp.path()).meta).unwrap();
    let current = meta_file.read().unwrap();
    drop(meta_file);

    let content = encode_record("staged", &99i64.encode()).to_vec();
    let crc = crc32fast::hash(&content);
    let staged = StagedWrite {
        meta: MetaInfo {
            crc_digest: crc,
            actual_size: content.len() as u64,
            last_confirmed_size: content.len() as u64,
            last_confirmed_crc: crc,
            ..MetaInfo::fresh(current.sequence + 1, current.iv)
        },
        content,
    };
    staged.persist(&paths(temp.path()).stage).unwrap();

    let mut store = open_with(temp.path(), Arc::new(Handlers::default()));
    assert_eq!(keys(&mut store), vec!["staged"]);
    assert_eq!(store.sequence(), current.sequence + 1);
    assert!(!paths(temp.path()).stage.exists());
}

#[test]
fn test_torn_staging_is_dropped() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    std::fs::write(&paths(temp.path()).stage, b"MKST garbage").unwrap();

    let mut store = open_with(temp.path(), Arc::new(Handlers::default()));
    assert_eq!(store.count().unwrap(), 5);
    assert!(!paths(temp.path()).stage.exists());
}

#[test]
fn test_stale_staging_is_dropped() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    plant_stage(temp.path(), encode_record("old", &1i64.encode()).to_vec(), 3);

    let mut store = open_with(temp.path(), Arc::new(Handlers::default()));
    assert_eq!(store.count().unwrap(), 5);
    assert!(!store.contains("old").unwrap());
    assert!(!paths(temp.path()).stage.exists());
}

#[test]
fn test_crashed_writer_stage_applied_before_next_write() {
    let temp = TempDir::new().unwrap();
    let mut a = open_multi(temp.path());
    let mut b = open_multi(temp.path());

    a.set("a", &1i64.encode()).unwrap();
    assert!(b.contains("a").unwrap());

    // Another process staged a rewrite of the current content and died
    plant_stage(temp.path(), encode_record("a", &1i64.encode()).to_vec(), 1);

    b.set("b", &2i64.encode()).unwrap();
    assert_eq!(b.get("b").unwrap(), Some(&2i64.encode()[..]));
    assert!(!paths(temp.path()).stage.exists());

    a.set("c", &3i64.encode()).unwrap();
    assert!(a.check_content_changed().unwrap());
    a.close().unwrap();
    b.close().unwrap();

    let mut reopened = open_with(temp.path(), Arc::new(Handlers::default()));
    assert_eq!(keys(&mut reopened), vec!["a", "b", "c"]);
    assert_eq!(reopened.get("b").unwrap(), Some(&2i64.encode()[..]));
}
