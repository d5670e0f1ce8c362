//! Tests for change notification, error reporting and log redirection
//!
//! These tests verify:
//! - Writes from another handle are picked up and announced
//! - Unregistered listeners stay silent
//! - The registry's error reporter sees integrity failures
//! - Hooks fired while a store opens may call back into the registry
//! - Log lines can be redirected, filtered and silenced
//!
//! Two registries over one root stand in for two processes.

use std::sync::Arc;

use mapkv::{Config, ErrorType, LogLevel, RecoverStrategy, Registry, StoreMode};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn two_registries() -> (TempDir, Registry, Registry) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().root_dir(temp_dir.path()).build();
    let first = Registry::new(config.clone());
    let second = Registry::new(config);
    (temp_dir, first, second)
}

fn change_log(registry: &Registry) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry.register_content_change_listener(move |id: &str| {
        sink.lock().push(id.to_string());
    });
    seen
}

// =============================================================================
// Content Change Tests
// =============================================================================

#[test]
fn test_appends_from_other_handle_are_visible() {
    let (_temp, first, second) = two_registries();
    let a = first.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    let b = second.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();

    a.set_i64("from_a", 1);
    assert_eq!(b.get_i64("from_a", -1), 1);

    b.set_string("from_b", "hello");
    assert_eq!(a.get_string("from_b", ""), "hello");
}

#[test]
fn test_check_content_changed_notifies() {
    let (_temp, first, second) = two_registries();
    let seen = change_log(&first);

    let a = first.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    let b = second.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();

    assert!(!a.check_content_changed());
    assert!(seen.lock().is_empty());

    b.set_bool("flag", true);
    assert!(a.check_content_changed());
    assert_eq!(seen.lock().as_slice(), &["shared".to_string()]);

    // Already reconciled
    assert!(!a.check_content_changed());
    assert_eq!(seen.lock().len(), 1);
    assert!(a.get_bool("flag", false));
}

#[test]
fn test_compaction_by_other_handle_triggers_reload() {
    let (_temp, first, second) = two_registries();
    let a = first.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    let b = second.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();

    for i in 0..10 {
        a.set_i64(&format!("key{}", i), i);
    }
    assert_eq!(b.count(), 10);

    b.remove_many(&["key0", "key1"]);
    assert_eq!(a.count(), 8);
    assert!(!a.contains_key("key0"));

    b.clear_all();
    assert_eq!(a.count(), 0);
    assert_eq!(a.total_size(), 4096);
}

#[test]
fn test_growth_by_other_handle_is_remapped() {
    let (_temp, first, second) = two_registries();
    let a = first.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    let b = second.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    a.set_i64("seed", 1);

    let blob = vec![9u8; 1000];
    for i in 0..40 {
        b.set_bytes(&format!("blob{}", i), &blob);
    }

    assert!(a.total_size() > 4096);
    assert_eq!(a.get_bytes("blob39", &[]), blob);
    assert_eq!(a.get_i64("seed", 0), 1);
}

#[test]
fn test_unregistered_listener_is_silent() {
    let (_temp, first, second) = two_registries();
    let seen = change_log(&first);
    first.unregister_content_change_listener();

    let a = first.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    let b = second.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();

    b.set_i64("n", 5);
    assert!(a.check_content_changed());
    assert!(seen.lock().is_empty());
}

#[test]
fn test_registering_replaces_listener() {
    let (_temp, first, second) = two_registries();
    let old = change_log(&first);
    let new = change_log(&first);

    let a = first.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    let b = second.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();

    b.set_i64("n", 5);
    a.check_content_changed();

    assert!(old.lock().is_empty());
    assert_eq!(new.lock().len(), 1);
}

// =============================================================================
// Error Reporter Tests
// =============================================================================

/// Write two strings under `id`, then flip a content byte
fn write_corrupted(config: &Config, root: &std::path::Path, id: &str) {
    {
        let registry = Registry::new(config.clone());
        let store = registry.resolve(id, StoreMode::SingleProcess, None, None).unwrap();
        store.set_string("a", "one");
        store.set_string("b", "two");
    }

    let path = root.join(id);
    let mut raw = std::fs::read(&path).unwrap();
    raw[4 + 4] ^= 0x20;
    std::fs::write(&path, raw).unwrap();
}

#[test]
fn test_registry_error_reporter() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder().root_dir(temp.path()).build();
    write_corrupted(&config, temp.path(), "fragile");

    let registry = Registry::new(config);
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    registry.register_error_reporter(move |id: &str, kind: ErrorType| {
        sink.lock().push((id.to_string(), kind));
        RecoverStrategy::Discard
    });

    let store = registry.resolve("fragile", StoreMode::SingleProcess, None, None).unwrap();
    assert_eq!(
        reports.lock().as_slice(),
        &[("fragile".to_string(), ErrorType::CrcCheckFail)]
    );
    assert_eq!(store.count(), 0);
}

#[test]
fn test_error_reporter_may_call_into_registry() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder().root_dir(temp.path()).build();
    write_corrupted(&config, temp.path(), "fragile");

    let registry = Arc::new(Registry::new(config));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let weak = Arc::downgrade(&registry);
    registry.register_error_reporter(move |_id: &str, _kind: ErrorType| {
        if let Some(registry) = weak.upgrade() {
            let before = registry.live_count();
            // The store being opened cannot be resolved from its own reporter
            let same = registry
                .resolve("fragile", StoreMode::SingleProcess, None, None)
                .is_err();
            let other = registry
                .resolve("other", StoreMode::SingleProcess, None, None)
                .is_ok();
            sink.lock().push((before, same, other));
        }
        RecoverStrategy::Discard
    });

    let store = registry.resolve("fragile", StoreMode::SingleProcess, None, None).unwrap();
    assert_eq!(seen.lock().as_slice(), &[(0, true, true)]);
    assert_eq!(registry.live_count(), 2);
    assert_eq!(store.count(), 0);
}

#[test]
fn test_log_handler_may_call_into_registry() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(Registry::new(Config::builder().root_dir(temp.path()).build()));
    let counts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&counts);
    let weak = Arc::downgrade(&registry);
    registry.register_log_handler(
        move |_level: LogLevel, _file: &str, _line: u32, _function: &str, _message: &str| {
            if let Some(registry) = weak.upgrade() {
                sink.lock().push(registry.live_count());
            }
        },
    );
    registry.set_log_level(LogLevel::Debug);

    registry.resolve("logged", StoreMode::SingleProcess, None, None).unwrap();
    let counts = counts.lock();
    assert!(!counts.is_empty());
    assert_eq!(counts.last(), Some(&1));
}

// =============================================================================
// Log Redirection Tests
// =============================================================================

type Lines = Arc<Mutex<Vec<(LogLevel, String)>>>;

fn capture_logs(registry: &Registry) -> Lines {
    let lines: Lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    registry.register_log_handler(
        move |level: LogLevel, _file: &str, _line: u32, _function: &str, message: &str| {
            sink.lock().push((level, message.to_string()));
        },
    );
    lines
}

#[test]
fn test_log_handler_receives_engine_lines() {
    let temp = TempDir::new().unwrap();
    let registry = Registry::new(Config::builder().root_dir(temp.path()).build());
    let lines = capture_logs(&registry);

    registry.resolve("logged", StoreMode::SingleProcess, None, None).unwrap();

    let lines = lines.lock();
    assert!(lines
        .iter()
        .any(|(level, msg)| *level == LogLevel::Info && msg.contains("logged")));
}

#[test]
fn test_log_level_filters_and_silences() {
    let temp = TempDir::new().unwrap();
    let registry = Registry::new(Config::builder().root_dir(temp.path()).build());
    let lines = capture_logs(&registry);

    registry.set_log_level(LogLevel::Error);
    registry.resolve("quiet", StoreMode::SingleProcess, None, None).unwrap();
    assert!(lines.lock().is_empty());

    registry.set_log_level(LogLevel::None);
    registry.resolve("", StoreMode::SingleProcess, None, None).unwrap_err();
    registry.resolve("silent", StoreMode::SingleProcess, None, None).unwrap();
    assert!(lines.lock().is_empty());
}

#[test]
fn test_unregistered_log_handler_stops_receiving() {
    let temp = TempDir::new().unwrap();
    let registry = Registry::new(Config::builder().root_dir(temp.path()).build());
    let lines = capture_logs(&registry);
    registry.unregister_log_handler();

    registry.resolve("untracked", StoreMode::SingleProcess, None, None).unwrap();
    assert!(lines.lock().is_empty());
}
