//! Tests for concurrent access
//!
//! These tests verify:
//! - Racing writers to one key leave exactly one of their values
//! - Many threads writing distinct keys lose nothing, including across growth
//! - Readers never observe a partial value
//! - Two handles on one multi-process store interleave safely

use std::sync::Arc;
use std::thread;

use mapkv::{Config, Registry, Store, StoreMode};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store(mode: StoreMode) -> (TempDir, Registry, Arc<Store>) {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::new(Config::builder().root_dir(temp_dir.path()).build());
    let store = registry.resolve("concurrent", mode, None, None).unwrap();
    (temp_dir, registry, store)
}

// =============================================================================
// In-Process Tests
// =============================================================================

#[test]
fn test_racing_writers_leave_one_value() {
    let (_temp, _registry, store) = setup_store(StoreMode::SingleProcess);

    thread::scope(|s| {
        for value in [1i64, 2] {
            let store = &store;
            s.spawn(move || {
                for _ in 0..500 {
                    assert!(store.set_i64("k", value));
                }
            });
        }
    });

    let last = store.get_i64("k", 0);
    assert!(last == 1 || last == 2);
}

#[test]
fn test_distinct_keys_from_many_threads() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder().root_dir(temp.path()).build();
    {
        let registry = Registry::new(config.clone());
        let store = registry.resolve("many", StoreMode::SingleProcess, None, None).unwrap();

        thread::scope(|s| {
            for t in 0..8 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..100 {
                        assert!(store.set_string(&format!("t{}-k{}", t, i), "some value"));
                    }
                });
            }
        });

        assert_eq!(store.count(), 800);
        assert!(store.total_size() > 4096);
    }

    let registry = Registry::new(config);
    let store = registry.resolve("many", StoreMode::SingleProcess, None, None).unwrap();
    assert_eq!(store.count(), 800);
    assert_eq!(store.get_string("t7-k99", ""), "some value");
}

#[test]
fn test_readers_never_see_partial_values() {
    let (_temp, _registry, store) = setup_store(StoreMode::SingleProcess);
    let short = "s".to_string();
    let long = "l".repeat(300);
    store.set_string("v", &short);

    thread::scope(|s| {
        let writer_store = &store;
        let (short, long) = (&short, &long);
        s.spawn(move || {
            for i in 0..300 {
                let value = if i % 2 == 0 { long } else { short };
                writer_store.set_string("v", value);
            }
        });

        for _ in 0..2 {
            let reader_store = &store;
            s.spawn(move || {
                for _ in 0..300 {
                    let seen = reader_store.get_string("v", "");
                    assert!(seen == *short || seen == *long, "torn value of {} bytes", seen.len());
                }
            });
        }
    });
}

// =============================================================================
// Multi-Process Tests
// =============================================================================

#[test]
fn test_two_handles_interleave_writes() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder().root_dir(temp.path()).build();
    let first = Registry::new(config.clone());
    let second = Registry::new(config);

    let a = first.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    let b = second.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();

    thread::scope(|s| {
        for (name, store) in [("a", &a), ("b", &b)] {
            s.spawn(move || {
                for i in 0..200 {
                    assert!(store.set_i64(&format!("{}{}", name, i), i));
                }
            });
        }
    });

    for store in [&a, &b] {
        assert_eq!(store.count(), 400);
        assert_eq!(store.get_i64("a199", -1), 199);
        assert_eq!(store.get_i64("b0", -1), 0);
    }
}

#[test]
fn test_handle_sees_removals_from_other_handle() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder().root_dir(temp.path()).build();
    let first = Registry::new(config.clone());
    let second = Registry::new(config);

    let a = first.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();
    let b = second.resolve("shared", StoreMode::MultiProcess, None, None).unwrap();

    a.set_i64("gone", 1);
    a.set_i64("kept", 2);
    assert!(b.remove("gone"));

    assert!(!a.contains_key("gone"));
    assert_eq!(a.get_i64("kept", 0), 2);
}
