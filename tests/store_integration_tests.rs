//! Integration Tests for the Store API
//!
//! Exercises full operations against a real log and cache segment in a
//! temporary directory.

use std::collections::HashSet;
use std::time::Duration;

use kvdb::cache::SharedCache;
use kvdb::lock::{Guarded, ProcessLock};
use kvdb::{Config, KvError, Source, Store};
use proptest::prelude::*;
use tempfile::{tempdir, TempDir};

// == Helper Functions ==

fn test_config(dir: &TempDir, capacity: usize) -> Config {
    let mut config = Config::in_dir(dir.path());
    config.cache_capacity = capacity;
    config.lock_timeout = Duration::from_secs(2);
    config
}

fn open(dir: &TempDir) -> Store {
    Store::open(test_config(dir, 16)).unwrap()
}

// == Scenario ==

#[test]
fn test_apple_lifecycle() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir);

    store.set("apple", "1").unwrap();
    assert_eq!(store.get("apple").unwrap().value, "1");
    let before = store.timestamps("apple").unwrap().value;

    std::thread::sleep(Duration::from_millis(1100));
    store.set("apple", "2").unwrap();
    assert_eq!(store.get("apple").unwrap().value, "2");

    let after = store.timestamps("apple").unwrap().value;
    assert_eq!(after.first_set, before.first_set);
    assert!(after.last_set > before.last_set);

    assert!(store.delete("apple").unwrap());
    assert!(matches!(store.get("apple"), Err(KvError::KeyNotFound(_))));
}

// == Cross-handle coherence ==
// Separate Store handles behave like separate processes: own descriptors,
// own mappings, same files.

#[test]
fn test_write_visible_to_other_handle() {
    let dir = tempdir().unwrap();
    let mut writer = open(&dir);
    let mut reader = open(&dir);

    writer.set("k", "v1").unwrap();
    assert_eq!(reader.get("k").unwrap().value, "v1");

    writer.set("k", "v2").unwrap();
    let found = reader.get("k").unwrap();
    assert_eq!(found.value, "v2");
    assert_eq!(found.source, Source::Cache);
}

#[test]
fn test_delete_visible_to_other_handle() {
    let dir = tempdir().unwrap();
    let mut a = open(&dir);
    let mut b = open(&dir);

    a.set("k", "v").unwrap();
    assert_eq!(b.get("k").unwrap().value, "v");

    b.delete("k").unwrap();
    assert!(matches!(a.get("k"), Err(KvError::KeyNotFound(_))));

    let mut cache = SharedCache::attach(
        test_config(&dir, 16).cache_path(),
        16,
        Duration::from_secs(1),
    )
    .unwrap();
    assert!(cache.lookup("k").unwrap().is_none());
}

#[test]
fn test_failed_cache_update_is_seen_by_other_handle() {
    let dir = tempdir().unwrap();
    let mut config = test_config(&dir, 16);
    config.lock_timeout = Duration::from_millis(200);
    let mut writer = Store::open(config.clone()).unwrap();
    let mut reader = Store::open(config.clone()).unwrap();

    writer.set("k", "v").unwrap();
    assert_eq!(reader.get("k").unwrap().source, Source::Cache);

    {
        let cache_lock = ProcessLock::open(config.cache_path(), Guarded::Cache).unwrap();
        let _held = cache_lock.acquire(Duration::from_millis(100)).unwrap();
        assert!(writer.delete("k").is_err());
    }

    assert!(matches!(reader.get("k"), Err(KvError::KeyNotFound(_))));
    assert!(reader.dump().unwrap().is_empty());
}

// == Stores sharing a cache directory ==

#[test]
fn test_stores_in_different_dirs_do_not_share_entries() {
    let cache_dir = tempdir().unwrap();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let config = |dir: &TempDir| {
        let mut config = test_config(dir, 16);
        config.cache_dir = cache_dir.path().to_path_buf();
        config
    };

    let mut a = Store::open(config(&dir_a)).unwrap();
    let mut b = Store::open(config(&dir_b)).unwrap();

    a.set("k", "from-a").unwrap();
    assert!(matches!(b.get("k"), Err(KvError::KeyNotFound(_))));

    b.set("k", "from-b").unwrap();
    assert_eq!(a.get("k").unwrap().value, "from-a");
    assert_eq!(b.get("k").unwrap().value, "from-b");

    assert_eq!(a.cache_stats().unwrap().total_entries, 1);
    assert_eq!(b.cache_stats().unwrap().total_entries, 1);
}

#[test]
fn test_log_survives_cache_reset() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir);
    store.set("k", "v").unwrap();
    store.reset_cache().unwrap();

    let mut other = open(&dir);
    let found = other.get("k").unwrap();
    assert_eq!(found.value, "v");
    assert_eq!(found.source, Source::Log);
}

#[test]
fn test_lru_eviction_through_store() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(test_config(&dir, 3)).unwrap();

    for key in ["a", "b", "c"] {
        store.set(key, key).unwrap();
    }
    // Touch "a" so "b" becomes the eviction candidate
    store.get("a").unwrap();
    store.set("d", "d").unwrap();

    let mut cache = SharedCache::attach(
        test_config(&dir, 3).cache_path(),
        3,
        Duration::from_secs(1),
    )
    .unwrap();
    assert_eq!(cache.keys_by_recency().unwrap(), vec!["d", "a", "c"]);

    // Evicted keys are still served from the log
    let found = store.get("b").unwrap();
    assert_eq!(found.source, Source::Log);
}

#[test]
fn test_threads_never_duplicate_a_key() {
    let dir = tempdir().unwrap();
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let config = test_config(&dir, 16);
            std::thread::spawn(move || {
                let mut store = Store::open(config).unwrap();
                for i in 0..25 {
                    store.set("shared", &format!("{}-{}", t, i)).unwrap();
                    store.set(&format!("own-{}", t), &i.to_string()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = open(&dir);
    let records = store.dump().unwrap();
    assert_eq!(records.len(), 5);
    let keys: HashSet<_> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys.len(), 5);
}

// == Property Tests ==

#[derive(Debug, Clone)]
enum Op {
    Set(String, String),
    Get(String),
    Delete(String),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = "[a-d]";
    prop_oneof![
        3 => (key, "[a-z0-9]{0,8}").prop_map(|(k, v)| Op::Set(k, v)),
        2 => key.prop_map(Op::Get),
        1 => key.prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // After any operation sequence, reads agree with a map model, the log
    // holds at most one record per key, and first_set <= last_set.
    #[test]
    fn prop_store_matches_map_model(ops in prop::collection::vec(op_strategy(), 1..30)) {
        let dir = tempdir().unwrap();
        let mut store = Store::open(test_config(&dir, 2)).unwrap();
        let mut model = std::collections::HashMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    store.set(&k, &v).unwrap();
                    model.insert(k, v);
                }
                Op::Get(k) => {
                    let got = store.get(&k).ok().map(|f| f.value);
                    prop_assert_eq!(got, model.get(&k).cloned());
                }
                Op::Delete(k) => {
                    let removed = store.delete(&k).unwrap();
                    prop_assert_eq!(removed, model.remove(&k).is_some());
                }
            }
        }

        let records = store.dump().unwrap();
        let keys: HashSet<_> = records.iter().map(|r| r.key.clone()).collect();
        prop_assert_eq!(keys.len(), records.len());
        prop_assert_eq!(records.len(), model.len());
        for record in &records {
            prop_assert!(record.first_set <= record.last_set);
            prop_assert_eq!(Some(&record.value), model.get(&record.key));
        }
    }
}
