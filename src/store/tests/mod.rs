
use std::time::Duration;

use tempfile::tempdir;

use super::{Store, StoreConfig};

fn small_store(dir: &std::path::Path) -> std::sync::Arc<Store> {
    Store::open(StoreConfig {
        memtable_max_bytes: 256,
        ..StoreConfig::new(dir)
    })
    .unwrap()
}

#[test]
fn s1_basic_overwrite() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    store.put(b"k", b"a").unwrap();
    store.put(b"k", b"b").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"b".to_vec()));
}

#[test]
fn s2_delete_masks_lower_levels() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    store.put(b"k", b"a").unwrap();
    store.flush_memtable().unwrap();
    store.delete(b"k").unwrap();
    assert_eq!(store.get(b"k").unwrap(), None);

    store.compact_level(0).unwrap();
    assert_eq!(store.get(b"k").unwrap(), None);
}

#[test]
fn s3_recovery_replays_wal() {
    let dir = tempdir().unwrap();
    {
        let store = Store::open(StoreConfig::new(dir.path())).unwrap();
        store.put(b"k1", b"v1").unwrap();
        store.put(b"k2", b"v2").unwrap();
        store.delete(b"k3").unwrap();
        store.close().unwrap();
    }
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(store.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(store.get(b"k3").unwrap(), None);
}

#[test]
fn s4_range_yields_ascending_order() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    store.put(b"c", b"3").unwrap();
    store.put(b"a", b"1").unwrap();
    store.put(b"b", b"2").unwrap();

    let results: Vec<_> = store
        .range(None, None)
        .unwrap()
        .map(|(k, v, _)| (k, v))
        .collect();
    assert_eq!(
        results,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );
}

#[test]
fn s7_compaction_dedups_and_keeps_latest() {
    let dir = tempdir().unwrap();
    let store = small_store(dir.path());
    for i in 0..50 {
        store.put(b"k", format!("v{i}").as_bytes()).unwrap();
        if i % 10 == 0 {
            store.flush_memtable().unwrap();
        }
    }
    store.flush_memtable().unwrap();

    store.compact_level(0).unwrap();

    assert_eq!(store.get(b"k").unwrap(), Some(b"v49".to_vec()));
    assert!(store.catalog_snapshot(0).is_empty());
}

#[test]
fn s8_empty_value_is_not_a_tombstone() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    store.put(b"k", b"").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(Vec::new()));

    store.delete(b"k").unwrap();
    assert_eq!(store.get(b"k").unwrap(), None);
}

#[test]
fn flush_on_empty_memtable_is_a_no_op() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    store.flush_memtable().unwrap();
    assert!(store.catalog_snapshot(0).is_empty());
}

#[test]
fn get_with_meta_reports_the_winning_timestamp() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    store.put(b"k", b"a").unwrap();
    store.put(b"k", b"b").unwrap();
    let (value, ts1) = store.get_with_meta(b"k").unwrap().unwrap();
    assert_eq!(value, Some(b"b".to_vec()));

    store.flush_memtable().unwrap();
    let (value, ts2) = store.get_with_meta(b"k").unwrap().unwrap();
    assert_eq!(value, Some(b"b".to_vec()));
    assert_eq!(ts1, ts2);
}

#[test]
fn crash_recovery_with_flush_every_write() {
    let dir = tempdir().unwrap();
    {
        let store = Store::open(StoreConfig::new(dir.path())).unwrap();
        store.put(b"durable", b"yes").unwrap();
    }
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    assert_eq!(store.get(b"durable").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn flush_rotates_wal_and_installs_l0_sstable() {
    let dir = tempdir().unwrap();
    let store = small_store(dir.path());
    for i in 0..20u32 {
        store.put(format!("k{i:03}").as_bytes(), b"value").unwrap();
    }
    assert!(!store.catalog_snapshot(0).is_empty());
    for i in 0..20u32 {
        assert_eq!(
            store.get(format!("k{i:03}").as_bytes()).unwrap(),
            Some(b"value".to_vec())
        );
    }
}

#[test]
fn compact_level_on_empty_level_is_a_no_op() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    store.compact_level(0).unwrap();
}

#[test]
fn tombstone_retention_keeps_delete_visible_across_compaction() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig {
        tombstone_retention_seconds: 1_000_000,
        ..StoreConfig::new(dir.path())
    })
    .unwrap();
    store.put(b"k", b"a").unwrap();
    store.flush_memtable().unwrap();
    store.delete(b"k").unwrap();
    store.flush_memtable().unwrap();

    store.compact_level(0).unwrap();
    assert_eq!(store.get(b"k").unwrap(), None);
}

#[test]
fn wait_for_compaction_times_out_on_unknown_job() {
    use super::async_driver::AsyncCompactionDriver;

    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let driver = AsyncCompactionDriver::spawn(store);
    assert!(!driver.wait_for_compaction(9999, Some(Duration::from_millis(10))));
    driver.shutdown(Duration::from_secs(1));
}
