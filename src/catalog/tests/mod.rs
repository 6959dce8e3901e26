use tempfile::tempdir;

use super::Catalog;
use crate::sstable::SstableDescriptor;

fn descriptor(name: &str, min: &[u8], max: &[u8]) -> SstableDescriptor {
    SstableDescriptor {
        data_path: format!("/tmp/{name}.data").into(),
        meta_path: format!("/tmp/{name}.meta").into(),
        min_key: Some(min.to_vec()),
        max_key: Some(max.to_vec()),
        min_ts: Some(1),
        max_ts: Some(2),
        count: 1,
        data_size: 100,
        index: vec![],
    }
}

#[test]
fn missing_file_is_empty_catalog() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path(), 6).unwrap();
    assert!(catalog.list_level(0).is_empty());
}

#[test]
fn add_then_reopen_round_trips() {
    let dir = tempdir().unwrap();
    {
        let catalog = Catalog::open(dir.path(), 6).unwrap();
        catalog.add_sstable(0, descriptor("a", b"a", b"c")).unwrap();
        catalog.add_sstable(0, descriptor("b", b"d", b"f")).unwrap();
    }
    let catalog = Catalog::open(dir.path(), 6).unwrap();
    let level0 = catalog.list_level(0);
    assert_eq!(level0.len(), 2);
    assert_eq!(level0[0].data_path, std::path::Path::new("/tmp/a.data"));
    assert_eq!(level0[1].data_path, std::path::Path::new("/tmp/b.data"));
}

#[test]
fn malformed_file_is_fatal() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("catalog.json"), b"not json").unwrap();
    let err = Catalog::open(dir.path(), 6).unwrap_err();
    assert!(matches!(err, super::CatalogError::Malformed(_)));
}

#[test]
fn malformed_hex_key_is_fatal_not_a_panic() {
    let dir = tempdir().unwrap();
    let json = r#"{"0":[{"data_path":"/tmp/a.data","meta_path":"/tmp/a.meta","min_key":"zz","max_key":"61","min_ts":1,"max_ts":2,"count":1,"data_size":100,"index":[]}]}"#;
    std::fs::write(dir.path().join("catalog.json"), json).unwrap();
    let err = Catalog::open(dir.path(), 6).unwrap_err();
    assert!(matches!(err, super::CatalogError::Malformed(_)));
}

#[test]
fn remove_sstables_matches_by_data_path() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path(), 6).unwrap();
    catalog.add_sstable(0, descriptor("a", b"a", b"c")).unwrap();
    catalog.add_sstable(0, descriptor("b", b"d", b"f")).unwrap();
    catalog
        .remove_sstables(&[descriptor("a", b"a", b"c")])
        .unwrap();
    let level0 = catalog.list_level(0);
    assert_eq!(level0.len(), 1);
    assert_eq!(level0[0].data_path, std::path::Path::new("/tmp/b.data"));
}

#[test]
fn install_compaction_result_is_atomic_add_and_remove() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path(), 6).unwrap();
    catalog.add_sstable(0, descriptor("a", b"a", b"c")).unwrap();
    catalog.add_sstable(0, descriptor("b", b"d", b"f")).unwrap();

    catalog
        .install_compaction_result(
            1,
            vec![descriptor("merged", b"a", b"f")],
            &[descriptor("a", b"a", b"c"), descriptor("b", b"d", b"f")],
        )
        .unwrap();

    assert!(catalog.list_level(0).is_empty());
    let level1 = catalog.list_level(1);
    assert_eq!(level1.len(), 1);
    assert_eq!(level1[0].data_path, std::path::Path::new("/tmp/merged.data"));
}

#[test]
fn list_level_returns_a_clone_not_a_live_view() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path(), 6).unwrap();
    catalog.add_sstable(0, descriptor("a", b"a", b"c")).unwrap();
    let snapshot = catalog.list_level(0);
    catalog.add_sstable(0, descriptor("b", b"d", b"f")).unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(catalog.list_level(0).len(), 2);
}

#[test]
fn out_of_range_level_in_file_is_ignored() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("catalog.json"),
        br#"{"0": [], "99": []}"#,
    )
    .unwrap();
    let catalog = Catalog::open(dir.path(), 6).unwrap();
    assert!(catalog.list_level(0).is_empty());
}
