use tempfile::tempdir;

use super::{compact, CompactionOptions};
use crate::sstable::{SstableDescriptor, SstableReader, SstableWriter};

fn build_sstable(
    dir: &std::path::Path,
    name: &str,
    records: &[(&[u8], Option<&[u8]>, u64)],
) -> SstableDescriptor {
    let data_path = dir.join(format!("{name}.data"));
    let meta_path = dir.join(format!("{name}.meta"));
    let mut writer = SstableWriter::create(&data_path, &meta_path, 0.01).unwrap();
    for (k, v, ts) in records {
        writer.add(k, *v, *ts).unwrap();
    }
    writer.finalize().unwrap()
}

fn default_options(dir: &std::path::Path) -> CompactionOptions {
    CompactionOptions {
        output_dir: dir.to_path_buf(),
        target_level: 1,
        sstable_max_bytes: 64 * 1024 * 1024,
        bloom_false_positive_rate: 0.01,
        tombstone_retention_seconds: 86_400,
        now_millis: 1_000_000,
        next_sstable_id: 1,
    }
}

fn get_all(descriptors: &[SstableDescriptor]) -> Vec<(Vec<u8>, Option<Vec<u8>>, u64)> {
    let mut out = Vec::new();
    for d in descriptors {
        let mut reader = SstableReader::open(&d.meta_path).unwrap();
        for rec in reader.iter_range(None, None).unwrap() {
            out.push(rec.unwrap());
        }
    }
    out
}

#[test]
fn no_inputs_produces_no_outputs() {
    let dir = tempdir().unwrap();
    let opts = default_options(dir.path());
    let out = compact(&[], &opts).unwrap();
    assert!(out.is_empty());
}

#[test]
fn dedups_keeping_highest_timestamp() {
    let dir = tempdir().unwrap();
    let a = build_sstable(dir.path(), "a", &[(b"k", Some(b"old"), 1)]);
    let b = build_sstable(dir.path(), "b", &[(b"k", Some(b"new"), 2)]);
    let opts = default_options(dir.path());
    let out = compact(&[a, b], &opts).unwrap();
    let records = get_all(&out);
    assert_eq!(records, vec![(b"k".to_vec(), Some(b"new".to_vec()), 2)]);
}

#[test]
fn merges_disjoint_keys_in_ascending_order() {
    let dir = tempdir().unwrap();
    let a = build_sstable(dir.path(), "a", &[(b"a", Some(b"1"), 1), (b"c", Some(b"3"), 3)]);
    let b = build_sstable(dir.path(), "b", &[(b"b", Some(b"2"), 2)]);
    let opts = default_options(dir.path());
    let out = compact(&[a, b], &opts).unwrap();
    let records = get_all(&out);
    assert_eq!(
        records,
        vec![
            (b"a".to_vec(), Some(b"1".to_vec()), 1),
            (b"b".to_vec(), Some(b"2".to_vec()), 2),
            (b"c".to_vec(), Some(b"3".to_vec()), 3),
        ]
    );
}

#[test]
fn fresh_tombstone_is_retained() {
    let dir = tempdir().unwrap();
    let a = build_sstable(dir.path(), "a", &[(b"k", None, 999_000)]);
    let mut opts = default_options(dir.path());
    opts.now_millis = 1_000_000;
    opts.tombstone_retention_seconds = 86_400;
    let out = compact(&[a], &opts).unwrap();
    let records = get_all(&out);
    assert_eq!(records, vec![(b"k".to_vec(), None, 999_000)]);
}

#[test]
fn expired_tombstone_is_dropped() {
    let dir = tempdir().unwrap();
    let a = build_sstable(dir.path(), "a", &[(b"k", None, 0)]);
    let mut opts = default_options(dir.path());
    opts.now_millis = 1_000 * 86_401 * 1000; // far past retention
    opts.tombstone_retention_seconds = 86_400;
    let out = compact(&[a], &opts).unwrap();
    assert!(out.is_empty() || get_all(&out).is_empty());
}

#[test]
fn tombstone_wins_over_older_value() {
    let dir = tempdir().unwrap();
    let a = build_sstable(dir.path(), "a", &[(b"k", Some(b"v"), 1)]);
    let b = build_sstable(dir.path(), "b", &[(b"k", None, 2)]);
    let opts = default_options(dir.path());
    let out = compact(&[a, b], &opts).unwrap();
    let records = get_all(&out);
    assert_eq!(records, vec![(b"k".to_vec(), None, 2)]);
}

#[test]
fn output_shards_once_size_cap_is_reached() {
    let dir = tempdir().unwrap();
    let records: Vec<(Vec<u8>, Option<Vec<u8>>, u64)> = (0..50u32)
        .map(|i| (format!("k{i:05}").into_bytes(), Some(vec![0u8; 200]), i as u64))
        .collect();
    let owned: Vec<(&[u8], Option<&[u8]>, u64)> = records
        .iter()
        .map(|(k, v, ts)| (k.as_slice(), v.as_deref(), *ts))
        .collect();
    let a = build_sstable(dir.path(), "a", &owned);

    let mut opts = default_options(dir.path());
    opts.sstable_max_bytes = 1000; // force multiple shards
    let out = compact(&[a], &opts).unwrap();
    assert!(out.len() > 1, "expected multiple output shards, got {}", out.len());
    let all = get_all(&out);
    assert_eq!(all.len(), 50);
}

#[test]
fn partial_output_is_not_left_behind_on_error() {
    let dir = tempdir().unwrap();
    let a = build_sstable(dir.path(), "a", &[(b"k", Some(b"v"), 1)]);
    // Point the meta path at a file that does not exist so opening the
    // second input fails mid-setup.
    let mut bogus = a.clone();
    bogus.meta_path = dir.path().join("missing.meta");
    let opts = default_options(dir.path());
    let err = compact(&[a, bogus], &opts).unwrap_err();
    let _ = err;
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sst-1-"))
        .collect();
    assert!(leftovers.is_empty());
}
