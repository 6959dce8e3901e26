use tempfile::tempdir;

use super::{SstableDescriptor, SstableError, SstableReader, SstableWriter};

fn paths(dir: &std::path::Path, name: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    (dir.join(format!("{name}.data")), dir.join(format!("{name}.meta")))
}

fn build(
    dir: &std::path::Path,
    name: &str,
    records: &[(&[u8], Option<&[u8]>, u64)],
) -> SstableDescriptor {
    let (data_path, meta_path) = paths(dir, name);
    let mut writer = SstableWriter::create(&data_path, &meta_path, 0.01).unwrap();
    for (k, v, ts) in records {
        writer.add(k, *v, *ts).unwrap();
    }
    writer.finalize().unwrap()
}

#[test]
fn get_hits_and_misses() {
    let dir = tempdir().unwrap();
    build(
        dir.path(),
        "t1",
        &[(b"a", Some(b"1"), 1), (b"b", Some(b"2"), 2), (b"c", Some(b"3"), 3)],
    );
    let mut reader = SstableReader::open(dir.path().join("t1.meta")).unwrap();

    assert_eq!(reader.get(b"b").unwrap(), Some((Some(b"2".to_vec()), 2)));
    assert_eq!(reader.get(b"missing").unwrap(), None);
    assert_eq!(reader.get(b"z").unwrap(), None);
    assert_eq!(reader.get(b"0").unwrap(), None);
}

#[test]
fn tombstone_reads_back_as_none() {
    let dir = tempdir().unwrap();
    build(dir.path(), "t1", &[(b"a", None, 5)]);
    let mut reader = SstableReader::open(dir.path().join("t1.meta")).unwrap();
    assert_eq!(reader.get(b"a").unwrap(), Some((None, 5)));
}

#[test]
fn out_of_order_add_is_rejected() {
    let dir = tempdir().unwrap();
    let (data_path, meta_path) = paths(dir.path(), "t1");
    let mut writer = SstableWriter::create(&data_path, &meta_path, 0.01).unwrap();
    writer.add(b"b", Some(b"1"), 1).unwrap();
    let err = writer.add(b"a", Some(b"2"), 2).unwrap_err();
    assert!(matches!(err, SstableError::OutOfOrder { .. }));
}

#[test]
fn duplicate_key_add_is_rejected() {
    let dir = tempdir().unwrap();
    let (data_path, meta_path) = paths(dir.path(), "t1");
    let mut writer = SstableWriter::create(&data_path, &meta_path, 0.01).unwrap();
    writer.add(b"a", Some(b"1"), 1).unwrap();
    let err = writer.add(b"a", Some(b"2"), 2).unwrap_err();
    assert!(matches!(err, SstableError::OutOfOrder { .. }));
}

#[test]
fn iter_range_is_ascending_and_bounded() {
    let dir = tempdir().unwrap();
    build(
        dir.path(),
        "t1",
        &[
            (b"a", Some(b"1"), 1),
            (b"b", Some(b"2"), 2),
            (b"c", Some(b"3"), 3),
            (b"d", Some(b"4"), 4),
        ],
    );
    let mut reader = SstableReader::open(dir.path().join("t1.meta")).unwrap();
    let got: Vec<_> = reader
        .iter_range(Some(b"b"), Some(b"d"))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(
        got,
        vec![
            (b"b".to_vec(), Some(b"2".to_vec()), 2),
            (b"c".to_vec(), Some(b"3".to_vec()), 3),
        ]
    );
}

#[test]
fn iter_range_unbounded_yields_everything() {
    let dir = tempdir().unwrap();
    build(dir.path(), "t1", &[(b"a", Some(b"1"), 1), (b"b", Some(b"2"), 2)]);
    let mut reader = SstableReader::open(dir.path().join("t1.meta")).unwrap();
    let got: Vec<_> = reader
        .iter_range(None, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(got.len(), 2);
}

#[test]
fn sparse_index_spans_more_than_one_interval() {
    let dir = tempdir().unwrap();
    let records: Vec<(Vec<u8>, Option<Vec<u8>>, u64)> = (0..250u32)
        .map(|i| (format!("k{i:05}").into_bytes(), Some(b"v".to_vec()), i as u64))
        .collect();
    let (data_path, meta_path) = paths(dir.path(), "t1");
    let mut writer = SstableWriter::create(&data_path, &meta_path, 0.01).unwrap();
    for (k, v, ts) in &records {
        writer.add(k, v.as_deref(), *ts).unwrap();
    }
    let descriptor = writer.finalize().unwrap();
    assert_eq!(descriptor.index.len(), 3); // records 0, 100, 200

    let mut reader = SstableReader::open(&meta_path).unwrap();
    for (k, _, ts) in &records {
        assert_eq!(reader.get(k).unwrap().unwrap().1, *ts);
    }
}

#[test]
fn may_contain_respects_key_range_before_bloom() {
    let dir = tempdir().unwrap();
    build(dir.path(), "t1", &[(b"m", Some(b"1"), 1)]);
    let reader = SstableReader::open(dir.path().join("t1.meta")).unwrap();
    assert!(!reader.may_contain(b"a"));
    assert!(!reader.may_contain(b"z"));
    assert!(reader.may_contain(b"m"));
}

#[test]
fn meta_round_trips_through_reopen() {
    let dir = tempdir().unwrap();
    let descriptor = build(dir.path(), "t1", &[(b"a", Some(b"1"), 10), (b"b", Some(b"2"), 20)]);
    assert_eq!(descriptor.count, 2);
    assert_eq!(descriptor.min_ts, Some(10));
    assert_eq!(descriptor.max_ts, Some(20));

    let mut reader = SstableReader::open(dir.path().join("t1.meta")).unwrap();
    assert_eq!(reader.descriptor().count, 2);
    assert_eq!(reader.get(b"a").unwrap(), Some((Some(b"1".to_vec()), 10)));
}

#[test]
fn malformed_index_hex_is_a_typed_error_not_a_panic() {
    let dir = tempdir().unwrap();
    build(dir.path(), "t1", &[(b"a", Some(b"1"), 1)]);
    let meta_path = dir.path().join("t1.meta");

    let bytes = std::fs::read(&meta_path).unwrap();
    let json_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut json_text = String::from_utf8(bytes[4..4 + json_len].to_vec()).unwrap();
    // `min_key`/`max_key` decode eagerly during deserialization (a bad hex
    // value there surfaces as `SstableError::Json`); only the `index`
    // field's sample keys are decoded lazily by `decoded_index()`, so that
    // is the one corrupted here. Key "a" hex-encodes to "61".
    let index_pos = json_text.find("\"index\":").expect("index field present");
    let key_pos = index_pos + json_text[index_pos..].find("\"61\"").expect("sample key present");
    json_text.replace_range(key_pos..key_pos + 4, "\"zz\"");

    let mut rebuilt = (json_text.len() as u32).to_le_bytes().to_vec();
    rebuilt.extend_from_slice(json_text.as_bytes());
    rebuilt.extend_from_slice(&bytes[4 + json_len..]);
    std::fs::write(&meta_path, rebuilt).unwrap();

    match SstableReader::open(&meta_path) {
        Err(err) => assert!(matches!(err, SstableError::InvalidHex(_))),
        Ok(_) => panic!("expected malformed hex to be rejected"),
    }
}

#[test]
fn odd_length_hex_is_rejected_not_panicked_on() {
    let dir = tempdir().unwrap();
    build(dir.path(), "t1", &[(b"a", Some(b"1"), 1)]);
    let meta_path = dir.path().join("t1.meta");

    let bytes = std::fs::read(&meta_path).unwrap();
    let json_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut json_text = String::from_utf8(bytes[4..4 + json_len].to_vec()).unwrap();
    let index_pos = json_text.find("\"index\":").expect("index field present");
    let key_pos = index_pos + json_text[index_pos..].find("\"61\"").expect("sample key present");
    json_text.replace_range(key_pos..key_pos + 4, "\"6\"");

    let mut rebuilt = (json_text.len() as u32).to_le_bytes().to_vec();
    rebuilt.extend_from_slice(json_text.as_bytes());
    rebuilt.extend_from_slice(&bytes[4 + json_len..]);
    std::fs::write(&meta_path, rebuilt).unwrap();

    match SstableReader::open(&meta_path) {
        Err(err) => assert!(matches!(err, SstableError::InvalidHex(_))),
        Ok(_) => panic!("expected malformed hex to be rejected"),
    }
}
