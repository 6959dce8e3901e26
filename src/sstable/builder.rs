//! [`SstableWriter`]: streams sorted records into a new SSTable.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::bloom::BloomFilter;
use crate::encoding::Encode;
use crate::types::{Key, Timestamp};

use super::{hex_encode, SstableDescriptor, SstableError, INDEX_INTERVAL};

/// Writes a single SSTable. Records must be added in strictly ascending key
/// order; violating that raises [`SstableError::OutOfOrder`].
///
/// Dropped without calling [`finalize`](SstableWriter::finalize), the
/// partially-written `.data` file is left on disk — callers that abandon a
/// writer on error are responsible for cleanup.
pub struct SstableWriter {
    data_path: PathBuf,
    meta_path: PathBuf,
    bloom_fpr: f64,
    writer: Option<BufWriter<File>>,
    offset: u64,
    min_key: Option<Key>,
    max_key: Option<Key>,
    min_ts: Option<Timestamp>,
    max_ts: Option<Timestamp>,
    count: usize,
    last_key: Option<Key>,
    index: Vec<(Key, u64)>,
    bloom_keys: Vec<Key>,
}

impl SstableWriter {
    /// Create a new writer at `data_path`/`meta_path`, truncating any
    /// existing `.data` file at that path.
    pub fn create(
        data_path: impl AsRef<Path>,
        meta_path: impl AsRef<Path>,
        bloom_fpr: f64,
    ) -> Result<Self, SstableError> {
        let data_path = data_path.as_ref().to_path_buf();
        let meta_path = meta_path.as_ref().to_path_buf();
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&data_path)?;
        Ok(Self {
            data_path,
            meta_path,
            bloom_fpr,
            writer: Some(BufWriter::new(file)),
            offset: 0,
            min_key: None,
            max_key: None,
            min_ts: None,
            max_ts: None,
            count: 0,
            last_key: None,
            index: Vec::new(),
            bloom_keys: Vec::new(),
        })
    }

    /// Append one record. Must be called with strictly increasing keys.
    pub fn add(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
        ts: Timestamp,
    ) -> Result<(), SstableError> {
        if let Some(prev) = &self.last_key {
            if key <= prev.as_slice() {
                return Err(SstableError::OutOfOrder {
                    prev: prev.clone(),
                    next: key.to_vec(),
                });
            }
        }

        let writer = self.writer.as_mut().ok_or(SstableError::AlreadyFinalized)?;

        if self.count % INDEX_INTERVAL == 0 {
            self.index.push((key.to_vec(), self.offset));
        }
        self.bloom_keys.push(key.to_vec());

        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.max_key = Some(key.to_vec());
        self.min_ts = Some(self.min_ts.map_or(ts, |m| m.min(ts)));
        self.max_ts = Some(self.max_ts.map_or(ts, |m| m.max(ts)));

        let value_bytes = value.unwrap_or(&[]);
        let mut record = Vec::with_capacity(8 + key.len() + 8 + value_bytes.len() + 8);
        (key.len() as u64).encode_to(&mut record)?;
        record.extend_from_slice(key);
        (value_bytes.len() as u64).encode_to(&mut record)?;
        record.extend_from_slice(value_bytes);
        ts.encode_to(&mut record)?;

        writer.write_all(&record)?;
        self.offset += record.len() as u64;
        self.count += 1;
        self.last_key = Some(key.to_vec());

        Ok(())
    }

    /// Close the `.data` file, build the bloom filter, and write the
    /// `.meta` sidecar. The writer is dead after this call.
    pub fn finalize(mut self) -> Result<SstableDescriptor, SstableError> {
        let mut writer = self.writer.take().ok_or(SstableError::AlreadyFinalized)?;
        writer.flush()?;
        drop(writer);

        let data_size = std::fs::metadata(&self.data_path)?.len();

        let mut bloom = BloomFilter::new(self.bloom_keys.len().max(1) as u32, self.bloom_fpr);
        for key in &self.bloom_keys {
            bloom.add(key);
        }
        let bloom_bytes = bloom.serialize()?;

        let descriptor = SstableDescriptor {
            data_path: self.data_path.clone(),
            meta_path: self.meta_path.clone(),
            min_key: self.min_key.clone(),
            max_key: self.max_key.clone(),
            min_ts: self.min_ts,
            max_ts: self.max_ts,
            count: self.count,
            data_size,
            index: self
                .index
                .iter()
                .map(|(k, off)| (hex_encode(k), *off))
                .collect(),
        };

        let json_bytes = serde_json::to_vec(&descriptor)?;
        let mut meta_buf = Vec::with_capacity(4 + json_bytes.len() + bloom_bytes.len());
        meta_buf.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
        meta_buf.extend_from_slice(&json_bytes);
        meta_buf.extend_from_slice(&bloom_bytes);
        std::fs::write(&self.meta_path, &meta_buf)?;

        info!(
            data_path = %self.data_path.display(),
            count = self.count,
            data_size,
            "finalized SSTable"
        );

        Ok(descriptor)
    }
}
