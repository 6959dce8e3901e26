//! [`SstableReader`]: point lookups and ordered range scans over a finalized
//! SSTable.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::bloom::BloomFilter;
use crate::types::{Key, Record, Timestamp, Value};

use super::{SstableDescriptor, SstableError};

/// Read-only handle to a finalized SSTable. Opens its `.data` file lazily,
/// on the first read that actually needs it.
pub struct SstableReader {
    descriptor: SstableDescriptor,
    bloom: BloomFilter,
    index: Vec<(Key, u64)>,
    file: Option<BufReader<File>>,
}

impl SstableReader {
    /// Load the descriptor and bloom filter from `meta_path`. Does not open
    /// the `.data` file yet.
    pub fn open(meta_path: impl AsRef<Path>) -> Result<Self, SstableError> {
        let meta_bytes = std::fs::read(meta_path.as_ref())?;
        if meta_bytes.len() < 4 {
            return Err(SstableError::TruncatedMeta);
        }
        let json_len = u32::from_le_bytes(meta_bytes[0..4].try_into().unwrap()) as usize;
        if meta_bytes.len() < 4 + json_len {
            return Err(SstableError::TruncatedMeta);
        }
        let descriptor: SstableDescriptor = serde_json::from_slice(&meta_bytes[4..4 + json_len])?;
        let bloom = BloomFilter::deserialize(&meta_bytes[4 + json_len..])?;
        let index = descriptor.decoded_index()?;

        Ok(Self {
            descriptor,
            bloom,
            index,
            file: None,
        })
    }

    /// This table's descriptor.
    pub fn descriptor(&self) -> &SstableDescriptor {
        &self.descriptor
    }

    fn ensure_open(&mut self) -> Result<&mut BufReader<File>, SstableError> {
        if self.file.is_none() {
            self.file = Some(BufReader::new(File::open(&self.descriptor.data_path)?));
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// `false` only if `key` is definitely absent from this table.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if let Some(min) = &self.descriptor.min_key {
            if key < min.as_slice() {
                return false;
            }
        }
        if let Some(max) = &self.descriptor.max_key {
            if key > max.as_slice() {
                return false;
            }
        }
        self.bloom.contains(key)
    }

    /// Binary-search the sparse index for the offset of the largest sampled
    /// key `<= key`, or 0 if the index is empty or every sample exceeds key.
    fn find_block_offset(&self, key: &[u8]) -> u64 {
        if self.index.is_empty() {
            return 0;
        }
        let mut lo = 0isize;
        let mut hi = self.index.len() as isize - 1;
        let mut result = 0u64;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let (idx_key, idx_offset) = &self.index[mid as usize];
            if idx_key.as_slice() <= key {
                result = *idx_offset;
                lo = mid + 1;
            } else {
                hi = mid - 1;
            }
        }
        result
    }

    fn read_record(reader: &mut BufReader<File>) -> Result<Option<(Key, Value, Timestamp)>, SstableError> {
        let mut key_len_buf = [0u8; 8];
        if !read_exact_or_eof(reader, &mut key_len_buf)? {
            return Ok(None);
        }
        let key_len = u64::from_le_bytes(key_len_buf) as usize;
        let mut key = vec![0u8; key_len];
        if !read_exact_or_eof(reader, &mut key)? {
            return Ok(None);
        }

        let mut value_len_buf = [0u8; 8];
        if !read_exact_or_eof(reader, &mut value_len_buf)? {
            return Ok(None);
        }
        let value_len = u64::from_le_bytes(value_len_buf) as usize;
        let mut value = vec![0u8; value_len];
        if !read_exact_or_eof(reader, &mut value)? {
            return Ok(None);
        }

        let mut ts_buf = [0u8; 8];
        if !read_exact_or_eof(reader, &mut ts_buf)? {
            return Ok(None);
        }
        let ts = u64::from_le_bytes(ts_buf);

        Ok(Some((key, value, ts)))
    }

    /// Look up `key`. `Some((None, ts))` is a tombstone (or, indistinguishably
    /// on disk, a stored empty value); `None` means the key is not present.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<(Option<Value>, Timestamp)>, SstableError> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        let offset = self.find_block_offset(key);
        let reader = self.ensure_open()?;
        reader.seek(SeekFrom::Start(offset))?;

        loop {
            match Self::read_record(reader)? {
                None => return Ok(None),
                Some((record_key, value, ts)) => {
                    if record_key.as_slice() > key {
                        return Ok(None);
                    }
                    if record_key.as_slice() == key {
                        let value = if value.is_empty() { None } else { Some(value) };
                        return Ok(Some((value, ts)));
                    }
                }
            }
        }
    }

    /// Stream records with keys in `[start, end)`, either bound absent
    /// meaning unbounded on that side.
    pub fn iter_range(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<SstableRangeIter<'_>, SstableError> {
        let offset = start.map_or(0, |s| self.find_block_offset(s));
        let reader = self.ensure_open()?;
        reader.seek(SeekFrom::Start(offset))?;
        Ok(SstableRangeIter {
            reader,
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            done: false,
        })
    }

    /// Release the underlying file handle, if open.
    pub fn close(&mut self) {
        self.file = None;
    }
}

fn read_exact_or_eof(reader: &mut BufReader<File>, buf: &mut [u8]) -> Result<bool, SstableError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => return Ok(false),
            n => filled += n,
        }
    }
    Ok(true)
}

/// Streaming iterator over a key range within one SSTable.
pub struct SstableRangeIter<'a> {
    reader: &'a mut BufReader<File>,
    start: Option<Key>,
    end: Option<Key>,
    done: bool,
}

impl Iterator for SstableRangeIter<'_> {
    type Item = Result<Record, SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match SstableReader::read_record(self.reader) {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Ok(Some((key, value, ts))) => {
                    if let Some(start) = &self.start {
                        if key.as_slice() < start.as_slice() {
                            continue;
                        }
                    }
                    if let Some(end) = &self.end {
                        if key.as_slice() >= end.as_slice() {
                            self.done = true;
                            return None;
                        }
                    }
                    let value = if value.is_empty() { None } else { Some(value) };
                    return Some(Ok((key, value, ts)));
                }
            }
        }
    }
}
