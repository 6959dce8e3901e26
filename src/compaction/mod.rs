//! Merges SSTables from one level into the next, discarding shadowed writes
//! and aged tombstones.
//!
//! # Algorithm
//!
//! 1. Open a streaming `iter_range(None, None)` for every input SSTable; push
//!    each one's first record onto a min-heap ordered by `(key asc, ts desc)`.
//! 2. Pop the heap head, advance that iterator, and push its next record (if
//!    any) back onto the heap.
//! 3. Group popped records sharing a key; keep only the one with the
//!    highest timestamp.
//! 4. Emit the survivor to the current output writer, unless it is a
//!    tombstone older than `tombstone_retention_seconds`.
//! 5. Roll over to a new output SSTable once the current one reaches
//!    `sstable_max_bytes`.
//!
//! On any error mid-scan, unfinalized output files are unlinked
//! (best-effort) and the error propagates — partial output is never made
//! visible to the catalog.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::sstable::{SstableDescriptor, SstableError, SstableReader, SstableWriter};
use crate::types::{Key, Timestamp, Value};

/// Approximate per-record overhead used when deciding whether to roll over
/// to a new output SSTable.
const RECORD_OVERHEAD_BYTES: usize = 24;

/// Errors produced during compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Failure reading an input or writing an output SSTable.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters controlling one compaction run, independent of the catalog.
#[derive(Debug, Clone)]
pub struct CompactionOptions {
    /// Directory new output `.data`/`.meta` files are written into.
    pub output_dir: PathBuf,
    /// Level the outputs are destined for (used only in output filenames).
    pub target_level: usize,
    /// Cap on each output SSTable's `.data` file size.
    pub sstable_max_bytes: u64,
    /// Target false-positive rate for output bloom filters.
    pub bloom_false_positive_rate: f64,
    /// Minimum tombstone age, in seconds, before it may be dropped.
    pub tombstone_retention_seconds: u64,
    /// Current wall-clock time in milliseconds, used to judge tombstone age.
    /// Threaded in rather than read from the clock so compaction is
    /// deterministic to test.
    pub now_millis: u64,
    /// Starting value for the output file counter; the caller is
    /// responsible for keeping this unique across the store's lifetime.
    pub next_sstable_id: u64,
}

/// A single heap entry: one pending record plus which input stream it came
/// from, so the merge can pull that stream's next record after popping.
struct HeapEntry {
    key: Key,
    ts: Timestamp,
    value: Option<Value>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.ts == other.ts
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap; reverse key order so the smallest key surfaces
    // first, and among equal keys prefer the highest timestamp.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key).then_with(|| self.ts.cmp(&other.ts))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Accumulates merged records into a sequence of output SSTables, rolling
/// over once the current one reaches `sstable_max_bytes`.
struct OutputWriter<'a> {
    options: &'a CompactionOptions,
    next_id: u64,
    current: Option<SstableWriter>,
    current_size: u64,
    finished: Vec<SstableDescriptor>,
}

impl<'a> OutputWriter<'a> {
    fn new(options: &'a CompactionOptions) -> Self {
        Self {
            options,
            next_id: options.next_sstable_id,
            current: None,
            current_size: 0,
            finished: Vec::new(),
        }
    }

    fn add(&mut self, key: &[u8], value: Option<&[u8]>, ts: Timestamp) -> Result<(), CompactionError> {
        if self.current.is_none() || self.current_size >= self.options.sstable_max_bytes {
            self.roll_over()?;
        }
        self.current.as_mut().unwrap().add(key, value, ts)?;
        self.current_size += (key.len() + value.map_or(0, <[u8]>::len) + RECORD_OVERHEAD_BYTES) as u64;
        Ok(())
    }

    fn roll_over(&mut self) -> Result<(), CompactionError> {
        if let Some(writer) = self.current.take() {
            self.finished.push(writer.finalize()?);
        }
        let (data_path, meta_path) = output_paths(&self.options.output_dir, self.options.target_level, self.next_id);
        self.next_id += 1;
        self.current = Some(SstableWriter::create(
            &data_path,
            &meta_path,
            self.options.bloom_false_positive_rate,
        )?);
        self.current_size = 0;
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<SstableDescriptor>, CompactionError> {
        if let Some(writer) = self.current.take() {
            self.finished.push(writer.finalize()?);
        }
        Ok(self.finished)
    }

    fn discard(self) {
        for desc in &self.finished {
            let _ = std::fs::remove_file(&desc.data_path);
            let _ = std::fs::remove_file(&desc.meta_path);
        }
    }
}

/// Merge `inputs` into one or more output SSTables at `options.target_level`.
///
/// Returns the produced descriptors. Produces zero descriptors if every
/// input record is dropped (all tombstones past retention).
pub fn compact(
    inputs: &[SstableDescriptor],
    options: &CompactionOptions,
) -> Result<Vec<SstableDescriptor>, CompactionError> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    info!(
        input_count = inputs.len(),
        target_level = options.target_level,
        "starting compaction"
    );

    let mut readers: Vec<SstableReader> = inputs
        .iter()
        .map(|d| SstableReader::open(&d.meta_path))
        .collect::<Result<_, _>>()?;

    let result = run_merge(&mut readers, options);

    for reader in &mut readers {
        reader.close();
    }

    result
}

fn run_merge(
    readers: &mut [SstableReader],
    options: &CompactionOptions,
) -> Result<Vec<SstableDescriptor>, CompactionError> {
    let mut iters: Vec<_> = readers
        .iter_mut()
        .map(|r| r.iter_range(None, None))
        .collect::<Result<_, _>>()?;

    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    for (idx, it) in iters.iter_mut().enumerate() {
        if let Some(next) = it.next() {
            let (key, value, ts) = next?;
            heap.push(HeapEntry { key, ts, value, source: idx });
        }
    }

    let mut output = OutputWriter::new(options);
    let mut group: Option<(Key, Option<Value>, Timestamp)> = None;

    let merge_result = (|| -> Result<(), CompactionError> {
        while let Some(entry) = heap.pop() {
            if let Some(next) = iters[entry.source].next() {
                let (key, value, ts) = next?;
                heap.push(HeapEntry { key, ts, value, source: entry.source });
            }

            match &mut group {
                Some((key, value, ts)) if *key == entry.key => {
                    if entry.ts > *ts {
                        *value = entry.value;
                        *ts = entry.ts;
                    }
                }
                _ => {
                    if let Some((key, value, ts)) = group.take() {
                        emit(&mut output, key, value, ts, options)?;
                    }
                    group = Some((entry.key, entry.value, entry.ts));
                }
            }
        }
        if let Some((key, value, ts)) = group.take() {
            emit(&mut output, key, value, ts, options)?;
        }
        Ok(())
    })();

    match merge_result {
        Ok(()) => output.finish(),
        Err(e) => {
            output.discard();
            Err(e)
        }
    }
}

fn emit(
    output: &mut OutputWriter<'_>,
    key: Key,
    value: Option<Value>,
    ts: Timestamp,
    options: &CompactionOptions,
) -> Result<(), CompactionError> {
    if value.is_none() && tombstone_expired(ts, options) {
        warn!(ts, "dropping expired tombstone during compaction");
        return Ok(());
    }
    output.add(&key, value.as_deref(), ts)
}

fn tombstone_expired(ts: Timestamp, options: &CompactionOptions) -> bool {
    let age_ms = options.now_millis.saturating_sub(ts);
    age_ms / 1000 >= options.tombstone_retention_seconds
}

fn output_paths(dir: &Path, level: usize, id: u64) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("sst-{level}-{id}.data")),
        dir.join(format!("sst-{level}-{id}.meta")),
    )
}
