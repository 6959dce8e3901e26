//! Top-level orchestrator: public API, crash recovery, memtable flush, and
//! timestamp allocation.
//!
//! The store owns the WAL writer and memtable exclusively and is the only
//! path that mutates the catalog's level-0 entries directly. Reads consult
//! the memtable first, then every level from newest to oldest, opening a
//! transient [`SstableReader`] per probed table.
//!
//! # On-disk layout
//!
//! ```text
//! data_dir/
//!   wal/wal-current.wal, wal-<counter>.wal
//!   sst/sst-<level>-<counter>.data
//!   sst/sst-<level>-<counter>.meta
//!   meta/catalog.json, catalog.tmp
//! ```
//!
//! # Flush ordering
//!
//! A flush installs the new L0 SSTable in the catalog, then clears the
//! memtable, then rotates the WAL — in that order. A crash between the
//! first two steps and the third is safe: replaying the not-yet-rotated WAL
//! only reconstructs memtable entries that are already shadowed by the
//! newly-flushed SSTable.
//!
//! # Timestamp allocation
//!
//! On open, the counter seeds from `max(wall_clock_ms, max_ts_in_wal + 1)`
//! so timestamps stay monotonic across restarts even if the wall clock runs
//! backwards, and each write increments and returns it.

pub mod async_driver;

#[cfg(test)]
mod tests;

pub use async_driver::{AsyncCompactionDriver, CompactionJob, CompactionJobState};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::info;

use crate::catalog::{Catalog, CatalogError};
use crate::compaction::{self, CompactionError, CompactionOptions};
use crate::memtable::Memtable;
use crate::sstable::{SstableError, SstableReader, SstableWriter};
use crate::types::{Key, Timestamp, Value};
use crate::wal::{Wal, WalError};

const WAL_DIR: &str = "wal";
const SST_DIR: &str = "sst";
const META_DIR: &str = "meta";
const WAL_CURRENT_FILENAME: &str = "wal-current.wal";

/// Errors produced by store operations, wrapping every subsystem's error
/// kind behind one top-level type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Failure in the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Failure building or reading an SSTable.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Failure mutating or loading the catalog.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Failure during a compaction merge.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying I/O error not otherwise wrapped above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WAL replay failed during `open()`. Fatal — the store could not be
    /// brought up in a consistent state.
    #[error("recovery failed: {0}")]
    Recovery(String),
}

/// Every tunable knob for a [`Store`], with defaults matching a reasonable
/// embedded deployment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory the store is rooted at. Required; no sensible default.
    pub data_dir: PathBuf,
    /// Flush threshold: memtable is flushed once its approximate size
    /// exceeds this many bytes.
    pub memtable_max_bytes: usize,
    /// If true, every WAL append is flushed and fsynced before returning.
    pub wal_flush_every_write: bool,
    /// Target false-positive rate for new SSTable bloom filters.
    pub bloom_false_positive_rate: f64,
    /// Cap on each compaction output SSTable's `.data` file size.
    pub sstable_max_bytes: u64,
    /// Minimum tombstone age, in seconds, before compaction may drop it.
    pub tombstone_retention_seconds: u64,
    /// Number of levels the catalog tracks.
    pub max_levels: usize,
    /// Advisory size hint for WAL rotation. Not currently consulted outside
    /// of flush-triggered rotation; reserved for a future time-based
    /// rotation policy.
    pub wal_file_rotate_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            memtable_max_bytes: 64 * 1024 * 1024,
            wal_flush_every_write: true,
            bloom_false_positive_rate: 0.01,
            sstable_max_bytes: 64 * 1024 * 1024,
            tombstone_retention_seconds: 86_400,
            max_levels: 6,
            wal_file_rotate_bytes: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// A default configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

/// State guarded by `store_lock`: memtable, WAL writer handle, and the
/// monotonic WAL-file counter used on rotation.
struct StoreState {
    memtable: Memtable,
    wal: Arc<Wal>,
    wal_counter: u64,
}

/// Embedded LSM key-value store.
///
/// Cheaply cloneable — internally `Arc`-backed — so a handle can be shared
/// with a background compaction worker without duplicating file handles.
pub struct Store {
    config: StoreConfig,
    catalog: Arc<Catalog>,
    state: Mutex<StoreState>,
    ts_counter: AtomicU64,
    next_sstable_id: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Store {
    /// Open (or create) a store rooted at `config.data_dir`.
    ///
    /// Replays the current WAL into the memtable; WAL corruption is a fatal
    /// [`StoreError::Recovery`].
    pub fn open(config: StoreConfig) -> Result<Arc<Self>, StoreError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal_dir = config.data_dir.join(WAL_DIR);
        let sst_dir = config.data_dir.join(SST_DIR);
        let meta_dir = config.data_dir.join(META_DIR);
        std::fs::create_dir_all(&wal_dir)?;
        std::fs::create_dir_all(&sst_dir)?;
        std::fs::create_dir_all(&meta_dir)?;

        let catalog = Arc::new(Catalog::open(&meta_dir, config.max_levels)?);

        let wal_path = wal_dir.join(WAL_CURRENT_FILENAME);
        let wal = Wal::open(&wal_path, config.wal_flush_every_write)?;

        let mut memtable = Memtable::new();
        let mut max_ts = 0u64;
        for record in wal.iter()? {
            let (key, value, ts) =
                record.map_err(|e| StoreError::Recovery(e.to_string()))?;
            match value {
                Some(v) => memtable.put(key, v, ts),
                None => memtable.delete(key, ts),
            }
            max_ts = max_ts.max(ts);
        }

        let wal_counter = discover_max_counter(&wal_dir, "wal-", ".wal")?;
        let sstable_counter = discover_max_sstable_counter(&sst_dir)?;
        let ts_base = now_millis().max(max_ts + 1);

        info!(
            data_dir = %config.data_dir.display(),
            recovered = memtable.len(),
            "opened store"
        );

        Ok(Arc::new(Self {
            state: Mutex::new(StoreState {
                memtable,
                wal,
                wal_counter,
            }),
            ts_counter: AtomicU64::new(ts_base),
            next_sstable_id: AtomicU64::new(sstable_counter),
            catalog,
            config,
        }))
    }

    fn sst_dir(&self) -> PathBuf {
        self.config.data_dir.join(SST_DIR)
    }

    fn wal_dir(&self) -> PathBuf {
        self.config.data_dir.join(WAL_DIR)
    }

    fn next_timestamp(&self) -> Timestamp {
        self.ts_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert or overwrite `key` with `value`, durable per
    /// `wal_flush_every_write`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(key, Some(value))
    }

    /// Mark `key` deleted via a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ts = self.next_timestamp();
        state.wal.append(key, value, ts)?;
        match value {
            Some(v) => state.memtable.put(key.to_vec(), v.to_vec(), ts),
            None => state.memtable.delete(key.to_vec(), ts),
        }
        if state.memtable.size_bytes() > self.config.memtable_max_bytes {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Point lookup. `None` covers both "no entry" and "entry is a
    /// tombstone".
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        Ok(self.get_with_meta(key)?.and_then(|(v, _)| v))
    }

    /// Point lookup with the winning record's timestamp. Consults the
    /// memtable, then each level newest-table-first, returning on the
    /// first hit (present or tombstone).
    pub fn get_with_meta(
        &self,
        key: &[u8],
    ) -> Result<Option<(Option<Value>, Timestamp)>, StoreError> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((value, ts)) = state.memtable.get(key) {
                return Ok(Some((value.cloned(), ts)));
            }
        }

        for level in 0..self.config.max_levels {
            let descriptors = self.catalog.list_level(level);
            for descriptor in descriptors.iter().rev() {
                let mut reader = SstableReader::open(&descriptor.meta_path)?;
                let hit = reader.get(key)?;
                reader.close();
                if let Some(result) = hit {
                    return Ok(Some(result));
                }
            }
        }

        Ok(None)
    }

    /// Merged, deduplicated range scan across the memtable and every live
    /// SSTable: for each key, the highest-timestamp record wins, and a
    /// winning tombstone is dropped from the result. Keys are yielded in
    /// ascending order.
    ///
    /// Levels are snapshotted low-to-high, same as [`Self::get_with_meta`].
    /// Compaction only ever moves a descriptor from a lower level to a
    /// higher one, and installs the move atomically under the catalog's
    /// lock, so a snapshot of level `L` taken before the source level's
    /// snapshot can never observe the post-move catalog while a
    /// higher-level snapshot observes the pre-move one — that ordering
    /// would drop the key from both and return a partial result.
    pub fn range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<impl Iterator<Item = (Key, Value, Timestamp)>, StoreError> {
        use std::collections::BTreeMap;

        let mut best: BTreeMap<Key, (Option<Value>, Timestamp)> = BTreeMap::new();

        for level in 0..self.config.max_levels {
            for descriptor in self.catalog.list_level(level) {
                let mut reader = SstableReader::open(&descriptor.meta_path)?;
                for record in reader.iter_range(start, end)? {
                    let (key, value, ts) = record?;
                    merge_winner(&mut best, key, value, ts);
                }
                reader.close();
            }
        }

        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for (key, value, ts) in state.memtable.iter_range(start, end) {
                merge_winner(&mut best, key, value, ts);
            }
        }

        Ok(best
            .into_iter()
            .filter_map(|(k, (v, ts))| v.map(|value| (k, value, ts))))
    }

    /// Force a flush even if the memtable is under threshold. A no-op if
    /// the memtable is empty.
    pub fn flush_memtable(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut StoreState) -> Result<(), StoreError> {
        if state.memtable.is_empty() {
            return Ok(());
        }

        let id = self.next_sstable_id.fetch_add(1, Ordering::SeqCst);
        let data_path = self.sst_dir().join(format!("sst-0-{id}.data"));
        let meta_path = self.sst_dir().join(format!("sst-0-{id}.meta"));
        let mut writer =
            SstableWriter::create(&data_path, &meta_path, self.config.bloom_false_positive_rate)?;
        for (key, value, ts) in state.memtable.items() {
            writer.add(&key, value.as_deref(), ts)?;
        }
        let descriptor = writer.finalize()?;

        self.catalog.add_sstable(0, descriptor)?;
        state.memtable.clear();

        state.wal.close()?;
        state.wal_counter += 1;
        let archived_path = self.wal_dir().join(format!("wal-{}.wal", state.wal_counter));
        std::fs::rename(state.wal.path(), &archived_path)?;
        let current_path = self.wal_dir().join(WAL_CURRENT_FILENAME);
        state.wal = Wal::open(&current_path, self.config.wal_flush_every_write)?;

        info!(sstable_id = id, "flushed memtable to L0");
        Ok(())
    }

    /// Synchronously compact every SSTable currently at `level` into
    /// `level + 1`, installing the result in the catalog and unlinking the
    /// inputs once the swap has landed. A no-op if `level` is empty.
    pub fn compact_level(&self, level: usize) -> Result<(), StoreError> {
        let inputs = self.catalog.list_level(level);
        if inputs.is_empty() {
            return Ok(());
        }
        let target_level = (level + 1).min(self.config.max_levels - 1);

        let total_input_bytes: u64 = inputs.iter().map(|d| d.data_size).sum();
        let max_outputs = total_input_bytes / self.config.sstable_max_bytes.max(1) + 1;
        let start_id = self.next_sstable_id.fetch_add(max_outputs, Ordering::SeqCst);

        let options = CompactionOptions {
            output_dir: self.sst_dir(),
            target_level,
            sstable_max_bytes: self.config.sstable_max_bytes,
            bloom_false_positive_rate: self.config.bloom_false_positive_rate,
            tombstone_retention_seconds: self.config.tombstone_retention_seconds,
            now_millis: now_millis(),
            next_sstable_id: start_id,
        };

        let outputs = compaction::compact(&inputs, &options)?;
        self.catalog
            .install_compaction_result(target_level, outputs, &inputs)?;

        for descriptor in &inputs {
            let _ = std::fs::remove_file(&descriptor.data_path);
            let _ = std::fs::remove_file(&descriptor.meta_path);
        }

        info!(level, target_level, "compacted level");
        Ok(())
    }

    /// Current approximate memtable size in bytes. Exposed for tests and
    /// callers deciding whether to request an explicit flush.
    pub fn memtable_size_bytes(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.memtable.size_bytes()
    }

    /// Snapshot of descriptors currently registered at `level`.
    pub fn catalog_snapshot(&self, level: usize) -> Vec<crate::sstable::SstableDescriptor> {
        self.catalog.list_level(level)
    }

    /// This store's configured level count.
    pub fn max_levels(&self) -> usize {
        self.config.max_levels
    }

    /// Flush and fsync the active WAL, releasing its write handle.
    pub fn close(&self) -> Result<(), StoreError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.wal.close()?;
        Ok(())
    }
}

fn merge_winner(
    best: &mut std::collections::BTreeMap<Key, (Option<Value>, Timestamp)>,
    key: Key,
    value: Option<Value>,
    ts: Timestamp,
) {
    best.entry(key)
        .and_modify(|existing| {
            if ts > existing.1 {
                *existing = (value.clone(), ts);
            }
        })
        .or_insert((value, ts));
}

/// Scan `dir` for files named `<prefix><n><suffix>` and return `max(n) + 1`,
/// or `0` if none exist. Used to resume numbering after a restart without
/// colliding with files left on disk.
fn discover_max_counter(dir: &Path, prefix: &str, suffix: &str) -> Result<u64, std::io::Error> {
    let mut max_seen: Option<u64> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(n) = name
                .strip_prefix(prefix)
                .and_then(|s| s.strip_suffix(suffix))
                .and_then(|s| s.parse::<u64>().ok())
            {
                max_seen = Some(max_seen.map_or(n, |m| m.max(n)));
            }
        }
    }
    Ok(max_seen.map_or(0, |m| m + 1))
}

/// Same idea as [`discover_max_counter`] but for `sst-<level>-<n>.data`
/// files, where the counter is the last `-`-delimited segment.
fn discover_max_sstable_counter(dir: &Path) -> Result<u64, std::io::Error> {
    let mut max_seen: Option<u64> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(stem) = name.strip_prefix("sst-").and_then(|s| s.strip_suffix(".data")) {
                if let Some(n) = stem.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()) {
                    max_seen = Some(max_seen.map_or(n, |m| m.max(n)));
                }
            }
        }
    }
    Ok(max_seen.map_or(0, |m| m + 1))
}
