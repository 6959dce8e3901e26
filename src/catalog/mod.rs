//! Persistent, per-level registry of live SSTable descriptors.
//!
//! The catalog is the sole authority on which SSTable files are live.
//! Compaction may not delete an input file until a catalog mutation has
//! removed its descriptor and that mutation has durably landed.
//!
//! # Durability
//!
//! Every mutation re-serializes the full in-memory state to JSON, writes it
//! to a temp file in the same directory, renames it over the canonical
//! `catalog.json`, and fsyncs the containing directory so the rename itself
//! is durable.
//!
//! # On-disk format
//!
//! UTF-8 JSON: `{ "0": [descriptor, ...], "1": [...], ... }`, keyed by
//! stringified level. Within a level, descriptors are stored in insertion
//! order; for level 0 that order is newest-last (readers walk it in
//! reverse).

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::info;

use crate::sstable::SstableDescriptor;

const CATALOG_FILENAME: &str = "catalog.json";
const CATALOG_TMP_FILENAME: &str = "catalog.tmp";

/// Errors produced by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk catalog file exists but could not be parsed.
    #[error("malformed catalog file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// `level -> ordered descriptors` on-disk shape, keyed by stringified level
/// since JSON object keys must be strings.
type OnDisk = BTreeMap<String, Vec<SstableDescriptor>>;

#[derive(Debug)]
struct CatalogData {
    levels: Vec<Vec<SstableDescriptor>>,
}

/// Atomic, per-level registry of SSTable descriptors.
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    max_levels: usize,
    data: Mutex<CatalogData>,
}

impl Catalog {
    /// Open (or create) the catalog under `dir`. A missing file means an
    /// empty catalog; a malformed one is a fatal error.
    pub fn open(dir: impl AsRef<Path>, max_levels: usize) -> Result<Self, CatalogError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CATALOG_FILENAME);

        let mut levels = vec![Vec::new(); max_levels];
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let on_disk: OnDisk = serde_json::from_slice(&bytes)?;
            for (level_str, descriptors) in on_disk {
                let level: usize = level_str
                    .parse()
                    .map_err(|_| CatalogError::Malformed(serde::de::Error::custom(format!(
                        "non-numeric level key {level_str:?}"
                    ))))?;
                if level < max_levels {
                    levels[level] = descriptors;
                }
            }
        }

        info!(path = %path.display(), "opened catalog");
        Ok(Self {
            dir,
            max_levels,
            data: Mutex::new(CatalogData { levels }),
        })
    }

    /// Snapshot of all descriptors currently registered at `level`, in
    /// on-disk insertion order. Cloned so callers never race an in-flight
    /// mutation.
    pub fn list_level(&self, level: usize) -> Vec<SstableDescriptor> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.levels.get(level).cloned().unwrap_or_default()
    }

    /// Register `descriptor` as a new, newest entry at `level`.
    pub fn add_sstable(
        &self,
        level: usize,
        descriptor: SstableDescriptor,
    ) -> Result<(), CatalogError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.levels[level].push(descriptor);
        self.save(&data)
    }

    /// Atomically add `additions` at `target_level` and remove `removals`
    /// (matched by data-path identity, in any level) in one mutation.
    pub fn install_compaction_result(
        &self,
        target_level: usize,
        additions: Vec<SstableDescriptor>,
        removals: &[SstableDescriptor],
    ) -> Result<(), CatalogError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let removal_paths: Vec<&PathBuf> = removals.iter().map(|d| &d.data_path).collect();
        for level in data.levels.iter_mut() {
            level.retain(|d| !removal_paths.contains(&&d.data_path));
        }
        data.levels[target_level].extend(additions);
        self.save(&data)
    }

    /// Remove every descriptor whose `data_path` matches one in
    /// `descriptors`, wherever it is found.
    pub fn remove_sstables(&self, descriptors: &[SstableDescriptor]) -> Result<(), CatalogError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let removal_paths: Vec<&PathBuf> = descriptors.iter().map(|d| &d.data_path).collect();
        for level in data.levels.iter_mut() {
            level.retain(|d| !removal_paths.contains(&&d.data_path));
        }
        self.save(&data)
    }

    fn save(&self, data: &CatalogData) -> Result<(), CatalogError> {
        let mut on_disk = OnDisk::new();
        for (level, descriptors) in data.levels.iter().enumerate() {
            if !descriptors.is_empty() {
                on_disk.insert(level.to_string(), descriptors.clone());
            }
        }
        let bytes = serde_json::to_vec_pretty(&on_disk)?;

        let tmp_path = self.dir.join(CATALOG_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            use std::io::Write;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        let final_path = self.dir.join(CATALOG_FILENAME);
        std::fs::rename(&tmp_path, &final_path)?;
        Self::fsync_dir(&self.dir)?;
        Ok(())
    }

    fn fsync_dir(dir: &Path) -> Result<(), CatalogError> {
        let dir_file = File::open(dir)?;
        dir_file.sync_all()?;
        Ok(())
    }

    /// Number of levels this catalog was opened with.
    pub fn max_levels(&self) -> usize {
        self.max_levels
    }
}
