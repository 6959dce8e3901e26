//! Immutable, sorted, on-disk tables with a sidecar bloom filter and sparse
//! index.
//!
//! An SSTable is two files: a `.data` file holding records in strictly
//! ascending key order, and a `.meta` file holding a JSON descriptor plus a
//! serialized [`BloomFilter`]. Once [`SstableWriter::finalize`] returns,
//! neither file is ever mutated again.
//!
//! # On-disk layout
//!
//! `.data`: contiguous records `[key_len u64][key][value_len u64][value][ts u64]`,
//! little-endian, ascending by key. A tombstone is written with
//! `value_len = 0` and no value bytes — unlike the WAL, the `.data` file has
//! no separate tombstone flag, so an empty value and a tombstone are both
//! read back as `value = None`.
//!
//! `.meta`: `[json_len u32][json_bytes][bloom_blob]`.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`SstableWriter`] for building a table from a sorted stream.
//! - [`iterator`] — [`SstableReader`] for point lookups and range scans.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::SstableWriter;
pub use iterator::SstableReader;

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bloom::BloomError;
use crate::encoding::EncodingError;
use crate::types::Timestamp;

/// Sample every Nth record into the sparse index.
pub const INDEX_INTERVAL: usize = 100;

/// Errors produced by SSTable construction or reading.
#[derive(Debug, Error)]
pub enum SstableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `add` was called with a key not strictly greater than the previous one.
    #[error("keys must be added in strictly ascending order: {prev:?} >= {next:?}")]
    OutOfOrder {
        /// Previously added key.
        prev: Vec<u8>,
        /// Key that violated ordering.
        next: Vec<u8>,
    },

    /// An operation was attempted on a writer that already finalized.
    #[error("SSTable writer already finalized")]
    AlreadyFinalized,

    /// Descriptor JSON failed to serialize or deserialize.
    #[error("descriptor (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Meta file bloom filter blob was malformed.
    #[error("bloom filter error: {0}")]
    Bloom(#[from] BloomError),

    /// Meta file was too short to contain its declared JSON length.
    #[error("truncated SSTable meta file")]
    TruncatedMeta,

    /// Record framing encode/decode failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A descriptor's hex-encoded key bytes were malformed (odd length or
    /// non-hex digits).
    #[error("malformed hex in SSTable descriptor: {0}")]
    InvalidHex(String),
}

/// Persistent, JSON-serializable description of one SSTable, stored both in
/// the `.meta` sidecar file and inside the [`crate::catalog::Catalog`].
///
/// Keys are hex-encoded in JSON since JSON strings must be valid UTF-8 and
/// keys are arbitrary bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SstableDescriptor {
    /// Path to the `.data` file.
    pub data_path: PathBuf,
    /// Path to the `.meta` file.
    pub meta_path: PathBuf,
    /// Smallest key in the table, hex-encoded. `None` only for an empty table.
    #[serde(with = "hex_option")]
    pub min_key: Option<Vec<u8>>,
    /// Largest key in the table, hex-encoded. `None` only for an empty table.
    #[serde(with = "hex_option")]
    pub max_key: Option<Vec<u8>>,
    /// Smallest timestamp among this table's records.
    pub min_ts: Option<Timestamp>,
    /// Largest timestamp among this table's records.
    pub max_ts: Option<Timestamp>,
    /// Number of records written.
    pub count: usize,
    /// Size in bytes of the `.data` file.
    pub data_size: u64,
    /// Sparse index: `(sample_key_hex, data_file_offset)`, every
    /// [`INDEX_INTERVAL`]th record, in ascending order.
    pub index: Vec<(String, u64)>,
}

impl SstableDescriptor {
    fn decoded_index(&self) -> Result<Vec<(Vec<u8>, u64)>, SstableError> {
        self.index
            .iter()
            .map(|(k, off)| hex_decode(k).map(|bytes| (bytes, *off)))
            .collect()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, SstableError> {
    if s.len() % 2 != 0 {
        return Err(SstableError::InvalidHex(s.to_string()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| SstableError::InvalidHex(s.to_string()))
        })
        .collect()
}

mod hex_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&super::hex_encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        opt.map(|s| super::hex_decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
