//! Probabilistic set-membership filter used by every SSTable to short-circuit
//! point lookups that cannot possibly hit.
//!
//! # Sizing
//!
//! Given `expected_elements` (`n`) and a target false-positive rate `p`, the
//! bit-array size `m` and hash count `k` are the standard optimum:
//!
//! ```text
//! m = ceil(-n * ln(p) / ln(2)^2)
//! k = ceil((m / n) * ln(2))
//! ```
//!
//! # Hash family
//!
//! The `k` hashes are independent seedings of SHA-256: hash `i` digests
//! `i` (as a little-endian `u32`) followed by the key, then folds the first
//! four digest bytes modulo `m`. False negatives are impossible by
//! construction — every bit an insert sets stays set.
//!
//! # Serialization
//!
//! `[version u8 = 1][expected_n u32][fpr_scaled u64][m u32][k u32][bits...]`,
//! all integers little-endian. `fpr_scaled = round(fpr * 1e9)`.


use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

/// Current on-disk bloom filter format version.
pub const VERSION: u8 = 1;

/// Errors produced while building or reading a bloom filter.
#[derive(Debug, Error)]
pub enum BloomError {
    /// The serialized blob used a version this build doesn't understand.
    #[error("unsupported bloom filter version: {0}")]
    UnsupportedVersion(u8),

    /// The blob was too short to contain a valid header or bit array.
    #[error("truncated bloom filter data")]
    Truncated,

    /// Underlying encode/decode failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// A bit-array bloom filter sized from an expected element count and target
/// false-positive rate.
///
/// No false negatives: `contains(k)` is always `true` for every `k` given to
/// `add`. False positives are possible and bounded in expectation by the
/// configured rate as long as `inserted <= expected_n`.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    expected_n: u32,
    fpr: f64,
    m: u32,
    k: u32,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Construct an empty filter sized for `expected_elements` insertions at
    /// `fpr` false-positive rate. `expected_elements == 0` is treated as 1
    /// so the filter is always usable.
    pub fn new(expected_elements: u32, fpr: f64) -> Self {
        let n = expected_elements.max(1) as f64;
        let m = (-n * fpr.ln() / std::f64::consts::LN_2.powi(2))
            .ceil()
            .max(1.0) as u32;
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil().max(1.0) as u32;
        let bytes = (m as usize).div_ceil(8);

        Self {
            expected_n: expected_elements.max(1),
            fpr,
            m,
            k,
            bits: vec![0u8; bytes],
        }
    }

    fn hash(&self, key: &[u8], seed: u32) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(seed.to_le_bytes());
        hasher.update(key);
        let digest = hasher.finalize();
        let folded = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        folded % self.m
    }

    /// Record `key` as present.
    pub fn add(&mut self, key: &[u8]) {
        for seed in 0..self.k {
            let bit = self.hash(key, seed);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns `false` only if `key` is definitely absent; `true` means
    /// "maybe present".
    pub fn contains(&self, key: &[u8]) -> bool {
        for seed in 0..self.k {
            let bit = self.hash(key, seed);
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Serialize to the on-disk wire format.
    pub fn serialize(&self) -> Result<Vec<u8>, BloomError> {
        let mut buf = Vec::with_capacity(1 + 4 + 8 + 4 + 4 + self.bits.len());
        VERSION.encode_to(&mut buf)?;
        self.expected_n.encode_to(&mut buf)?;
        let fpr_scaled = (self.fpr * 1e9).round() as u64;
        fpr_scaled.encode_to(&mut buf)?;
        self.m.encode_to(&mut buf)?;
        self.k.encode_to(&mut buf)?;
        buf.extend_from_slice(&self.bits);
        Ok(buf)
    }

    /// Deserialize from the on-disk wire format, rejecting unknown versions.
    pub fn deserialize(data: &[u8]) -> Result<Self, BloomError> {
        let (version, mut offset) = u8::decode_from(data).map_err(|_| BloomError::Truncated)?;
        if version != VERSION {
            return Err(BloomError::UnsupportedVersion(version));
        }
        let (expected_n, n) = u32::decode_from(&data[offset..]).map_err(|_| BloomError::Truncated)?;
        offset += n;
        let (fpr_scaled, n) = u64::decode_from(&data[offset..]).map_err(|_| BloomError::Truncated)?;
        offset += n;
        let (m, n) = u32::decode_from(&data[offset..]).map_err(|_| BloomError::Truncated)?;
        offset += n;
        let (k, n) = u32::decode_from(&data[offset..]).map_err(|_| BloomError::Truncated)?;
        offset += n;

        let expected_bytes = (m as usize).div_ceil(8);
        if data.len() - offset < expected_bytes {
            return Err(BloomError::Truncated);
        }
        let bits = data[offset..offset + expected_bytes].to_vec();

        Ok(Self {
            expected_n,
            fpr: fpr_scaled as f64 / 1e9,
            m,
            k,
            bits,
        })
    }
}

impl Encode for BloomFilter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let bytes = self
            .serialize()
            .map_err(|e| EncodingError::Custom(e.to_string()))?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}

impl Decode for BloomFilter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let filter = Self::deserialize(buf).map_err(|e| EncodingError::Custom(e.to_string()))?;
        let consumed = 1 + 4 + 8 + 4 + 4 + (filter.m as usize).div_ceil(8);
        Ok((filter, consumed))
    }
}
