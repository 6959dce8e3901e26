//! Write-ahead log: a durable, append-only, CRC-protected record stream.
//!
//! Every write to the store is framed and appended here before the
//! in-memory memtable is touched, so a crash between WAL append and memtable
//! update can never lose an acknowledged write.
//!
//! # On-disk record framing
//!
//! ```text
//! [magic u32 = 0x4C534D01][key_len u64][key][value_len u64][value][ts u64][op u8][crc32 u32]
//! ```
//!
//! All integers little-endian. `op` is `0` (PUT) or `1` (DELETE); a DELETE
//! carries `value_len = 0` and no value bytes. `crc32` (zlib/IEEE
//! polynomial, via [`crc32fast`]) covers every byte from `magic` through
//! `op` inclusive.
//!
//! # Replay semantics
//!
//! Replay reads one field at a time. A short read on any field at end of
//! file is a clean, expected truncation (the tail of an interrupted write)
//! and stops iteration without error. A magic mismatch or CRC mismatch
//! anywhere else is [`WalError::Corruption`] — never silently skipped.
//!
//! # Concurrency
//!
//! The WAL has exactly one writer; the handle is shared behind a
//! [`Mutex`] so the store can hand clones to a recovery path or a future
//! background flusher without duplicating file descriptors.


use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{Key, Record, Timestamp, Value};

/// Magic constant identifying a WAL record (`"LSM"` + format version 1).
pub const MAGIC: u32 = 0x4C53_4D01;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

/// Errors produced by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Magic mismatch or checksum failure on a fully-read record — real
    /// corruption, not a truncated tail.
    #[error("WAL corruption at byte offset {offset}: {reason}")]
    Corruption {
        /// Byte offset of the start of the offending record.
        offset: u64,
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The WAL handle was used after `close()`.
    #[error("WAL is closed")]
    Closed,
}

/// An append-only, durable record log.
///
/// `flush_every_write = true` makes every [`Wal::append`] durable on return
/// (flush + fsync); otherwise durability holds only after an explicit
/// [`Wal::sync`] or [`Wal::close`].
pub struct Wal {
    path: PathBuf,
    file: Mutex<Option<File>>,
    flush_every_write: bool,
    sequence: Mutex<u64>,
}

impl Wal {
    /// Open (creating if absent) a WAL file for appending.
    pub fn open(path: impl AsRef<Path>, flush_every_write: bool) -> Result<Arc<Self>, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        debug!(path = %path.display(), "opened WAL for append");
        Ok(Arc::new(Self {
            path,
            file: Mutex::new(Some(file)),
            flush_every_write,
            sequence: Mutex::new(0),
        }))
    }

    /// Path to the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, returning its sequence number within this WAL
    /// file (monotonic, not persisted).
    pub fn append(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        ts: Timestamp,
    ) -> Result<u64, WalError> {
        let op = if value.is_some() { OP_PUT } else { OP_DELETE };
        let value_bytes = value.unwrap_or(&[]);

        let mut payload =
            Vec::with_capacity(4 + 8 + key.len() + 8 + value_bytes.len() + 8 + 1 + 4);
        payload.extend_from_slice(&MAGIC.to_le_bytes());
        payload.extend_from_slice(&(key.len() as u64).to_le_bytes());
        payload.extend_from_slice(key);
        payload.extend_from_slice(&(value_bytes.len() as u64).to_le_bytes());
        payload.extend_from_slice(value_bytes);
        payload.extend_from_slice(&ts.to_le_bytes());
        payload.push(op);

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();
        payload.extend_from_slice(&crc.to_le_bytes());

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let file = guard.as_mut().ok_or(WalError::Closed)?;
        file.write_all(&payload)?;
        if self.flush_every_write {
            file.flush()?;
            file.sync_all()?;
        }

        let mut seq = self.sequence.lock().unwrap_or_else(|e| e.into_inner());
        *seq += 1;
        Ok(*seq)
    }

    /// Force any buffered writes to stable storage.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let file = guard.as_mut().ok_or(WalError::Closed)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Flush, fsync, and release the write handle. Further `append` calls
    /// fail with [`WalError::Closed`].
    pub fn close(&self) -> Result<(), WalError> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = guard.as_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        *guard = None;
        info!(path = %self.path.display(), "closed WAL");
        Ok(())
    }

    /// Open a fresh, independent iterator over this WAL's persisted
    /// records, from the beginning of the file.
    pub fn iter(&self) -> Result<WalIter, WalError> {
        WalIter::open(&self.path)
    }
}

/// Streaming reader over a WAL file's persisted records, in append order.
pub struct WalIter {
    reader: BufReader<File>,
    offset: u64,
}

impl WalIter {
    /// Open `path` for replay from the start.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// Read the next record. Returns `Ok(None)` on a clean (possibly
    /// mid-field) truncation at end of file; `Err` on magic/CRC corruption.
    fn read_one(&mut self) -> Result<Option<Record>, WalError> {
        let start_offset = self.offset;

        let mut magic_buf = [0u8; 4];
        if !self.read_exact_or_eof(&mut magic_buf)? {
            return Ok(None);
        }
        let magic = u32::from_le_bytes(magic_buf);
        if magic != MAGIC {
            return Err(WalError::Corruption {
                offset: start_offset,
                reason: format!("bad magic 0x{magic:08X}"),
            });
        }

        let mut key_len_buf = [0u8; 8];
        if !self.read_exact_or_eof(&mut key_len_buf)? {
            return Ok(None);
        }
        let key_len = u64::from_le_bytes(key_len_buf);

        let key = match self.read_variable_or_eof(key_len)? {
            Some(key) => key,
            None => return Ok(None),
        };

        let mut value_len_buf = [0u8; 8];
        if !self.read_exact_or_eof(&mut value_len_buf)? {
            return Ok(None);
        }
        let value_len = u64::from_le_bytes(value_len_buf);

        let value = match self.read_variable_or_eof(value_len)? {
            Some(value) => value,
            None => return Ok(None),
        };

        let mut ts_buf = [0u8; 8];
        if !self.read_exact_or_eof(&mut ts_buf)? {
            return Ok(None);
        }
        let ts = u64::from_le_bytes(ts_buf);

        let mut op_buf = [0u8; 1];
        if !self.read_exact_or_eof(&mut op_buf)? {
            return Ok(None);
        }
        let op = op_buf[0];

        let mut crc_buf = [0u8; 4];
        if !self.read_exact_or_eof(&mut crc_buf)? {
            return Ok(None);
        }
        let stored_crc = u32::from_le_bytes(crc_buf);

        let mut hasher = Crc32::new();
        hasher.update(&magic_buf);
        hasher.update(&key_len_buf);
        hasher.update(&key);
        hasher.update(&value_len_buf);
        hasher.update(&value);
        hasher.update(&ts_buf);
        hasher.update(&op_buf);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(WalError::Corruption {
                offset: start_offset,
                reason: format!("CRC mismatch: expected 0x{computed_crc:08X}, got 0x{stored_crc:08X}"),
            });
        }

        let value: Option<Value> = match op {
            OP_PUT => Some(value),
            OP_DELETE => None,
            other => {
                return Err(WalError::Corruption {
                    offset: start_offset,
                    reason: format!("unknown op code {other}"),
                });
            }
        };

        let key: Key = key;
        Ok(Some((key, value, ts as Timestamp)))
    }

    /// Read exactly `buf.len()` bytes, tracking the logical offset.
    /// Returns `Ok(false)` if the stream ended before any byte of this
    /// field was read (clean EOF); a partial fill is also treated as a
    /// clean truncated tail per the WAL's replay contract.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, WalError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..])? {
                0 => {
                    if filled == 0 {
                        return Ok(false);
                    }
                    warn!(offset = self.offset, "WAL tail truncated mid-field");
                    return Ok(false);
                }
                n => filled += n,
            }
        }
        self.offset += buf.len() as u64;
        Ok(true)
    }

    /// Read a length-prefixed field whose length comes from un-verified,
    /// on-disk data. Grows the buffer incrementally from what is actually
    /// available rather than preallocating `len` bytes up front, so a
    /// corrupted length field cannot force a huge allocation — it just
    /// surfaces as a clean truncation, same as a short read on a fixed field.
    fn read_variable_or_eof(&mut self, len: u64) -> Result<Option<Vec<u8>>, WalError> {
        let mut buf = Vec::new();
        let read = (&mut self.reader).take(len).read_to_end(&mut buf)?;
        if (read as u64) < len {
            if read > 0 {
                warn!(offset = self.offset, "WAL tail truncated mid-field");
            }
            return Ok(None);
        }
        self.offset += read as u64;
        Ok(Some(buf))
    }
}

impl Iterator for WalIter {
    type Item = Result<Record, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_one().transpose()
    }
}
