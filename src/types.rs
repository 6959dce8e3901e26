//! Fundamental types shared by every layer of the storage engine.
//!
//! Keys and values are opaque byte strings ordered lexicographically by
//! their `Ord` implementation on `Vec<u8>`. Timestamps are a process-wide
//! monotonic counter, not wall-clock time (see [`crate::store`]).

/// An opaque, lexicographically-ordered key.
pub type Key = Vec<u8>;

/// An opaque value. An empty `Vec` is a real, distinct value from a
/// tombstone — see [`Record`].
pub type Value = Vec<u8>;

/// Monotonically increasing, unique-per-write sequence number.
pub type Timestamp = u64;

/// A single logical write: a key, an optional value, and the timestamp it
/// was written at. `None` marks a tombstone (deletion).
pub type Record = (Key, Option<Value>, Timestamp);
