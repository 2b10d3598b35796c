//! Ordered key-value contract backing the materialized views.
//!
//! An implementation owns one namespace: an ordered byte-string keyspace
//! with point reads, atomic batch writes, and bounded range scans.  Keys
//! compare bytewise.  Live tailing is layered above this contract by the
//! indexer, which observes every committed write.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend: {0}")]
    Backend(String),
    #[error("kv corrupt: {0}")]
    Corrupt(String),
    #[error("kv closed")]
    Closed,
    #[error("kv codec: {0}")]
    Codec(String),
}

/// One mutation in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

/// Bounds for a range scan. Unset bounds are unbounded.
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    /// Exclusive lower bound.
    pub gt: Option<Vec<u8>>,
    /// Inclusive lower bound.
    pub gte: Option<Vec<u8>>,
    /// Exclusive upper bound.
    pub lt: Option<Vec<u8>>,
    /// Inclusive upper bound.
    pub lte: Option<Vec<u8>>,
}

impl KeyRange {
    /// True when `key` satisfies every configured bound.
    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(b) = &self.gt {
            if key <= b.as_slice() {
                return false;
            }
        }
        if let Some(b) = &self.gte {
            if key < b.as_slice() {
                return false;
            }
        }
        if let Some(b) = &self.lt {
            if key >= b.as_slice() {
                return false;
            }
        }
        if let Some(b) = &self.lte {
            if key > b.as_slice() {
                return false;
            }
        }
        true
    }
}

/// An exclusively owned, ordered KV namespace.
///
/// Operations are synchronous; callers hold them only for short, bounded
/// critical sections.
pub trait Kv: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Apply `batch` atomically: either every op commits or none does.
    fn write(&self, batch: Vec<KvOp>) -> Result<(), KvError>;

    /// Scan `range` in key order (reverse order when `reverse`).
    fn scan(&self, range: &KeyRange, reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;

    /// Close the namespace. Idempotent; subsequent operations fail with
    /// [`KvError::Closed`].
    fn close(&self) -> Result<(), KvError>;
}
