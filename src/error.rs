//! Engine error taxonomy.

use thiserror::Error;

use relay_types::kv::KvError;
use relay_types::node::NodeError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// `position`/`messages` for a pair with no active share record.
    #[error("context is not shared with this recipient")]
    NotShared,
    /// Missing or malformed required field on a public call.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    /// Operation after `close`.
    #[error("engine closed")]
    Closed,
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Node(#[from] NodeError),
}
