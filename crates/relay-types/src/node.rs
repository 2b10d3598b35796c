//! Node service contracts consumed by the engine.
//!
//! The messaging node itself (identities, signing, transport) is outside
//! the engine. These traits cover exactly what the engine touches: the
//! append-only change feed, the content-addressed blob keeper, the indexed
//! object metadata store, outbound delivery, KV namespace creation, and a
//! shutdown signal.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::entry::{ChangeEntry, ObjectRecord, Payload};
use crate::kv::{Kv, KvError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("node closed")]
    Closed,
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// The node's append-only change log.
///
/// `tail` yields an ordered, gap-free stream of entries with
/// `change >= from`, continuing live as new entries are appended, and ends
/// when the node shuts down. Appends are serialized by the feed and yield
/// new stream entries.
#[async_trait]
pub trait Feed: Send + Sync + 'static {
    async fn append(&self, value: Payload) -> Result<u64, NodeError>;

    fn tail(&self, from: u64) -> BoxStream<'static, ChangeEntry>;
}

/// Content-addressed blob store. `get` is a pure, idempotent lookup;
/// `Ok(None)` means not (yet) resolvable.
#[async_trait]
pub trait Keeper: Send + Sync + 'static {
    async fn get(&self, permalink: &str) -> Result<Option<Value>, NodeError>;
}

/// Metadata store over previously indexed objects.
///
/// The returned record carries the object's resolved body and the feed
/// index at which this node first observed it.
#[async_trait]
pub trait Objects: Send + Sync + 'static {
    async fn get(&self, link: &str) -> Result<Option<ObjectRecord>, NodeError>;
}

/// Outbound delivery: wrap the object at `link` in a message envelope and
/// send it to `recipient`.
#[async_trait]
pub trait Sender: Send + Sync + 'static {
    async fn send(&self, link: &str, recipient: &str) -> Result<(), NodeError>;
}

/// The node surface the engine is constructed over.
pub trait Node: Send + Sync + 'static {
    /// Human-readable node name, for logging only.
    fn name(&self) -> String;

    /// Short identity form, for logging only.
    fn shortlink(&self) -> String;

    fn feed(&self) -> Arc<dyn Feed>;

    fn keeper(&self) -> Arc<dyn Keeper>;

    fn objects(&self) -> Arc<dyn Objects>;

    fn sender(&self) -> Arc<dyn Sender>;

    /// Create (or reopen) an exclusively owned KV namespace.
    fn create_db(&self, name: &str) -> Result<Arc<dyn Kv>, NodeError>;

    /// Shutdown signal; flips to `true` when the node is being destroyed.
    fn shutdown(&self) -> watch::Receiver<bool>;
}
