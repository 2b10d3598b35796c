//! The two materialized views: per-message metadata and per-pair share
//! state. Both are configured instances of the `relay-index` indexer.

pub mod message;
pub mod share;

pub use message::{context_index_key, context_tail_bounds, MessageProjection, MessageRow, CONTEXT_INDEX};
pub use share::{cfr_index_key, ShareProjection, ShareRow, CFR_INDEX};
