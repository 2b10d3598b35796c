// ctx-relay: Context-based message re-sharing over a node's append-only
// object log.
//
// Declare that a context (an application-defined grouping key carried by
// messages) is shared with a recipient, and the engine forwards every
// past and future message bearing that context to them, once, in the order
// this node observed them, resuming correctly across restarts.
//
// The engine is a pair of materialized views over the node's change feed
// (per-message metadata, per-pair share state) plus a forwarding
// controller tailing them. The views are pure projections: the feed is the
// only ground truth, and both can be rebuilt from it at any time.

pub mod engine;
pub mod error;
pub mod hooks;
pub mod views;
pub mod worker;

mod controller;

pub use engine::{Engine, Options, ShareRequest};
pub use error::EngineError;
pub use hooks::{default_context, default_message_seq, ContextFn, MessageSeqFn};
pub use views::{MessageRow, ShareRow};
pub use worker::{Delivery, SendWorker, Worker};
