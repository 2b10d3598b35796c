// relay-types: Wire types and external contracts for the context relay engine.
//
// Everything the engine consumes from the outside world is declared here:
// the change-feed entry model, the node service traits (feed, keeper,
// object metadata, outbound send), and the ordered key-value contract that
// backs the materialized views.

pub mod entry;
pub mod kv;
pub mod node;

pub use entry::{
    ChangeEntry, ObjectInfo, ObjectRecord, ObjectValue, Payload, ShareCtx, UnshareCtx,
    MESSAGE_TYPE, TYPE_FIELD,
};
pub use kv::{KeyRange, Kv, KvError, KvOp};
pub use node::{Feed, Keeper, Node, NodeError, Objects, Sender};
