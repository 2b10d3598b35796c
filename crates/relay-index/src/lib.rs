// relay-index: Materialized-view indexer over an append-only change feed.
//
// An indexer folds filtered feed entries into one durable state row per
// primary key, maintains ordered secondary indexes derived from that state,
// and emits live updates to downstream readers.  Views are pure projections
// of the feed: destroying the backing namespace and replaying from index 0
// reproduces them exactly.

pub mod indexer;
pub mod keys;
pub mod sqlite;

pub use indexer::{
    Commit, IndexEntry, IndexHandle, IndexSpec, Indexer, Projection, ReadOptions,
};
pub use keys::{composite, fragment_ok, hex_lexint, KEY_END, SEP, SEP_STR};
pub use sqlite::SqliteKv;
