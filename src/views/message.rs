//! Message view: one immutable row per observed message.
//!
//! Rows are keyed by permalink and record the context, original recipient,
//! and the sequence under which the message is accounted. The `context`
//! secondary index orders rows by `(context, seq, permalink)` and is what
//! forwarding sessions tail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use relay_index::indexer::Projection;
use relay_index::keys::{composite, fragment_ok, hex_lexint, KEY_END, SEP};
use relay_types::entry::{ChangeEntry, Payload, MESSAGE_TYPE};
use relay_types::node::Keeper;

use crate::hooks::{ContextFn, MessageSeqFn};

/// Name of the `(context, seq, permalink)` secondary index.
pub const CONTEXT_INDEX: &str = "context";

/// Primary row of the message view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub permalink: String,
    pub context: String,
    /// Recipient identity on the original message; may be empty.
    pub recipient: String,
    /// Feed index at which this message was first observed locally.
    pub seq: u64,
}

/// Index key: `context SEP hex(seq) SEP permalink`.
pub fn context_index_key(row: &MessageRow) -> Option<String> {
    Some(composite(&[
        &row.context,
        &hex_lexint(row.seq),
        &row.permalink,
    ]))
}

/// Bounds for tailing a context strictly above `seq`.
///
/// The lower bound ends in [`KEY_END`], which sorts after every real key at
/// exactly `seq`, so the message accounted at the cursor itself is excluded.
pub fn context_tail_bounds(context: &str, seq: u64) -> (Vec<u8>, Vec<u8>) {
    let mut gt = context.as_bytes().to_vec();
    gt.push(SEP);
    gt.extend_from_slice(hex_lexint(seq).as_bytes());
    gt.push(KEY_END);

    let mut lt = context.as_bytes().to_vec();
    lt.push(SEP);
    lt.push(KEY_END);
    (gt, lt)
}

/// Projection configuration for the message view.
pub struct MessageProjection {
    keeper: Arc<dyn Keeper>,
    get_context: ContextFn,
    get_message_seq: MessageSeqFn,
    closed: Arc<AtomicBool>,
}

impl MessageProjection {
    pub fn new(
        keeper: Arc<dyn Keeper>,
        get_context: ContextFn,
        get_message_seq: MessageSeqFn,
        closed: Arc<AtomicBool>,
    ) -> Self {
        MessageProjection {
            keeper,
            get_context,
            get_message_seq,
            closed,
        }
    }
}

impl Projection for MessageProjection {
    type State = MessageRow;

    fn filter(&self, entry: &ChangeEntry) -> bool {
        matches!(&entry.value, Payload::NewObj(v) if v.object_type == MESSAGE_TYPE)
    }

    async fn preprocess(&self, mut entry: ChangeEntry) -> Option<ChangeEntry> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let Payload::NewObj(value) = &mut entry.value else {
            return Some(entry);
        };
        let body = self.keeper.get(&value.permalink).await.ok().flatten()?;
        value.object = Some(body);
        Some(entry)
    }

    fn primary_key(&self, entry: &ChangeEntry) -> Option<String> {
        entry.value.as_object().map(|v| v.permalink.clone())
    }

    fn reduce(&self, prev: Option<&MessageRow>, entry: &ChangeEntry) -> Option<MessageRow> {
        // First writer wins: re-observation of a permalink never changes
        // its row.
        if let Some(prev) = prev {
            return Some(prev.clone());
        }
        let value = entry.value.as_object()?;
        let context = (self.get_context)(value)?;
        if !fragment_ok(&context) || !fragment_ok(&value.permalink) {
            return None;
        }
        Some(MessageRow {
            permalink: value.permalink.clone(),
            context,
            recipient: value.recipient.clone(),
            seq: (self.get_message_seq)(entry),
        })
    }
}
