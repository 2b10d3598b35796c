//! Share view: cursor state per (context, recipient) pair.
//!
//! Control records flip the pair active/inactive; observed objects advance
//! the cursor.  The key mechanism preventing re-forwarding after a restart
//! lives here: when the node logs an outbound wrapper carrying a message we
//! already indexed, the entry is routed to the pair under the *inner*
//! message's context and credited at the inner message's own observation
//! sequence, so the pair's tail resumes above it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use relay_index::indexer::Projection;
use relay_index::keys::{composite, fragment_ok, SEP_STR};
use relay_types::entry::{ChangeEntry, ObjectValue, Payload, MESSAGE_TYPE};
use relay_types::node::{Keeper, Objects};

use crate::hooks::{ContextFn, MessageSeqFn};

/// Name of the active-pairs secondary index ("context for recipient").
pub const CFR_INDEX: &str = "cfr";

/// Primary row of the share view, keyed by `context + ":" + recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRow {
    pub context: String,
    pub recipient: String,
    /// `None` until the first control record for the pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// Greatest accounted sequence; forwarding resumes strictly above it.
    pub seq: u64,
}

impl ShareRow {
    pub fn primary_key(context: &str, recipient: &str) -> String {
        format!("{context}:{recipient}")
    }
}

/// Index key: `context SEP recipient SEP`, for active pairs only.
///
/// The trailing separator makes an exact-prefix read match exactly one
/// pair.
pub fn cfr_index_key(row: &ShareRow) -> Option<String> {
    if row.active != Some(true) || row.context.is_empty() {
        return None;
    }
    let mut key = composite(&[&row.context, &row.recipient]);
    key.push_str(SEP_STR);
    Some(key)
}

/// Projection configuration for the share view.
pub struct ShareProjection {
    keeper: Arc<dyn Keeper>,
    objects: Arc<dyn Objects>,
    get_context: ContextFn,
    get_message_seq: MessageSeqFn,
    closed: Arc<AtomicBool>,
}

impl ShareProjection {
    pub fn new(
        keeper: Arc<dyn Keeper>,
        objects: Arc<dyn Objects>,
        get_context: ContextFn,
        get_message_seq: MessageSeqFn,
        closed: Arc<AtomicBool>,
    ) -> Self {
        ShareProjection {
            keeper,
            objects,
            get_context,
            get_message_seq,
            closed,
        }
    }

    /// The object a `newobj` entry is accounted under.
    ///
    /// When the observed object wraps another message, the pair is keyed by
    /// the wrapped (inner) message's context, taken from its hydrated
    /// record; otherwise by the observed object itself.
    fn routing_base<'a>(value: &'a ObjectValue) -> Option<&'a ObjectValue> {
        match value.objectinfo.as_deref() {
            Some(info) if info.object_type == MESSAGE_TYPE => {
                info.entry.as_deref().map(|record| &record.value)
            }
            _ => Some(value),
        }
    }

    fn context_of(&self, value: &ObjectValue) -> Option<String> {
        let base = Self::routing_base(value)?;
        let context = (self.get_context)(base)?;
        (fragment_ok(&context)).then_some(context)
    }
}

impl Projection for ShareProjection {
    type State = ShareRow;

    fn filter(&self, entry: &ChangeEntry) -> bool {
        matches!(
            entry.value,
            Payload::NewObj(_) | Payload::ShareCtx(_) | Payload::UnshareCtx(_)
        )
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
        // Second tier: the observed object wraps a message we may have
        // indexed ourselves. Hydrate the inner message's own record so the
        // reduce step can credit its observation sequence.
        if let Some(info) = value.objectinfo.as_deref_mut() {
            if info.object_type == MESSAGE_TYPE {
                let record = self.objects.get(&info.link).await.ok().flatten()?;
                info.entry = Some(Box::new(record));
            }
        }
        Some(entry)
    }

    fn primary_key(&self, entry: &ChangeEntry) -> Option<String> {
        match &entry.value {
            Payload::ShareCtx(s) => Some(ShareRow::primary_key(&s.context, &s.recipient)),
            Payload::UnshareCtx(u) => Some(ShareRow::primary_key(&u.context, &u.recipient)),
            Payload::NewObj(value) => {
                let context = self.context_of(value)?;
                Some(ShareRow::primary_key(&context, &value.recipient))
            }
        }
    }

    fn reduce(&self, prev: Option<&ShareRow>, entry: &ChangeEntry) -> Option<ShareRow> {
        match &entry.value {
            Payload::NewObj(value) => {
                let mut next = match prev {
                    Some(row) => row.clone(),
                    None => ShareRow {
                        context: self.context_of(value)?,
                        recipient: value.recipient.clone(),
                        active: None,
                        seq: 0,
                    },
                };
                let observed = if value.wraps_message() {
                    // Credit the original message, not the wrapper.
                    let record = value.objectinfo.as_deref()?.entry.as_deref()?;
                    (self.get_message_seq)(&ChangeEntry {
                        change: record.change,
                        value: Payload::NewObj(record.value.clone()),
                    })
                } else {
                    (self.get_message_seq)(entry)
                };
                // The cursor never rewinds.
                next.seq = next.seq.max(observed);
                Some(next)
            }
            Payload::ShareCtx(s) => {
                let mut next = prev.cloned().unwrap_or(ShareRow {
                    context: s.context.clone(),
                    recipient: s.recipient.clone(),
                    active: None,
                    // The starting cursor applies only on the first share
                    // for a pair.
                    seq: s.seq,
                });
                next.active = Some(true);
                Some(next)
            }
            Payload::UnshareCtx(_) => {
                // Unshare before any share is a no-op.
                let mut next = prev?.clone();
                next.active = Some(false);
                Some(next)
            }
        }
    }
}
