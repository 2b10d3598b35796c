//! Pluggable context extraction and sequence derivation.
//!
//! Applications decide what a "context" is.  The default reads the
//! `context` field off the resolved message body; a custom hook can derive
//! one from any envelope field (e.g. a conversation key built from author
//! and recipient).

use std::sync::Arc;

use relay_types::entry::{ChangeEntry, ObjectValue};

/// Extracts the grouping context from an observed message; `None` means the
/// message belongs to no context and is never re-shared.
pub type ContextFn = Arc<dyn Fn(&ObjectValue) -> Option<String> + Send + Sync>;

/// Derives the sequence a message is accounted under. The default is the
/// feed index at which the message was first observed locally.
pub type MessageSeqFn = Arc<dyn Fn(&ChangeEntry) -> u64 + Send + Sync>;

/// Default context: the `context` field of the resolved message body.
pub fn default_context(value: &ObjectValue) -> Option<String> {
    value
        .object
        .as_ref()?
        .get("context")?
        .as_str()
        .map(str::to_owned)
}

/// Default sequence: the entry's feed index.
pub fn default_message_seq(entry: &ChangeEntry) -> u64 {
    entry.change
}
