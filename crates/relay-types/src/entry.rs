//! Change-feed entry model.
//!
//! The node's append-only log yields [`ChangeEntry`] values: a monotonic
//! `change` index assigned by the feed, plus a payload discriminated by its
//! `topic` field.  `newobj` announces an observed object; `sharectx` and
//! `unsharectx` are control records appended by the engine itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type tag carried by message-envelope objects.
pub const MESSAGE_TYPE: &str = "relay.message";

/// Field name holding an object body's declared type.
pub const TYPE_FIELD: &str = "type";

/// One entry of the append-only change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Monotonic index assigned by the feed.
    pub change: u64,
    pub value: Payload,
}

/// Feed payload, discriminated by `topic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum Payload {
    /// A newly observed object.
    #[serde(rename = "newobj")]
    NewObj(ObjectValue),
    /// Control record: start sharing a context with a recipient.
    #[serde(rename = "sharectx")]
    ShareCtx(ShareCtx),
    /// Control record: stop sharing a context with a recipient.
    #[serde(rename = "unsharectx")]
    UnshareCtx(UnshareCtx),
}

impl Payload {
    /// The observed object, when this is a `newobj` entry.
    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            Payload::NewObj(v) => Some(v),
            _ => None,
        }
    }
}

/// An observed object as announced on the feed.
///
/// `object` is the resolved body; the feed never carries it. It is attached
/// during view preprocessing by a keeper lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    /// The object's declared kind (body `type` field).
    #[serde(rename = "type")]
    pub object_type: String,
    /// Content address of the object; stable identifier.
    pub permalink: String,
    /// Address of this version. Equal to `permalink` for immutable messages.
    pub link: String,
    /// Author identity on the envelope; may be empty.
    #[serde(default)]
    pub author: String,
    /// Recipient identity on the envelope; may be empty.
    #[serde(default)]
    pub recipient: String,
    /// Metadata about the referenced object, when this object is a message
    /// envelope wrapping another object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objectinfo: Option<Box<ObjectInfo>>,
    /// Resolved body; populated by preprocessing, never by the feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
}

impl ObjectValue {
    /// True when the resolved body wraps an inner object that is itself a
    /// message envelope (the on-the-wire form of a forwarded message).
    pub fn wraps_message(&self) -> bool {
        self.object
            .as_ref()
            .and_then(|body| body.get("object"))
            .and_then(|inner| inner.get(TYPE_FIELD))
            .and_then(Value::as_str)
            == Some(MESSAGE_TYPE)
    }
}

/// Metadata about the object a message envelope references.
///
/// For a forwarded message the referenced object is itself a message; share
/// view preprocessing then hydrates `entry` with the referenced message's
/// own indexed record so the original observation index is reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    #[serde(rename = "type")]
    pub object_type: String,
    pub permalink: String,
    pub link: String,
    /// Hydrated indexed record of the referenced object. Process-local.
    #[serde(skip)]
    pub entry: Option<Box<ObjectRecord>>,
}

/// An indexed object as returned by the node's metadata store: the object
/// value together with the feed index at which it was first observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub change: u64,
    pub value: ObjectValue,
}

/// `sharectx` control record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareCtx {
    pub context: String,
    pub recipient: String,
    /// Starting cursor; 0 means from the beginning. Applies only on the
    /// first share for a pair.
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// `unsharectx` control record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnshareCtx {
    pub context: String,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
}
