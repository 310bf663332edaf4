//! Outbound wire messages.
//!
//! Wire format (JSON text, one object per message):
//! ```text
//! {"type": "child_added", "name": "1", "path": "/users", "parent": "/",
//!  "payload": {"name": "Ann"}, "hasChildren": true, "numChildren": 1,
//!  "priority": 0, "prevChildName": null}
//! ```
//!
//! For child and query messages `path` is the node the listener is attached
//! to and `name` the child's key under it. For `value` messages `path` is
//! the value's own path. `path` and `parent` carry the connection's base
//! path as a prefix.

use arbor_core::{ChildEntry, MovedEntry, Path, RemovedEntry, Value, ValueEntry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ChildAdded,
    ChildChanged,
    ChildRemoved,
    ChildMoved,
    Value,
    QueryChildAdded,
    QueryChildChanged,
    QueryChildRemoved,
    Event,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ChildAdded => "child_added",
            MessageType::ChildChanged => "child_changed",
            MessageType::ChildRemoved => "child_removed",
            MessageType::ChildMoved => "child_moved",
            MessageType::Value => "value",
            MessageType::QueryChildAdded => "query_child_added",
            MessageType::QueryChildChanged => "query_child_changed",
            MessageType::QueryChildRemoved => "query_child_removed",
            MessageType::Event => "event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_children: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_children: Option<usize>,
    /// Rank among siblings; -1 when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_child_name: Option<String>,
    /// The query a `query_child_*` message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl OutboundMessage {
    fn bare(msg_type: MessageType, path: String, payload: Value) -> Self {
        Self {
            msg_type,
            name: None,
            path,
            parent: None,
            payload,
            has_children: None,
            num_children: None,
            priority: None,
            prev_child_name: None,
            query: None,
        }
    }

    /// `child_added` / `child_changed` for a change-log child entry.
    /// `payload` is the already-redacted value.
    pub fn child(msg_type: MessageType, base: &str, entry: &ChildEntry, payload: Value) -> Self {
        let mut msg = Self::bare(msg_type, render_path(base, &entry.path), payload);
        msg.name = Some(entry.name.clone());
        msg.parent = Some(render_path(base, &entry.parent_path));
        msg.has_children = Some(entry.has_children);
        msg.num_children = Some(entry.num_children);
        msg.priority = Some(rank(entry.priority));
        msg.prev_child_name = entry.prev_sibling_name.clone();
        msg
    }

    pub fn child_removed(base: &str, entry: &RemovedEntry, payload: Value) -> Self {
        let mut msg = Self::bare(MessageType::ChildRemoved, render_path(base, &entry.path), payload);
        msg.name = Some(entry.name.clone());
        msg
    }

    pub fn child_moved(base: &str, entry: &MovedEntry, payload: Value) -> Self {
        let mut msg = Self::bare(MessageType::ChildMoved, render_path(base, &entry.path), payload);
        msg.name = Some(entry.name.clone());
        msg.parent = Some(render_path(base, &entry.parent_path));
        msg.has_children = Some(msg.payload.has_children());
        msg.num_children = Some(msg.payload.child_count());
        msg.priority = Some(rank(Some(entry.priority)));
        msg.prev_child_name = entry.prev_sibling_name.clone();
        msg
    }

    pub fn value(base: &str, entry: &ValueEntry, payload: Value) -> Self {
        let mut msg = Self::bare(MessageType::Value, render_path(base, &entry.path), payload);
        msg.name = Some(entry.name.clone());
        msg.parent = Some(render_path(base, &entry.parent_path));
        msg.priority = Some(rank(entry.priority));
        msg.prev_child_name = entry.prev_sibling_name.clone();
        msg
    }

    /// `query_child_added` / `query_child_changed` for the child at `path`
    /// (a direct child of the query base).
    pub fn query_child(
        msg_type: MessageType,
        base: &str,
        query: &str,
        path: &Path,
        payload: Value,
        priority: Option<usize>,
    ) -> Self {
        let node_path = path.parent();
        let mut msg = Self::bare(msg_type, render_path(base, &node_path), payload);
        msg.name = path.last_element().map(str::to_string);
        msg.parent = Some(render_path(base, &node_path.parent()));
        msg.has_children = Some(msg.payload.has_children());
        msg.num_children = Some(msg.payload.child_count());
        msg.priority = Some(rank(priority));
        msg.query = Some(query.to_string());
        msg
    }

    pub fn query_child_removed(base: &str, query: &str, path: &Path, payload: Value) -> Self {
        let mut msg = Self::bare(
            MessageType::QueryChildRemoved,
            render_path(base, &path.parent()),
            payload,
        );
        msg.name = path.last_element().map(str::to_string);
        msg.query = Some(query.to_string());
        msg
    }

    /// A generic broadcast to `event` listeners.
    pub fn event(base: &str, path: &Path, payload: Value) -> Self {
        Self::bare(MessageType::Event, render_path(base, path), payload)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// `base` + `path`, with the root rendered as `/` when there is no base.
pub fn render_path(base: &str, path: &Path) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        }
    } else {
        format!("{base}{path}")
    }
}

fn rank(priority: Option<usize>) -> i64 {
    priority.and_then(|p| i64::try_from(p).ok()).unwrap_or(-1)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
