//! Inbound events: the unit that is sequenced, journaled and replayed.
//!
//! Wire form (JSON):
//!
//! ```json
//! {"type": "set", "path": "/users/1", "payload": {"name": "Ann"}, "auth": {"id": "1"}}
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::{Error, Result};
use crate::node::{Node, Value};
use crate::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "push")]
    Push,
    #[serde(rename = "remove")]
    Remove,
    #[serde(rename = "setPriority")]
    SetPriority,
    /// A broadcast to every connection; never touches the tree.
    #[serde(rename = "event")]
    Event,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Set => "set",
            EventType::Update => "update",
            EventType::Push => "push",
            EventType::Remove => "remove",
            EventType::SetPriority => "setPriority",
            EventType::Event => "event",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, EventType::Event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Node>,
    /// Child name for `push`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    /// Set on events re-applied from the journal. Never serialized.
    #[serde(skip)]
    pub from_history: bool,
}

impl Event {
    fn new(event_type: EventType, path: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            path: path.into(),
            payload,
            auth: None,
            name: None,
            priority: None,
            from_history: false,
        }
    }

    pub fn set(path: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::new(EventType::Set, path, payload.into())
    }

    pub fn update(path: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::new(EventType::Update, path, payload.into())
    }

    /// A push under `path`. The child name is generated now, so replaying
    /// the journaled event recreates the same child.
    pub fn push(path: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::push_named(path, Uuid::new_v4().simple().to_string(), payload)
    }

    pub fn push_named(path: impl Into<String>, name: impl Into<String>, payload: impl Into<Value>) -> Self {
        let mut event = Self::new(EventType::Push, path, payload.into());
        event.name = Some(name.into());
        event
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(EventType::Remove, path, Value::Null)
    }

    pub fn set_priority(path: impl Into<String>, priority: i64) -> Self {
        Self::new(EventType::SetPriority, path, Value::Null).with_priority(priority)
    }

    pub fn broadcast(path: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::new(EventType::Event, path, payload.into())
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_auth(mut self, auth: Option<Node>) -> Self {
        self.auth = auth;
        self
    }

    pub fn auth_context(&self) -> AuthContext {
        AuthContext::from(self.auth.clone())
    }

    /// The priority as a rank. Negative priorities mean "unset".
    pub fn priority_rank(&self) -> Option<usize> {
        self.priority.and_then(|p| usize::try_from(p).ok())
    }

    /// The path the event applies to: `path/name` for a push, `path`
    /// otherwise.
    pub fn target_path(&self) -> Result<Path> {
        let base = Path::parse(&self.path)?;
        match self.event_type {
            EventType::Push => {
                let name = self.name.as_deref().ok_or_else(|| {
                    Error::MalformedPayload("push without a child name".to_string())
                })?;
                let child = Path::parse(name)?;
                if child.len() != 1 {
                    return Err(Error::InvalidPath {
                        path: name.to_string(),
                        reason: "push name must be a single segment".to_string(),
                    });
                }
                Ok(base.join(&child))
            }
            _ => Ok(base),
        }
    }

    /// Reject events that can never apply: bad paths, an update whose
    /// payload is not an object, a scalar written at the root, a priority
    /// change without a priority.
    pub fn validate(&self) -> Result<Path> {
        let target = self.target_path()?;
        match self.event_type {
            EventType::Update if !self.payload.is_node() => {
                return Err(Error::TypeMismatch {
                    path: target.to_string(),
                    expected: "object payload for update",
                })
            }
            EventType::Set | EventType::Push
                if target.is_empty() && !self.payload.is_node() && !self.payload.is_null() =>
            {
                return Err(Error::TypeMismatch {
                    path: target.to_string(),
                    expected: "object payload at the root",
                })
            }
            EventType::SetPriority if self.priority_rank().is_none() => {
                return Err(Error::MalformedPayload(
                    "setPriority needs a non-negative priority".to_string(),
                ))
            }
            EventType::SetPriority if target.is_empty() => {
                return Err(Error::InvalidPath {
                    path: self.path.clone(),
                    reason: "the root has no priority".to_string(),
                })
            }
            _ => {}
        }
        Ok(target)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MalformedPayload(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedPayload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let event = Event::set("/users/1", json!({"name": "Ann"}))
            .with_auth(Node::from_json(json!({"id": "1"})));
        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"type": "set", "path": "/users/1", "payload": {"name": "Ann"}, "auth": {"id": "1"}})
        );
    }

    #[test]
    fn test_decode_from_history_flag_not_carried() {
        let mut event = Event::remove("/a");
        event.from_history = true;
        let back = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert!(!back.from_history);
        assert_eq!(back.event_type, EventType::Remove);
        assert!(back.payload.is_null());
    }

    #[test]
    fn test_set_priority_type_name() {
        let event = Event::set_priority("/list/a", 2);
        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "setPriority");
        assert_eq!(event.priority_rank(), Some(2));
    }

    #[test]
    fn test_push_generates_name_once() {
        let event = Event::push("/posts", json!({"t": 1}));
        let name = event.name.clone().unwrap();
        assert_eq!(event.target_path().unwrap().to_string(), format!("/posts/{name}"));
        let replayed = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(replayed.target_path().unwrap(), event.target_path().unwrap());
    }

    #[test]
    fn test_validate() {
        assert!(Event::set("/a", 1).validate().is_ok());
        assert!(matches!(Event::set("/a.b", 1).validate(), Err(Error::InvalidPath { .. })));
        assert!(matches!(Event::update("/a", 1).validate(), Err(Error::TypeMismatch { .. })));
        assert!(matches!(Event::set("/", 1).validate(), Err(Error::TypeMismatch { .. })));
        assert!(Event::set("/", json!({"a": 1})).validate().is_ok());
        assert!(Event::set_priority("/a", -1).validate().is_err());
        assert!(Event::push_named("/a", "x/y", 1).validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(Event::from_json(b"{\"type\": \"nope\"}"), Err(Error::MalformedPayload(_))));
        assert!(Event::from_json(b"not json").is_err());
    }
}
