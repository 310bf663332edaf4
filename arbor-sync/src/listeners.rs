//! Which (path, event type) pairs a connection is listening to.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use arbor_core::{ChangeLogEntry, Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    ChildAdded,
    ChildChanged,
    ChildRemoved,
    ChildMoved,
    Value,
    /// Generic broadcasts sent with the `event` event type.
    Event,
}

impl ListenerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerKind::ChildAdded => "child_added",
            ListenerKind::ChildChanged => "child_changed",
            ListenerKind::ChildRemoved => "child_removed",
            ListenerKind::ChildMoved => "child_moved",
            ListenerKind::Value => "value",
            ListenerKind::Event => "event",
        }
    }

    /// The kind of listener a change-log entry is delivered to.
    pub fn for_entry(entry: &ChangeLogEntry) -> Self {
        match entry {
            ChangeLogEntry::ChildAdded(_) => ListenerKind::ChildAdded,
            ChangeLogEntry::ChildChanged(_) => ListenerKind::ChildChanged,
            ChangeLogEntry::ChildRemoved(_) => ListenerKind::ChildRemoved,
            ChangeLogEntry::ChildMoved(_) => ListenerKind::ChildMoved,
            ChangeLogEntry::ValueChanged(_) => ListenerKind::Value,
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListenerKind {
    type Err = arbor_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "child_added" => Ok(ListenerKind::ChildAdded),
            "child_changed" => Ok(ListenerKind::ChildChanged),
            "child_removed" => Ok(ListenerKind::ChildRemoved),
            "child_moved" => Ok(ListenerKind::ChildMoved),
            "value" => Ok(ListenerKind::Value),
            "event" => Ok(ListenerKind::Event),
            other => Err(arbor_core::Error::MalformedPayload(format!(
                "unknown listener type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListenerRegistry {
    listeners: HashMap<Path, HashSet<ListenerKind>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the listener was already attached.
    pub fn add(&mut self, path: Path, kind: ListenerKind) -> bool {
        self.listeners.entry(path).or_default().insert(kind)
    }

    pub fn remove(&mut self, path: &Path, kind: ListenerKind) -> bool {
        let Some(kinds) = self.listeners.get_mut(path) else {
            return false;
        };
        let removed = kinds.remove(&kind);
        if kinds.is_empty() {
            self.listeners.remove(path);
        }
        removed
    }

    pub fn has(&self, path: &Path, kind: ListenerKind) -> bool {
        self.listeners.get(path).is_some_and(|kinds| kinds.contains(&kind))
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Number of (path, kind) pairs.
    pub fn len(&self) -> usize {
        self.listeners.values().map(HashSet::len).sum()
    }
}
