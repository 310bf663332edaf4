//! The ordered document tree.
//!
//! ```text
//! Node ── IndexMap<key, Value>
//!           │
//!           ├── "name"  → Value::String
//!           ├── "age"   → Value::Number
//!           └── "posts" → Value::Node ── IndexMap<key, Value> ...
//! ```
//!
//! A key's **priority** is its position in the map. Positions are always a
//! dense permutation of `[0, len)`: inserting appends, removing shifts later
//! keys down, and [`Node::set_index_of`] moves a key while shifting the keys
//! in between. Children are owned exclusively by their parent, so the tree
//! can't share or cycle.
//!
//! `null` is never stored. Writing [`Value::Null`] under a key removes it.

use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;

use crate::path::Path;

/// A value stored in the tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Node(Node),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Value::Node(_))
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// True for a node with at least one child.
    pub fn has_children(&self) -> bool {
        self.as_node().is_some_and(Node::has_children)
    }

    /// Number of direct children (0 for scalars).
    pub fn child_count(&self) -> usize {
        self.as_node().map_or(0, Node::len)
    }

    /// Follow a dotted field chain (`["address", "city"]`) into nested nodes.
    pub fn lookup(&self, fields: &[String]) -> Option<&Value> {
        let mut current = self;
        for field in fields {
            current = current.as_node()?.get(field)?;
        }
        Some(current)
    }

    /// Turn `self` into an empty node unless it already is one.
    pub fn ensure_node(&mut self) -> &mut Node {
        if !self.is_node() {
            *self = Value::Node(Node::new());
        }
        match self {
            Value::Node(node) => node,
            _ => unreachable!("value was just replaced with a node"),
        }
    }

    /// Convert to a JSON value, keeping child order.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Node(node) => node.to_json(),
        }
    }

    /// Convert from JSON. Objects become nodes in document order, arrays
    /// become nodes keyed `"0"`, `"1"`, ...; `null` members are dropped.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                let mut node = Node::new();
                for (i, item) in items.into_iter().enumerate() {
                    node.put(i.to_string(), Value::from_json(item));
                }
                Value::Node(node)
            }
            serde_json::Value::Object(map) => {
                let mut node = Node::new();
                for (key, item) in map {
                    node.put(key, Value::from_json(item));
                }
                Value::Node(node)
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        Value::Node(node)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Node(node) => node.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

/// One entry of a subtree listing: `value` sits under `key` inside the node
/// at `parent`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtreeEntry {
    pub parent: Path,
    pub key: String,
    pub value: Value,
}

/// An ordered tree node.
#[derive(Debug, Clone, Default)]
pub struct Node {
    children: IndexMap<String, Value>,
}

impl PartialEq for Node {
    // Order matters: two nodes with the same entries at different
    // priorities are different trees.
    fn eq(&self, other: &Self) -> bool {
        self.children.len() == other.children.len()
            && self.children.iter().zip(other.children.iter()).all(|(a, b)| a == b)
    }
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn has(&self, key: &str) -> bool {
        self.children.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.children.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.children.get_mut(key)
    }

    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.get(key).and_then(Value::as_node)
    }

    /// Keys in priority order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Entries in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Consume the node, yielding entries in priority order.
    pub fn into_entries(self) -> impl Iterator<Item = (String, Value)> {
        self.children.into_iter()
    }

    /// The priority rank of `key`.
    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.children.get_index_of(key)
    }

    /// The key holding priority rank `priority`.
    pub fn key_at(&self, priority: usize) -> Option<&str> {
        self.children.get_index(priority).map(|(k, _)| k.as_str())
    }

    /// The key immediately before `key` in priority order.
    pub fn prev_sibling_name(&self, key: &str) -> Option<String> {
        match self.index_of(key)? {
            0 => None,
            i => self.key_at(i - 1).map(str::to_string),
        }
    }

    /// Store `value` under `key`. An existing key keeps its priority, a new
    /// key goes last. Storing `Null` removes the key.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        if value.is_null() {
            return self.remove(&key);
        }
        self.children.insert(key, value)
    }

    /// Store `value` under `key` and move it to `priority` (clamped to the
    /// last slot). `None` behaves like [`Node::put`].
    pub fn put_with_index(
        &mut self,
        key: impl Into<String>,
        value: Value,
        priority: Option<usize>,
    ) -> Option<Value> {
        let key = key.into();
        let previous = self.put(key.clone(), value);
        if let Some(priority) = priority {
            self.set_index_of(&key, priority);
        }
        previous
    }

    /// Move `key` to `priority`, shifting the keys in between. Returns false
    /// if the key does not exist.
    pub fn set_index_of(&mut self, key: &str, priority: usize) -> bool {
        let Some(from) = self.index_of(key) else {
            return false;
        };
        let to = priority.min(self.children.len() - 1);
        if from != to {
            self.children.move_index(from, to);
        }
        true
    }

    /// Remove `key`, closing the gap in the priority ranks.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.children.shift_remove(key)
    }

    /// The value at `path` below this node. The empty path has no value
    /// slot (use [`Node::get_node_for_path`] for the node itself).
    pub fn get_object_for_path(&self, path: &Path) -> Option<&Value> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.get_node(segment)?;
        }
        current.get(last)
    }

    /// A clone of the value at `path`, including the root.
    pub fn value_at(&self, path: &Path) -> Option<Value> {
        if path.is_empty() {
            return Some(Value::Node(self.clone()));
        }
        self.get_object_for_path(path).cloned()
    }

    /// The node at `path`, if every segment leads through a node.
    pub fn get_node_for_path(&self, path: &Path) -> Option<&Node> {
        let mut current = self;
        for segment in path.segments() {
            current = current.get_node(segment)?;
        }
        Some(current)
    }

    /// The node at `path`, creating missing (or scalar) intermediates as
    /// empty nodes. Records nothing; callers own change-log bookkeeping.
    pub fn node_for_path_mut(&mut self, path: &Path) -> &mut Node {
        let mut current = self;
        for segment in path.segments() {
            current = current
                .children
                .entry(segment.clone())
                .or_insert_with(|| Value::Node(Node::new()))
                .ensure_node();
        }
        current
    }

    pub fn path_exists(&self, path: &Path) -> bool {
        path.is_empty() || self.get_object_for_path(path).is_some()
    }

    /// Post-order listing of everything below this node, which lives at
    /// `base`. Nested nodes are listed after their own contents.
    pub fn subtree_entries(&self, base: &Path) -> Vec<SubtreeEntry> {
        let mut out = Vec::new();
        self.collect_subtree(base, &mut out);
        out
    }

    fn collect_subtree(&self, base: &Path, out: &mut Vec<SubtreeEntry>) {
        for (key, value) in &self.children {
            if let Value::Node(child) = value {
                child.collect_subtree(&base.append(key.clone()), out);
            }
            out.push(SubtreeEntry {
                parent: base.clone(),
                key: key.clone(),
                value: value.clone(),
            });
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .children
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    /// Build a node from a JSON object. Any other JSON type is a type
    /// mismatch and yields `None`.
    pub fn from_json(json: serde_json::Value) -> Option<Self> {
        match Value::from_json(json) {
            Value::Node(node) => Some(node),
            _ => None,
        }
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.children.len()))?;
        for (key, value) in &self.children {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Node::from_json(json).ok_or_else(|| serde::de::Error::custom("expected a JSON object"))
    }
}
