//! Change logs: the ordered list of fine-grained changes one mutation made.
//!
//! ```text
//! set /users/1 {"name": "Ann"}
//!      │
//!      ▼
//! ChangeLogBuilder::populate ── walks payload vs. tree, writes the tree
//!      │
//!      ▼
//! ChangeLog [ChildAdded /users/1:name, ValueChanged /users/1/name,
//!            ChildAdded /users:1, ValueChanged /users/1,
//!            ChildChanged /:users, ValueChanged /users, ValueChanged /]
//! ```
//!
//! Child entries (`ChildAdded`, `ChildChanged`, `ChildRemoved`,
//! `ChildMoved`) are addressed by the *parent* node path plus the child's
//! key, because that is where child listeners attach. `ValueChanged` is
//! addressed by the full path of the value itself.

use crate::node::{Node, Value};
use crate::path::Path;

/// A child appeared under, or changed inside, the node at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEntry {
    pub name: String,
    /// Path of the node that owns the child.
    pub path: Path,
    pub parent_path: Path,
    pub value: Value,
    pub has_children: bool,
    pub num_children: usize,
    pub prev_sibling_name: Option<String>,
    pub priority: Option<usize>,
}

impl ChildEntry {
    pub fn new(
        name: impl Into<String>,
        path: Path,
        value: Value,
        prev_sibling_name: Option<String>,
        priority: Option<usize>,
    ) -> Self {
        let parent_path = path.parent();
        Self {
            name: name.into(),
            path,
            parent_path,
            has_children: value.has_children(),
            num_children: value.child_count(),
            value,
            prev_sibling_name,
            priority,
        }
    }

    /// Full path of the child itself.
    pub fn child_path(&self) -> Path {
        self.path.append(self.name.clone())
    }
}

/// The value at `path` changed (or was removed, with `value == Null`).
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEntry {
    pub name: String,
    pub path: Path,
    pub parent_path: Path,
    pub value: Value,
    pub prev_sibling_name: Option<String>,
    pub priority: Option<usize>,
}

/// `name` (holding `value`) was removed from the node at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedEntry {
    pub name: String,
    pub path: Path,
    pub value: Value,
}

/// `name` moved to a new priority inside the node at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct MovedEntry {
    pub name: String,
    pub path: Path,
    pub parent_path: Path,
    pub prev_sibling_name: Option<String>,
    pub priority: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeLogEntry {
    ChildAdded(ChildEntry),
    ChildChanged(ChildEntry),
    ChildRemoved(RemovedEntry),
    ChildMoved(MovedEntry),
    ValueChanged(ValueEntry),
}

impl ChangeLogEntry {
    /// The listener event type this entry is delivered as.
    pub fn event_type(&self) -> &'static str {
        match self {
            ChangeLogEntry::ChildAdded(_) => "child_added",
            ChangeLogEntry::ChildChanged(_) => "child_changed",
            ChangeLogEntry::ChildRemoved(_) => "child_removed",
            ChangeLogEntry::ChildMoved(_) => "child_moved",
            ChangeLogEntry::ValueChanged(_) => "value",
        }
    }

    /// The path a listener must be attached at to receive this entry.
    pub fn listener_path(&self) -> &Path {
        match self {
            ChangeLogEntry::ChildAdded(e) | ChangeLogEntry::ChildChanged(e) => &e.path,
            ChangeLogEntry::ChildRemoved(e) => &e.path,
            ChangeLogEntry::ChildMoved(e) => &e.path,
            ChangeLogEntry::ValueChanged(e) => &e.path,
        }
    }

    /// Full path of the value the entry is about.
    pub fn affected_path(&self) -> Path {
        match self {
            ChangeLogEntry::ChildAdded(e) | ChangeLogEntry::ChildChanged(e) => e.child_path(),
            ChangeLogEntry::ChildRemoved(e) => e.path.append(e.name.clone()),
            ChangeLogEntry::ChildMoved(e) => e.path.append(e.name.clone()),
            ChangeLogEntry::ValueChanged(e) => e.path.clone(),
        }
    }
}

/// Ordered entries produced by one mutation, tagged with the mutation's
/// sequence number. Consumed once, by distribution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeLog {
    sequence: u64,
    entries: Vec<ChangeLogEntry>,
}

impl ChangeLog {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            entries: Vec::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ChangeLogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ChangeLogEntry> {
        self.entries
    }

    pub fn push(&mut self, entry: ChangeLogEntry) {
        self.entries.push(entry);
    }

    /// Insert `entry` at position `at`, used to put a parent's entry ahead
    /// of the entries recorded while recursing into it.
    pub fn insert(&mut self, at: usize, entry: ChangeLogEntry) {
        let at = at.min(self.entries.len());
        self.entries.insert(at, entry);
    }

    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    pub fn add_child_added(&mut self, entry: ChildEntry) {
        self.push(ChangeLogEntry::ChildAdded(entry));
    }

    pub fn add_child_changed(&mut self, entry: ChildEntry) {
        self.push(ChangeLogEntry::ChildChanged(entry));
    }

    pub fn add_child_removed(&mut self, path: Path, name: impl Into<String>, value: Value) {
        self.push(ChangeLogEntry::ChildRemoved(RemovedEntry {
            name: name.into(),
            path,
            value,
        }));
    }

    pub fn add_child_moved(&mut self, entry: MovedEntry) {
        self.push(ChangeLogEntry::ChildMoved(entry));
    }

    pub fn add_value_changed(&mut self, entry: ValueEntry) {
        self.push(ChangeLogEntry::ValueChanged(entry));
    }

    /// Distinct affected paths, in first-seen order.
    pub fn affected_paths(&self) -> Vec<Path> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .map(ChangeLogEntry::affected_path)
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    /// Affected paths with no affected descendant. The ancestor entries a
    /// deep write produces are dropped, so each change is named once.
    pub fn deepest_paths(&self) -> Vec<Path> {
        let all = self.affected_paths();
        all.iter()
            .filter(|p| !all.iter().any(|other| p.is_ancestor_of(other)))
            .cloned()
            .collect()
    }
}

/// How a payload node is merged into an existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keys missing from the payload are removed.
    Replace,
    /// Only keys present in the payload are touched.
    Merge,
}

/// Records changes for the node at `path` into a borrowed [`ChangeLog`].
///
/// The node itself is passed to each call rather than held, so a builder can
/// be derived for a child ([`ChangeLogBuilder::child`]) while the caller
/// keeps mutable access to the tree.
pub struct ChangeLogBuilder<'a> {
    log: &'a mut ChangeLog,
    path: Path,
}

impl<'a> ChangeLogBuilder<'a> {
    pub fn new(log: &'a mut ChangeLog, path: Path) -> Self {
        Self { log, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A builder for the child `name` of this builder's node.
    pub fn child(&mut self, name: &str) -> ChangeLogBuilder<'_> {
        ChangeLogBuilder {
            log: &mut *self.log,
            path: self.path.append(name),
        }
    }

    fn child_entry(&self, node: &Node, name: &str, value: &Value) -> ChildEntry {
        ChildEntry::new(
            name,
            self.path.clone(),
            value.clone(),
            node.prev_sibling_name(name),
            node.index_of(name),
        )
    }

    /// `name` was newly created in `node`.
    pub fn add_new(&mut self, node: &Node, name: &str, value: &Value) {
        let entry = self.child_entry(node, name, value);
        self.log.add_child_added(entry);
    }

    /// `name` changed in `node`: a child change plus a value change.
    pub fn add_change(&mut self, node: &Node, name: &str, value: &Value) {
        self.add_changed_node(node, name, value);
        self.add_value_changed(node, name, value);
    }

    /// Only the child-changed half of [`ChangeLogBuilder::add_change`].
    pub fn add_changed_node(&mut self, node: &Node, name: &str, value: &Value) {
        let entry = self.child_entry(node, name, value);
        self.log.add_child_changed(entry);
    }

    pub fn add_value_changed(&mut self, node: &Node, name: &str, value: &Value) {
        self.log.add_value_changed(ValueEntry {
            name: name.to_string(),
            path: self.path.append(name),
            parent_path: self.path.clone(),
            value: value.clone(),
            prev_sibling_name: node.prev_sibling_name(name),
            priority: node.index_of(name),
        });
    }

    /// `name` (holding `value`) is gone from this node. Everything below a
    /// removed node is listed first, deepest entries before their parents.
    pub fn add_removed(&mut self, name: &str, value: Value) {
        if let Value::Node(removed) = &value {
            self.add_removed_below(name, removed);
        }
        self.log.add_value_changed(ValueEntry {
            name: name.to_string(),
            path: self.path.append(name),
            parent_path: self.path.clone(),
            value: Value::Null,
            prev_sibling_name: None,
            priority: None,
        });
        self.log.add_child_removed(self.path.clone(), name, value);
    }

    /// Removal entries for the contents of `removed`, which lived under
    /// `name`, without an entry for `name` itself.
    pub fn add_removed_below(&mut self, name: &str, removed: &Node) {
        for entry in removed.subtree_entries(&self.path.append(name)) {
            self.log.add_child_removed(entry.parent, entry.key, entry.value);
        }
    }

    pub fn add_moved(&mut self, node: &Node, name: &str) {
        let Some(priority) = node.index_of(name) else {
            return;
        };
        self.log.add_child_moved(MovedEntry {
            name: name.to_string(),
            path: self.path.clone(),
            parent_path: self.path.parent(),
            prev_sibling_name: node.prev_sibling_name(name),
            priority,
        });
    }

    /// Write `payload` into `node` and record what changed.
    ///
    /// Every key is offered to `gate` first; a key the gate refuses is left
    /// untouched, together with everything below it. Keys whose value is
    /// unchanged produce no entries. A nested node payload recurses with
    /// [`WriteMode::Replace`], so the whole subtree below it ends up equal
    /// to the payload. Returns true if anything changed.
    pub fn populate(
        &mut self,
        node: &mut Node,
        payload: Node,
        mode: WriteMode,
        gate: &mut dyn FnMut(&Path, &Value) -> bool,
    ) -> bool {
        let start = self.log.len();

        if mode == WriteMode::Replace {
            let stale: Vec<String> = node
                .keys()
                .filter(|k| !payload.has(k))
                .map(str::to_string)
                .collect();
            for key in stale {
                if !gate(&self.path.append(key.as_str()), &Value::Null) {
                    continue;
                }
                if let Some(old) = node.remove(&key) {
                    self.add_removed(&key, old);
                }
            }
        }

        for (key, value) in payload.into_entries() {
            if !gate(&self.path.append(key.as_str()), &value) {
                log::debug!("Skipping unauthorized write at {}", self.path.append(key.as_str()));
                continue;
            }
            match value {
                Value::Null => {
                    if let Some(old) = node.remove(&key) {
                        self.add_removed(&key, old);
                    }
                }
                Value::Node(sub) => self.populate_child(node, &key, sub, gate),
                scalar => match node.get(&key) {
                    Some(old) if *old == scalar => {}
                    Some(old) => {
                        if let Value::Node(old_node) = old {
                            let old_node = old_node.clone();
                            self.add_removed_below(&key, &old_node);
                        }
                        node.put(key.clone(), scalar.clone());
                        self.add_change(node, &key, &scalar);
                    }
                    None => {
                        node.put(key.clone(), scalar.clone());
                        self.add_new(node, &key, &scalar);
                        self.add_value_changed(node, &key, &scalar);
                    }
                },
            }
        }

        self.log.len() > start
    }

    fn populate_child(
        &mut self,
        node: &mut Node,
        key: &str,
        payload: Node,
        gate: &mut dyn FnMut(&Path, &Value) -> bool,
    ) {
        let existed = node.has(key);
        let mark = self.log.len();

        if !existed {
            node.put(key, Value::Node(Node::new()));
        }
        let Some(slot) = node.get_mut(key) else {
            return;
        };
        let child = slot.ensure_node();
        let changed = self.child(key).populate(child, payload, WriteMode::Replace, gate);
        let now_empty = child.is_empty();

        if now_empty {
            // An empty node is no value at all.
            if let Some(old) = node.remove(key) {
                if existed {
                    self.add_removed(key, old);
                } else {
                    self.log.truncate(mark);
                }
            }
            return;
        }
        if !changed && existed {
            return;
        }

        let Some(value) = node.get(key).cloned() else {
            return;
        };
        let entry = self.child_entry(node, key, &value);
        let entry = if existed {
            ChangeLogEntry::ChildChanged(entry)
        } else {
            ChangeLogEntry::ChildAdded(entry)
        };
        self.log.insert(mark, entry);
        self.add_value_changed(node, key, &value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(json: serde_json::Value) -> Node {
        Node::from_json(json).unwrap()
    }

    fn path(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn value_entry(raw: &str) -> ValueEntry {
        let p = path(raw);
        ValueEntry {
            name: p.last_element().unwrap_or_default().to_string(),
            parent_path: p.parent(),
            path: p,
            value: Value::Null,
            prev_sibling_name: None,
            priority: None,
        }
    }

    fn describe(log: &ChangeLog) -> Vec<String> {
        log.entries()
            .iter()
            .map(|e| format!("{} {}", e.event_type(), e.affected_path()))
            .collect()
    }

    fn allow_all(_: &Path, _: &Value) -> bool {
        true
    }

    #[test]
    fn test_add_change_emits_child_and_value_entries() {
        let mut log = ChangeLog::new(1);
        let n = node(json!({"a": 1, "b": 2}));
        ChangeLogBuilder::new(&mut log, path("/x")).add_change(&n, "b", &2.into());

        assert_eq!(describe(&log), vec!["child_changed /x/b", "value /x/b"]);
        match &log.entries()[0] {
            ChangeLogEntry::ChildChanged(e) => {
                assert_eq!(e.path, path("/x"));
                assert_eq!(e.parent_path, Path::root());
                assert_eq!(e.prev_sibling_name.as_deref(), Some("a"));
                assert_eq!(e.priority, Some(1));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_populate_into_empty_node() {
        let mut log = ChangeLog::new(1);
        let mut target = Node::new();
        let payload = node(json!({"name": "Ann", "address": {"city": "Oslo"}}));
        let changed = ChangeLogBuilder::new(&mut log, path("/u")).populate(
            &mut target,
            payload,
            WriteMode::Replace,
            &mut allow_all,
        );

        assert!(changed);
        assert_eq!(target.to_json(), json!({"name": "Ann", "address": {"city": "Oslo"}}));
        assert_eq!(
            describe(&log),
            vec![
                "child_added /u/name",
                "value /u/name",
                "child_added /u/address",
                "child_added /u/address/city",
                "value /u/address/city",
                "value /u/address",
            ]
        );
    }

    #[test]
    fn test_populate_skips_unchanged_values() {
        let mut log = ChangeLog::new(1);
        let mut target = node(json!({"a": 1, "b": {"c": 2}}));
        let changed = ChangeLogBuilder::new(&mut log, Path::root()).populate(
            &mut target,
            node(json!({"a": 1, "b": {"c": 2}})),
            WriteMode::Replace,
            &mut allow_all,
        );
        assert!(!changed);
        assert!(log.is_empty());
    }

    #[test]
    fn test_replace_removes_missing_keys_with_subtree() {
        let mut log = ChangeLog::new(1);
        let mut target = node(json!({"keep": 1, "gone": {"deep": true}}));
        ChangeLogBuilder::new(&mut log, path("/r")).populate(
            &mut target,
            node(json!({"keep": 1})),
            WriteMode::Replace,
            &mut allow_all,
        );

        assert_eq!(target.to_json(), json!({"keep": 1}));
        assert_eq!(
            describe(&log),
            vec!["child_removed /r/gone/deep", "value /r/gone", "child_removed /r/gone"]
        );
    }

    #[test]
    fn test_merge_leaves_other_keys() {
        let mut log = ChangeLog::new(1);
        let mut target = node(json!({"a": 1, "b": 2}));
        ChangeLogBuilder::new(&mut log, Path::root()).populate(
            &mut target,
            node(json!({"b": 3})),
            WriteMode::Merge,
            &mut allow_all,
        );
        assert_eq!(target.to_json(), json!({"a": 1, "b": 3}));
        assert_eq!(describe(&log), vec!["child_changed /b", "value /b"]);
    }

    #[test]
    fn test_gate_blocks_key_and_subtree() {
        let mut log = ChangeLog::new(1);
        let mut target = Node::new();
        let mut gate = |p: &Path, _: &Value| p.first_element() != Some("secret");
        ChangeLogBuilder::new(&mut log, Path::root()).populate(
            &mut target,
            node(json!({"open": 1, "secret": {"x": 1}})),
            WriteMode::Replace,
            &mut gate,
        );
        assert_eq!(target.to_json(), json!({"open": 1}));
    }

    #[test]
    fn test_empty_payload_node_is_not_stored() {
        let mut log = ChangeLog::new(1);
        let mut target = Node::new();
        let changed = ChangeLogBuilder::new(&mut log, Path::root()).populate(
            &mut target,
            node(json!({"empty": {}})),
            WriteMode::Merge,
            &mut allow_all,
        );
        assert!(!changed);
        assert!(target.is_empty());
    }

    #[test]
    fn test_add_moved_records_new_rank() {
        let mut log = ChangeLog::new(1);
        let mut n = node(json!({"a": 1, "b": 2, "c": 3}));
        n.set_index_of("c", 0);
        ChangeLogBuilder::new(&mut log, path("/list")).add_moved(&n, "c");
        match &log.entries()[0] {
            ChangeLogEntry::ChildMoved(e) => {
                assert_eq!(e.priority, 0);
                assert_eq!(e.prev_sibling_name, None);
                assert_eq!(e.path, path("/list"));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_affected_paths_are_distinct() {
        let mut log = ChangeLog::new(1);
        let n = node(json!({"a": 1}));
        let mut builder = ChangeLogBuilder::new(&mut log, Path::root());
        builder.add_change(&n, "a", &1.into());
        assert_eq!(log.affected_paths(), vec![path("/a")]);
    }

    #[test]
    fn test_deepest_paths_drop_ancestors() {
        let mut log = ChangeLog::new(1);
        log.add_value_changed(value_entry("/users/1/age"));
        log.add_value_changed(value_entry("/users/1"));
        log.add_value_changed(value_entry("/posts"));
        log.add_value_changed(value_entry("/"));
        assert_eq!(log.deepest_paths(), vec![path("/users/1/age"), path("/posts")]);
    }
}
