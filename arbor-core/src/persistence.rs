//! The persistence engine: applies mutations to the tree and records what
//! changed.
//!
//! ```text
//! Event ──► Persistence::apply ──► authorize WRITE (hard gate per key)
//!                │
//!                ├── apply_new_value / update_value / remove / set_priority
//!                │        └── ChangeLogBuilder writes the tree
//!                ▼
//!            ChangeLog ──► distribution
//! ```
//!
//! A denied write is a silent no-op: the returned change log is empty.
//! The sync methods feed a [`Listener`] the current state of a path and are
//! used when a listener or query is first attached.

use std::collections::HashSet;
use std::sync::Arc;

use crate::auth::{AuthContext, Authorization, Operation};
use crate::changelog::{ChangeLog, ChangeLogBuilder, ChangeLogEntry, ChildEntry, ValueEntry, WriteMode};
use crate::error::Result;
use crate::event::{Event, EventType};
use crate::node::{Node, Value};
use crate::path::Path;
use crate::query::QueryEvaluator;

/// Receives initial state from the sync methods.
pub trait Listener {
    fn fire_child_added(&mut self, root: &Node, entry: &ChildEntry);

    fn fire_value(&mut self, root: &Node, entry: &ValueEntry);

    fn fire_query_child_added(&mut self, root: &Node, base: &Path, query: &str, entry: &ChildEntry);
}

#[derive(Debug, Clone)]
pub struct Persistence {
    root: Node,
    authorization: Arc<Authorization>,
}

impl Default for Persistence {
    fn default() -> Self {
        Self::new(Arc::new(Authorization::allow_all()))
    }
}

impl Persistence {
    pub fn new(authorization: Arc<Authorization>) -> Self {
        Self::with_root(Node::new(), authorization)
    }

    pub fn with_root(root: Node, authorization: Arc<Authorization>) -> Self {
        Self { root, authorization }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn authorization(&self) -> &Arc<Authorization> {
        &self.authorization
    }

    /// A copy of the value at `path` (the whole tree for the root).
    pub fn get(&self, path: &Path) -> Option<Value> {
        self.root.value_at(path)
    }

    /// Replace the whole tree, e.g. from a snapshot.
    pub fn restore(&mut self, root: Node) {
        self.root = root;
    }

    /// Apply one sequenced event. Validation failures are errors; denied
    /// writes yield an empty change log.
    pub fn apply(&mut self, event: &Event, sequence: u64) -> Result<ChangeLog> {
        let target = event.validate()?;
        let auth = event.auth_context();
        let mut log = ChangeLog::new(sequence);

        if event.from_history {
            log::trace!("Replaying {} {} (seq {sequence})", event.event_type.as_str(), target);
        }

        match event.event_type {
            EventType::Set | EventType::Push => {
                self.apply_new_value(&mut log, &auth, &target, event.priority_rank(), event.payload.clone());
            }
            EventType::Update => {
                if self.authorization.is_authorized(
                    Operation::Write,
                    &auth,
                    &self.root,
                    &target,
                    Some(&event.payload),
                ) {
                    self.update_value(&mut log, &target, event.priority_rank(), event.payload.clone());
                } else {
                    log::debug!("Update at {target} denied");
                }
            }
            EventType::Remove => self.remove(&mut log, &auth, &target),
            EventType::SetPriority => {
                if let Some(priority) = event.priority_rank() {
                    self.set_priority(&mut log, &auth, &target, priority);
                }
            }
            EventType::Event => {}
        }
        Ok(log)
    }

    /// `set`: replace the value at `path` with `payload`. `Null` removes.
    pub fn apply_new_value(
        &mut self,
        log: &mut ChangeLog,
        auth: &AuthContext,
        path: &Path,
        priority: Option<usize>,
        payload: Value,
    ) {
        if !self
            .authorization
            .is_authorized(Operation::Write, auth, &self.root, path, Some(&payload))
        {
            log::debug!("Write at {path} denied");
            return;
        }
        if payload.is_null() {
            self.remove_unchecked(log, path);
            return;
        }

        let mut denied = HashSet::new();
        let existing = self.root.get_node_for_path(path);
        self.collect_denied(auth, path, existing, &payload, WriteMode::Replace, &mut denied);
        self.write(log, path, priority, payload, WriteMode::Replace, &denied);
    }

    /// `update`: merge the top-level keys of `payload` into the node at
    /// `path`. The caller has already authorized the write.
    pub fn update_value(&mut self, log: &mut ChangeLog, path: &Path, priority: Option<usize>, payload: Value) {
        if payload.is_null() {
            self.remove_unchecked(log, path);
            return;
        }
        self.write(log, path, priority, payload, WriteMode::Merge, &HashSet::new());
    }

    /// `remove`: delete the value at `path` and everything below it.
    pub fn remove(&mut self, log: &mut ChangeLog, auth: &AuthContext, path: &Path) {
        if !self.root.path_exists(path) {
            return;
        }
        let allowed = self.with_value_at(path, |existing| {
            self.authorization
                .is_authorized(Operation::Write, auth, &self.root, path, existing)
                && self
                    .authorization
                    .is_allowed_if_ruled(Operation::Remove, auth, &self.root, path, existing)
        });
        if !allowed {
            log::debug!("Remove at {path} denied");
            return;
        }
        self.remove_unchecked(log, path);
    }

    /// Move the value at `path` to rank `priority` among its siblings.
    /// Authorized against the parent node.
    pub fn set_priority(&mut self, log: &mut ChangeLog, auth: &AuthContext, path: &Path, priority: usize) {
        let Some(key) = path.last_element() else {
            return;
        };
        let parent_path = path.parent();
        let allowed = self.with_value_at(&parent_path, |parent_value| {
            self.authorization
                .is_authorized(Operation::Write, auth, &self.root, &parent_path, parent_value)
        });
        if !allowed {
            log::debug!("Priority change at {path} denied");
            return;
        }
        let Some(parent) = self.root.get_node_for_path(&parent_path) else {
            return;
        };
        if parent.index_of(key) == Some(priority.min(parent.len().saturating_sub(1))) {
            return;
        }
        let parent = self.root.node_for_path_mut(&parent_path);
        if parent.set_index_of(key, priority) {
            ChangeLogBuilder::new(log, parent_path).add_moved(parent, key);
        }
    }

    /// Send the current state at `path` to `listener`: one child-added per
    /// child for a node, followed by a value callback.
    pub fn sync_path(&self, path: &Path, listener: &mut dyn Listener) {
        if let Some(node) = self.root.get_node_for_path(path) {
            for (key, value) in node.iter() {
                let entry = ChildEntry::new(
                    key,
                    path.clone(),
                    value.clone(),
                    node.prev_sibling_name(key),
                    node.index_of(key),
                );
                listener.fire_child_added(&self.root, &entry);
            }
        }
        self.sync_property_value(path, listener);
    }

    /// Send only the value at `path` (`Null` when absent).
    pub fn sync_property_value(&self, path: &Path, listener: &mut dyn Listener) {
        let value = self.root.value_at(path).unwrap_or_default();
        let (prev_sibling_name, priority) = self.rank_of(path);
        let entry = ValueEntry {
            name: path.last_element().unwrap_or_default().to_string(),
            path: path.clone(),
            parent_path: path.parent(),
            value,
            prev_sibling_name,
            priority,
        };
        listener.fire_value(&self.root, &entry);
    }

    /// Send every child of `path` that matches `query`, recording each as a
    /// member so later changes continue the transition sequence.
    pub fn sync_path_with_query(
        &self,
        path: &Path,
        query: &str,
        evaluator: &mut QueryEvaluator,
        listener: &mut dyn Listener,
    ) {
        let Some(node) = self.root.get_node_for_path(path) else {
            return;
        };
        for (key, value) in node.iter() {
            if !evaluator.matches(path, query, value) {
                continue;
            }
            let child_path = path.append(key);
            evaluator.add_node_to_query(path, query, &child_path);
            let entry = ChildEntry::new(key, path.clone(), value.clone(), node.prev_sibling_name(key), node.index_of(key));
            listener.fire_query_child_added(&self.root, path, query, &entry);
        }
    }

    /// Borrow the value at `path` for the duration of `f`. Only the root
    /// has to be copied into a [`Value`].
    fn with_value_at<R>(&self, path: &Path, f: impl FnOnce(Option<&Value>) -> R) -> R {
        if path.is_empty() {
            let root = Value::Node(self.root.clone());
            return f(Some(&root));
        }
        f(self.root.get_object_for_path(path))
    }

    fn rank_of(&self, path: &Path) -> (Option<String>, Option<usize>) {
        let Some(key) = path.last_element() else {
            return (None, None);
        };
        match self.root.get_node_for_path(&path.parent()) {
            Some(parent) => (parent.prev_sibling_name(key), parent.index_of(key)),
            None => (None, None),
        }
    }

    /// Nested keys of `payload` the caller may not write, evaluated against
    /// the tree as it is before the write.
    fn collect_denied(
        &self,
        auth: &AuthContext,
        path: &Path,
        existing: Option<&Node>,
        payload: &Value,
        mode: WriteMode,
        denied: &mut HashSet<Path>,
    ) {
        let Value::Node(payload) = payload else {
            return;
        };

        for (key, value) in payload.iter() {
            let child_path = path.append(key);
            if !self
                .authorization
                .is_authorized(Operation::Write, auth, &self.root, &child_path, Some(value))
            {
                denied.insert(child_path);
                continue;
            }
            let existing_child = existing.and_then(|n| n.get_node(key));
            self.collect_denied(auth, &child_path, existing_child, value, WriteMode::Replace, denied);
        }

        if mode == WriteMode::Replace {
            for key in existing.into_iter().flat_map(Node::keys).filter(|k| !payload.has(k)) {
                let child_path = path.append(key);
                if !self
                    .authorization
                    .is_authorized(Operation::Write, auth, &self.root, &child_path, Some(&Value::Null))
                {
                    denied.insert(child_path);
                }
            }
        }
    }

    fn write(
        &mut self,
        log: &mut ChangeLog,
        path: &Path,
        priority: Option<usize>,
        payload: Value,
        mode: WriteMode,
        denied: &HashSet<Path>,
    ) {
        let mut gate = |p: &Path, _: &Value| !denied.contains(p);

        let Some(key) = path.last_element().map(str::to_string) else {
            // The root itself: only a node payload can land here.
            if let Value::Node(payload) = payload {
                ChangeLogBuilder::new(log, Path::root()).populate(&mut self.root, payload, mode, &mut gate);
                self.log_root_value(log);
            }
            return;
        };

        let existed = self.root.path_exists(path);
        let first_missing = self.first_missing(path);
        let parent_path = path.parent();
        let parent = self.root.node_for_path_mut(&parent_path);
        let mark = log.len();

        {
            let mut builder = ChangeLogBuilder::new(log, parent_path.clone());
            match payload {
                Value::Node(payload) => {
                    if !parent.has(&key) {
                        parent.put(key.clone(), Value::Node(Node::new()));
                    }
                    // A scalar in the way is replaced by an empty node.
                    if let Some(child) = parent.get_mut(&key).map(Value::ensure_node) {
                        builder.child(&key).populate(child, payload, mode, &mut gate);
                    }
                    if parent.get_node(&key).is_some_and(Node::is_empty) {
                        if let Some(old) = parent.remove(&key) {
                            if existed {
                                builder.add_removed(&key, old);
                            }
                        }
                    }
                }
                scalar => {
                    if let Some(Value::Node(old)) = parent.get(&key) {
                        let old = old.clone();
                        builder.add_removed_below(&key, &old);
                    }
                    parent.put(key.clone(), scalar);
                }
            }

            if let Some(priority) = priority {
                parent.set_index_of(&key, priority);
            }
        }

        let Some(value) = parent.get(&key).cloned() else {
            if existed {
                self.log_ancestors(log, path, first_missing);
            } else {
                log.truncate(mark);
                self.prune_created(&parent_path, first_missing);
            }
            return;
        };

        let entry = ChildEntry::new(key.as_str(), parent_path.clone(), value.clone(), parent.prev_sibling_name(&key), parent.index_of(&key));
        let entry = if existed {
            ChangeLogEntry::ChildChanged(entry)
        } else {
            ChangeLogEntry::ChildAdded(entry)
        };
        log.insert(mark, entry);
        ChangeLogBuilder::new(log, parent_path).add_value_changed(parent, &key, &value);
        self.log_ancestors(log, path, first_missing);
    }

    /// Delete `path` without authorization.
    fn remove_unchecked(&mut self, log: &mut ChangeLog, path: &Path) {
        let Some(key) = path.last_element().map(str::to_string) else {
            let keys: Vec<String> = self.root.keys().map(str::to_string).collect();
            let mut builder = ChangeLogBuilder::new(log, Path::root());
            for key in keys {
                if let Some(old) = self.root.remove(&key) {
                    builder.add_removed(&key, old);
                }
            }
            self.log_root_value(log);
            return;
        };
        let parent_path = path.parent();
        let Some(parent) = self.root.get_node_for_path(&parent_path) else {
            return;
        };
        if !parent.has(&key) {
            return;
        }
        let parent = self.root.node_for_path_mut(&parent_path);
        if let Some(old) = parent.remove(&key) {
            ChangeLogBuilder::new(log, parent_path).add_removed(&key, old);
            self.log_ancestors(log, path, None);
        }
    }

    /// Child-changed and value entries for every strict ancestor of `path`,
    /// nearest first, ending with a value entry for the root. Ancestors at
    /// depth `first_missing` or deeper were created by this write and get a
    /// child-added entry instead.
    fn log_ancestors(&self, log: &mut ChangeLog, path: &Path, first_missing: Option<usize>) {
        for ancestor in path.ancestors() {
            let Some(name) = ancestor.last_element() else {
                self.log_root_value(log);
                continue;
            };
            let value = self.root.value_at(&ancestor).unwrap_or_default();
            let parent_path = ancestor.parent();
            let (prev, rank) = self.rank_of(&ancestor);
            if !value.is_null() {
                let entry = ChildEntry::new(name, parent_path.clone(), value.clone(), prev, rank);
                if first_missing.is_some_and(|depth| ancestor.len() >= depth) {
                    log.add_child_added(entry);
                } else {
                    log.add_child_changed(entry);
                }
            }
            log.add_value_changed(ValueEntry {
                name: name.to_string(),
                path: ancestor.clone(),
                parent_path,
                value,
                prev_sibling_name: None,
                priority: None,
            });
        }
    }

    fn log_root_value(&self, log: &mut ChangeLog) {
        log.add_value_changed(ValueEntry {
            name: String::new(),
            path: Path::root(),
            parent_path: Path::root(),
            value: Value::Node(self.root.clone()),
            prev_sibling_name: None,
            priority: None,
        });
    }

    /// The depth of the shallowest prefix of `path` that does not exist.
    fn first_missing(&self, path: &Path) -> Option<usize> {
        (1..=path.len()).find(|&len| {
            let prefix = Path::from_segments(path.segments()[..len].iter().cloned());
            !self.root.path_exists(&prefix)
        })
    }

    /// Drop empty intermediate nodes created on the way to `path`.
    fn prune_created(&mut self, path: &Path, first_missing: Option<usize>) {
        let Some(depth) = first_missing else {
            return;
        };
        let mut current = path.clone();
        while current.len() >= depth && !current.is_empty() {
            let empty = self.root.get_node_for_path(&current).is_some_and(Node::is_empty);
            if !empty {
                break;
            }
            let parent = current.parent();
            if let Some(key) = current.last_element() {
                self.root.node_for_path_mut(&parent).remove(key);
            }
            current = parent;
        }
    }
}
