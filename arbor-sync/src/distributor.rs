//! Per-connection fan-out of change logs.
//!
//! ```text
//!  ChangeLog ──► Distributor::distribute
//!                   │
//!                   ├── QueryEvaluator::process_changes ──► query_child_*
//!                   │
//!                   └── for each entry with a matching listener:
//!                          READ check at the child ──► filter_content
//!                                                        │
//!                                                        ▼
//!                                                   Outbound queue
//! ```
//!
//! Authorization is checked when a message is sent, per message: the
//! connection's identity or the data may have changed since the listener
//! was attached.

use std::sync::Arc;

use arbor_core::{
    AuthContext, Authorization, ChangeLog, ChangeLogEntry, ChildEntry, Event, EventType, Listener,
    MovedEntry, Node, Operation, Path, Persistence, QueryChange, QueryEvaluator, QueryTransition,
    RemovedEntry, Value, ValueEntry,
};
use uuid::Uuid;

use crate::listeners::{ListenerKind, ListenerRegistry};
use crate::outbound::Outbound;
use crate::protocol::{MessageType, OutboundMessage};

pub struct Distributor {
    id: Uuid,
    base_path: String,
    auth: AuthContext,
    authorization: Arc<Authorization>,
    listeners: ListenerRegistry,
    queries: QueryEvaluator,
    disconnect_events: Vec<Event>,
    open: bool,
    outbound: Outbound,
}

impl Distributor {
    pub fn new(
        id: Uuid,
        base_path: impl Into<String>,
        authorization: Arc<Authorization>,
        outbound: Outbound,
    ) -> Self {
        Self {
            id,
            base_path: base_path.into(),
            auth: AuthContext::anonymous(),
            authorization,
            listeners: ListenerRegistry::new(),
            queries: QueryEvaluator::new(),
            disconnect_events: Vec::new(),
            open: true,
            outbound,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn set_auth(&mut self, auth: AuthContext) {
        self.auth = auth;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn queries(&self) -> &QueryEvaluator {
        &self.queries
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Register a listener and send it the current state: every child for
    /// `child_added`, the value for `value`.
    pub fn attach_listener(&mut self, persistence: &Persistence, path: Path, kind: ListenerKind) {
        log::trace!("Connection {} attach {kind} at {path}", self.id);
        self.listeners.add(path.clone(), kind);
        match kind {
            ListenerKind::ChildAdded => {
                persistence.sync_path(&path, &mut Only { distributor: self, kind })
            }
            ListenerKind::Value => {
                persistence.sync_property_value(&path, &mut Only { distributor: self, kind })
            }
            _ => {}
        }
    }

    pub fn detach_listener(&mut self, path: &Path, kind: ListenerKind) -> bool {
        log::trace!("Connection {} detach {kind} at {path}", self.id);
        self.listeners.remove(path, kind)
    }

    /// Register a query and send every child that currently matches.
    pub fn attach_query(&mut self, persistence: &Persistence, path: Path, query: &str) {
        log::trace!("Connection {} attach query '{query}' at {path}", self.id);
        if !self.queries.add_query(&path, query) {
            return;
        }
        let mut queries = std::mem::take(&mut self.queries);
        persistence.sync_path_with_query(&path, query, &mut queries, self);
        self.queries = queries;
    }

    pub fn detach_query(&mut self, path: &Path, query: &str) -> bool {
        log::trace!("Connection {} detach query '{query}' at {path}", self.id);
        self.queries.remove_query(path, query)
    }

    /// Adopt the user under `/users` whose `username` and `password` match,
    /// or become anonymous. Returns whether a user matched.
    pub fn authenticate(&mut self, root: &Node, username: &str, password: &str) -> bool {
        let users = Path::from_segments(["users"]);
        let user = root.get_node_for_path(&users).and_then(|users| {
            users.iter().find_map(|(_, value)| {
                let node = value.as_node()?;
                let matches = node.get("username").and_then(Value::as_str) == Some(username)
                    && node.get("password").and_then(Value::as_str) == Some(password);
                matches.then(|| node.clone())
            })
        });
        let found = user.is_some();
        self.auth = AuthContext::from(user);
        log::trace!("Connection {} authenticate '{username}': {found}", self.id);
        found
    }

    /// Queue an event to run when the connection closes.
    pub fn register_disconnect_event(&mut self, event: Event) {
        self.disconnect_events.push(event);
    }

    pub fn disconnect_event_count(&self) -> usize {
        self.disconnect_events.len()
    }

    /// Close the connection. Returns the disconnect events, in registration
    /// order, carrying the connection's identity. Only the first call
    /// returns them.
    pub fn close(&mut self) -> Vec<Event> {
        self.open = false;
        let user = self.auth.user_node().cloned();
        std::mem::take(&mut self.disconnect_events)
            .into_iter()
            .map(|event| match event.auth {
                Some(_) => event,
                None => event.with_auth(user.clone()),
            })
            .collect()
    }

    /// Deliver one applied event and its change log.
    pub fn distribute(&mut self, root: &Node, event: &Event, log: &ChangeLog) {
        if !self.open {
            return;
        }

        if event.event_type == EventType::Event {
            self.distribute_event(event);
            return;
        }

        if !self.queries.is_empty() {
            for change in self.queries.process_changes(root, &log.deepest_paths()) {
                self.fire_query_change(root, &change);
            }
        }

        for entry in log.entries() {
            if !self
                .listeners
                .has(entry.listener_path(), ListenerKind::for_entry(entry))
            {
                continue;
            }
            match entry {
                ChangeLogEntry::ChildAdded(e) => self.fire_child(root, MessageType::ChildAdded, e),
                ChangeLogEntry::ChildChanged(e) => self.fire_child(root, MessageType::ChildChanged, e),
                ChangeLogEntry::ChildRemoved(e) => self.fire_child_removed(root, e),
                ChangeLogEntry::ChildMoved(e) => self.fire_child_moved(root, e),
                ChangeLogEntry::ValueChanged(e) => self.send_value(root, e),
            }
        }
    }

    fn distribute_event(&self, event: &Event) {
        let Ok(path) = Path::parse(&event.path) else {
            return;
        };
        if self.listeners.has(&path, ListenerKind::Event) {
            self.send(OutboundMessage::event(&self.base_path, &path, event.payload.clone()));
        }
    }

    fn readable(&self, root: &Node, path: &Path, value: &Value) -> bool {
        self.authorization
            .is_authorized(Operation::Read, &self.auth, root, path, Some(value))
    }

    fn redact(&self, root: &Node, path: &Path, value: &Value) -> Value {
        self.authorization.filter_content(&self.auth, root, path, value)
    }

    fn fire_child(&self, root: &Node, msg_type: MessageType, entry: &ChildEntry) {
        if msg_type == MessageType::ChildChanged && entry.value.is_null() {
            return;
        }
        let child_path = entry.child_path();
        if !self.readable(root, &child_path, &entry.value) {
            return;
        }
        let payload = self.redact(root, &child_path, &entry.value);
        self.send(OutboundMessage::child(msg_type, &self.base_path, entry, payload));
    }

    fn fire_child_removed(&self, root: &Node, entry: &RemovedEntry) {
        let child_path = entry.path.append(entry.name.clone());
        if !self.readable(root, &child_path, &entry.value) {
            return;
        }
        let payload = self.redact(root, &child_path, &entry.value);
        self.send(OutboundMessage::child_removed(&self.base_path, entry, payload));
    }

    fn fire_child_moved(&self, root: &Node, entry: &MovedEntry) {
        let child_path = entry.path.append(entry.name.clone());
        let value = root.value_at(&child_path).unwrap_or_default();
        if !self.readable(root, &child_path, &value) {
            return;
        }
        let payload = self.redact(root, &child_path, &value);
        self.send(OutboundMessage::child_moved(&self.base_path, entry, payload));
    }

    fn send_value(&self, root: &Node, entry: &ValueEntry) {
        if !self.readable(root, &entry.path, &entry.value) {
            return;
        }
        let payload = self.redact(root, &entry.path, &entry.value);
        self.send(OutboundMessage::value(&self.base_path, entry, payload));
    }

    fn fire_query_change(&self, root: &Node, change: &QueryChange) {
        match change.transition {
            QueryTransition::Added => {
                self.send_query_child(root, MessageType::QueryChildAdded, change)
            }
            QueryTransition::Changed if !change.value.is_null() => {
                self.send_query_child(root, MessageType::QueryChildChanged, change)
            }
            QueryTransition::Changed => {}
            QueryTransition::Removed => {
                if !self.readable(root, &change.path, &change.value) {
                    return;
                }
                let payload = self.redact(root, &change.path, &change.value);
                self.send(OutboundMessage::query_child_removed(
                    &self.base_path,
                    &change.query,
                    &change.path,
                    payload,
                ));
            }
        }
    }

    fn send_query_child(&self, root: &Node, msg_type: MessageType, change: &QueryChange) {
        if !self.readable(root, &change.path, &change.value) {
            return;
        }
        let priority = change
            .path
            .last_element()
            .and_then(|name| root.get_node_for_path(&change.base)?.index_of(name));
        let payload = self.redact(root, &change.path, &change.value);
        self.send(OutboundMessage::query_child(
            msg_type,
            &self.base_path,
            &change.query,
            &change.path,
            payload,
            priority,
        ));
    }

    fn send(&self, msg: OutboundMessage) {
        match self.outbound.send(&msg) {
            Ok(true) => {}
            Ok(false) => log::debug!("Connection {} has no reader, dropped {}", self.id, msg.msg_type.as_str()),
            Err(e) => log::warn!("Connection {}: {e}", self.id),
        }
    }
}

/// Initial-state callbacks go straight out, still READ-checked.
impl Listener for Distributor {
    fn fire_child_added(&mut self, root: &Node, entry: &ChildEntry) {
        self.fire_child(root, MessageType::ChildAdded, entry);
    }

    fn fire_value(&mut self, root: &Node, entry: &ValueEntry) {
        self.send_value(root, entry);
    }

    fn fire_query_child_added(&mut self, root: &Node, base: &Path, query: &str, entry: &ChildEntry) {
        let change = QueryChange {
            transition: QueryTransition::Added,
            base: base.clone(),
            query: query.to_string(),
            path: entry.child_path(),
            value: entry.value.clone(),
        };
        self.send_query_child(root, MessageType::QueryChildAdded, &change);
    }
}

/// Forwards only the callbacks of one listener kind, so attaching a
/// `child_added` listener does not also resend the value.
struct Only<'a> {
    distributor: &'a mut Distributor,
    kind: ListenerKind,
}

impl Listener for Only<'_> {
    fn fire_child_added(&mut self, root: &Node, entry: &ChildEntry) {
        if self.kind == ListenerKind::ChildAdded {
            self.distributor.fire_child_added(root, entry);
        }
    }

    fn fire_value(&mut self, root: &Node, entry: &ValueEntry) {
        if self.kind == ListenerKind::Value {
            self.distributor.fire_value(root, entry);
        }
    }

    fn fire_query_child_added(&mut self, root: &Node, base: &Path, query: &str, entry: &ChildEntry) {
        self.distributor.fire_query_child_added(root, base, query, entry);
    }
}
