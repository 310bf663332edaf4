//! Client-facing connection handle.
//!
//! Every call is a command on the engine's apply channel, so listener
//! changes are ordered with the mutations around them. Outbound messages
//! arrive through [`Connection::recv`].

use std::sync::Arc;

use arbor_core::{Event, Node, Path, Value};
use uuid::Uuid;

use crate::engine::Shared;
use crate::error::{EngineError, Result};
use crate::listeners::ListenerKind;
use crate::outbound::{OutboundReceiver, OutboundStats};
use crate::pipeline::Command;
use crate::protocol::OutboundMessage;

pub struct Connection {
    id: Uuid,
    shared: Arc<Shared>,
    user: Option<Node>,
    receiver: OutboundReceiver,
    closed: bool,
}

impl Connection {
    pub(crate) fn new(id: Uuid, shared: Arc<Shared>, receiver: OutboundReceiver) -> Self {
        Self {
            id,
            shared,
            user: None,
            receiver,
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The authenticated user node, if any.
    pub fn user(&self) -> Option<&Node> {
        self.user.as_ref()
    }

    // -- Listeners -------------------------------------------------------

    /// Listen for `event_type` (`child_added`, `child_changed`,
    /// `child_removed`, `child_moved`, `value` or `event`) at `path`.
    /// `child_added` and `value` first receive the current state.
    pub async fn attach_listener(&self, path: &str, event_type: &str) -> Result<()> {
        let path = Path::parse(path)?;
        let kind: ListenerKind = event_type.parse()?;
        self.shared
            .send(Command::Attach { id: self.id, path, kind })
            .await
    }

    pub async fn detach_listener(&self, path: &str, event_type: &str) -> Result<()> {
        let path = Path::parse(path)?;
        let kind: ListenerKind = event_type.parse()?;
        self.shared
            .send(Command::Detach { id: self.id, path, kind })
            .await
    }

    /// Track the children of `path` matching `query`. Current matches are
    /// sent as `query_child_added`.
    pub async fn attach_query(&self, path: &str, query: &str) -> Result<()> {
        let path = Path::parse(path)?;
        self.shared
            .send(Command::AttachQuery {
                id: self.id,
                path,
                query: query.to_string(),
            })
            .await
    }

    pub async fn detach_query(&self, path: &str, query: &str) -> Result<()> {
        let path = Path::parse(path)?;
        self.shared
            .send(Command::DetachQuery {
                id: self.id,
                path,
                query: query.to_string(),
            })
            .await
    }

    // -- Mutations -------------------------------------------------------

    /// Replace the value at `path`. A negative priority means none.
    pub async fn set(&self, path: &str, data: impl Into<Value>, priority: Option<i64>) -> Result<u64> {
        let mut event = Event::set(path, data);
        event.priority = priority;
        self.publish(event).await
    }

    /// Merge the keys of `data` into the node at `path`.
    pub async fn update(&self, path: &str, data: impl Into<Value>) -> Result<u64> {
        self.publish(Event::update(path, data)).await
    }

    /// Add a child with a generated name. Returns the name and sequence.
    pub async fn push(&self, path: &str, data: impl Into<Value>) -> Result<(String, u64)> {
        let event = Event::push(path, data);
        let name = event.name.clone().unwrap_or_default();
        let sequence = self.publish(event).await?;
        Ok((name, sequence))
    }

    pub async fn push_named(&self, path: &str, name: &str, data: impl Into<Value>) -> Result<u64> {
        self.publish(Event::push_named(path, name, data)).await
    }

    pub async fn remove(&self, path: &str) -> Result<u64> {
        self.publish(Event::remove(path)).await
    }

    pub async fn set_priority(&self, path: &str, priority: i64) -> Result<u64> {
        self.publish(Event::set_priority(path, priority)).await
    }

    /// Broadcast `data` to every `event` listener at `path`.
    pub async fn send_event(&self, path: &str, data: impl Into<Value>) -> Result<()> {
        self.shared
            .broadcast(Event::broadcast(path, data).with_auth(self.user.clone()))
            .await
    }

    async fn publish(&self, event: Event) -> Result<u64> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        self.shared.publish(event.with_auth(self.user.clone())).await
    }

    // -- On disconnect ---------------------------------------------------

    pub async fn set_on_disconnect(&self, path: &str, data: impl Into<Value>, priority: Option<i64>) -> Result<()> {
        let mut event = Event::set(path, data);
        event.priority = priority;
        self.on_disconnect(event).await
    }

    pub async fn update_on_disconnect(&self, path: &str, data: impl Into<Value>) -> Result<()> {
        self.on_disconnect(Event::update(path, data)).await
    }

    pub async fn push_on_disconnect(&self, path: &str, data: impl Into<Value>) -> Result<()> {
        self.on_disconnect(Event::push(path, data)).await
    }

    pub async fn remove_on_disconnect(&self, path: &str) -> Result<()> {
        self.on_disconnect(Event::remove(path)).await
    }

    /// Stage `event` for when this connection closes. It runs with the
    /// identity the connection has at that time.
    async fn on_disconnect(&self, event: Event) -> Result<()> {
        event.validate()?;
        self.shared
            .send(Command::RegisterDisconnect { id: self.id, event })
            .await
    }

    // -- Session ---------------------------------------------------------

    /// Log in as the `/users` child with matching `username` and
    /// `password`. A failed attempt leaves the connection anonymous.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<bool> {
        let (id, username, password) = (self.id, username.to_string(), password.to_string());
        let user = self
            .shared
            .request(|reply| Command::Authenticate {
                id,
                username,
                password,
                reply,
            })
            .await?;
        self.user = user;
        Ok(self.user.is_some())
    }

    /// Next outbound message. None once the connection is closed.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.receiver.recv_message().await
    }

    /// Next outbound message if one is already queued.
    pub fn try_recv(&mut self) -> Option<OutboundMessage> {
        loop {
            let text = self.receiver.try_recv()?;
            match OutboundMessage::decode(&text) {
                Ok(msg) => return Some(msg),
                Err(e) => log::warn!("Connection {}: {e}", self.id),
            }
        }
    }

    /// Next outbound message as wire text.
    pub async fn recv_text(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }

    pub fn outbound_stats(&self) -> OutboundStats {
        self.receiver.stats()
    }

    /// Close the connection and run its disconnect events. Returns how many
    /// were published.
    pub async fn close(mut self) -> Result<usize> {
        self.closed = true;
        self.shared.close_connection(self.id).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let (id, shared) = (self.id, self.shared.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = shared.close_connection(id).await {
                        log::debug!("Connection {id} close on drop: {e}");
                    }
                });
            }
            Err(_) => log::warn!("Connection {id} dropped outside a runtime, disconnect events lost"),
        }
    }
}
