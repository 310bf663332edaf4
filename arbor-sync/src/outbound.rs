//! Per-connection outbound queue with drop-oldest backpressure.
//!
//! Uses a tokio broadcast channel with a single receiver: `send` never
//! blocks the apply task, and a reader that falls more than `capacity`
//! messages behind loses the oldest ones. The loss is counted, never
//! silent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::protocol::{OutboundMessage, ProtocolError};

/// Statistics for monitoring one connection's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Lock-free counters. `dropped` is shared with the engine so the total
/// across connections is available without visiting each one.
struct AtomicOutboundStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    engine_dropped: Arc<AtomicU64>,
}

impl AtomicOutboundStats {
    fn record_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
        self.engine_dropped.fetch_add(n, Ordering::Relaxed);
    }
}

/// Sending half, owned by the connection's distributor.
pub struct Outbound {
    sender: broadcast::Sender<Arc<str>>,
    capacity: usize,
    stats: Arc<AtomicOutboundStats>,
}

/// Receiving half, owned by the connection handle.
pub struct OutboundReceiver {
    receiver: broadcast::Receiver<Arc<str>>,
    stats: Arc<AtomicOutboundStats>,
}

impl Outbound {
    /// Create a queue buffering up to `capacity` messages. Drops are also
    /// added to `engine_dropped`.
    pub fn channel(capacity: usize, engine_dropped: Arc<AtomicU64>) -> (Self, OutboundReceiver) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        let stats = Arc::new(AtomicOutboundStats {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            engine_dropped,
        });
        let outbound = Self {
            sender,
            capacity,
            stats: stats.clone(),
        };
        (outbound, OutboundReceiver { receiver, stats })
    }

    /// Encode and queue a message. Returns false once the receiver is gone.
    pub fn send(&self, msg: &OutboundMessage) -> Result<bool, ProtocolError> {
        let encoded: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.send_raw(encoded))
    }

    /// Queue pre-encoded text.
    pub fn send_raw(&self, encoded: Arc<str>) -> bool {
        match self.sender.send(encoded) {
            Ok(_) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the receiving half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.receiver_count() == 0
    }

    pub fn stats(&self) -> OutboundStats {
        OutboundStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

impl OutboundReceiver {
    /// Next message, waiting if the queue is empty. `None` once the
    /// connection is closed and the queue drained.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) => return Some(msg),
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next message if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        loop {
            match self.receiver.try_recv() {
                Ok(msg) => return Some(msg),
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// [`recv`](Self::recv), decoded.
    pub async fn recv_message(&mut self) -> Option<OutboundMessage> {
        loop {
            let text = self.recv().await?;
            match OutboundMessage::decode(&text) {
                Ok(msg) => return Some(msg),
                Err(e) => log::warn!("Undecodable outbound message: {e}"),
            }
        }
    }

    pub fn stats(&self) -> OutboundStats {
        OutboundStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }

    fn lagged(&self, n: u64) {
        self.stats.record_dropped(n);
        log::warn!("Outbound queue overflowed, dropped {n} oldest messages");
    }
}
