//! The single ordering authority for tree mutations.
//!
//! Number assignment and the hand-off to the journal consumer happen under
//! one lock, so the journal sees events in exactly the order their numbers
//! say.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbor_core::Event;
use tokio::sync::{mpsc, Mutex};

use crate::error::{EngineError, Result};

/// An event with its commit position.
#[derive(Debug, Clone)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub event: Event,
}

struct State {
    next: u64,
    journal: Option<mpsc::Sender<SequencedEvent>>,
}

pub struct Sequencer {
    state: Mutex<State>,
    accepting: Arc<AtomicBool>,
}

impl Sequencer {
    /// Start numbering at `next`. `accepting` is shared with the journal
    /// consumer, which clears it when the journal fails.
    pub fn new(next: u64, journal: mpsc::Sender<SequencedEvent>, accepting: Arc<AtomicBool>) -> Self {
        Self {
            state: Mutex::new(State {
                next,
                journal: Some(journal),
            }),
            accepting,
        }
    }

    /// Assign the next sequence number to `event` and queue it for the
    /// journal. Waits while the journal queue is full.
    pub async fn publish(&self, event: Event) -> Result<u64> {
        if !self.is_accepting() {
            return Err(EngineError::Closed);
        }
        let mut state = self.state.lock().await;
        let sequence = state.next;
        let journal = state.journal.as_ref().ok_or(EngineError::Closed)?;
        if journal.send(SequencedEvent { sequence, event }).await.is_err() {
            self.accepting.store(false, Ordering::Release);
            return Err(EngineError::Closed);
        }
        state.next += 1;
        log::debug!("Sequenced event {sequence}");
        Ok(sequence)
    }

    /// Stop accepting events. Events already published still drain.
    pub async fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        self.state.lock().await.journal.take();
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// The number the next published event will get.
    pub async fn next_sequence(&self) -> u64 {
        self.state.lock().await.next
    }
}
