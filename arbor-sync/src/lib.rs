//! # arbor-sync — Sequenced, journaled sync engine for the Arbor tree
//!
//! Turns client requests into ordered, durable tree mutations and fans the
//! resulting change logs out to every connection's listeners.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  set/update/push  ┌───────────┐   seq, event   ┌──────────────┐
//! │ Connection │ ────────────────► │ Sequencer │ ─────────────► │ Journal      │
//! │ (per user) │                   └───────────┘                │ (RocksDB/mem)│
//! └─────▲──────┘                                                └──────┬───────┘
//!       │                                                              │ durable
//!       │ outbound JSON                                                ▼
//! ┌─────┴──────┐   ChangeLog   ┌──────────────────┐  Commit   ┌──────────────┐
//! │ Distributor│ ◄──────────── │ Persistence      │ ◄──────── │ Apply task   │
//! │ (listeners,│               │ (arbor-core tree)│           │ (single      │
//! │  queries)  │               └──────────────────┘           │  writer)     │
//! └────────────┘                                              └──────┬───────┘
//!                                                                    │ every N
//!                                                                    ▼
//!                                                           ┌──────────────┐
//!                                                           │ Snapshot     │
//!                                                           │ (JSON + LZ4) │
//!                                                           └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] — Startup replay and pipeline wiring
//! - [`connection`] — Client handle: listeners, queries, mutations
//! - [`sequencer`] — Single ordering authority
//! - [`pipeline`] — Journal and apply consumers
//! - [`distributor`] — Per-connection fan-out with per-message READ checks
//! - [`protocol`] — Outbound JSON messages
//! - [`outbound`] — Bounded drop-oldest queues
//! - [`storage`] — Journal records, RocksDB and in-memory logs, snapshots
//! - [`recovery`] — Snapshot restore and journal redo

pub mod config;
pub mod connection;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod outbound;
pub mod pipeline;
pub mod protocol;
pub mod recovery;
pub mod sequencer;
pub mod storage;

// Re-exports for convenience
pub use config::{EngineConfig, ReplayPolicy};
pub use connection::Connection;
pub use distributor::Distributor;
pub use engine::Database;
pub use error::{EngineError, Result};
pub use listeners::{ListenerKind, ListenerRegistry};
pub use outbound::{Outbound, OutboundReceiver, OutboundStats};
pub use pipeline::EngineStats;
pub use protocol::{MessageType, OutboundMessage, ProtocolError};
pub use recovery::{recover, RecoveryReport};
pub use sequencer::{SequencedEvent, Sequencer};
pub use storage::{
    DurableLog, JournalError, JournalRecord, Location, MemoryJournal, RocksJournal, Snapshot,
    SnapshotStore, Storage, StoreConfig,
};
