//! The two consumers behind the sequencer.
//!
//! ```text
//!  Sequencer ──► journal consumer (blocking thread)
//!                   │  append + sync
//!                   ▼
//!              Command::Commit ──► apply consumer (async task)
//!                                     │  Persistence::apply
//!                                     ├──► Distributor::distribute (every connection)
//!                                     └──► snapshot every N commits (blocking thread)
//! ```
//!
//! The journal consumer forwards an event only after it is durable, so the
//! tree never runs ahead of the journal. Everything that reads or changes
//! connection state is a [`Command`] on the apply channel, which serializes
//! it with mutations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arbor_core::{ChangeLog, Event, Node, Path, Persistence, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::distributor::Distributor;
use crate::error::{EngineError, Result};
use crate::listeners::ListenerKind;
use crate::outbound::Outbound;
use crate::sequencer::SequencedEvent;
use crate::storage::{JournalError, JournalRecord, Location, Snapshot, Storage};

/// Requests handled by the apply consumer, in arrival order.
pub enum Command {
    /// A journaled event, ready to apply.
    Commit(SequencedEvent),
    /// A generic `event` broadcast. Never journaled.
    Broadcast(Event),
    Connect {
        id: Uuid,
        outbound: Outbound,
    },
    Attach {
        id: Uuid,
        path: Path,
        kind: ListenerKind,
    },
    Detach {
        id: Uuid,
        path: Path,
        kind: ListenerKind,
    },
    AttachQuery {
        id: Uuid,
        path: Path,
        query: String,
    },
    DetachQuery {
        id: Uuid,
        path: Path,
        query: String,
    },
    RegisterDisconnect {
        id: Uuid,
        event: Event,
    },
    Authenticate {
        id: Uuid,
        username: String,
        password: String,
        reply: oneshot::Sender<Option<Node>>,
    },
    Close {
        id: Uuid,
        reply: oneshot::Sender<Vec<Event>>,
    },
    Read {
        path: Path,
        reply: oneshot::Sender<Option<Value>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<Option<u64>>>,
    },
    /// Reply once `sequence` has been applied.
    WaitApplied {
        sequence: u64,
        reply: oneshot::Sender<()>,
    },
    /// The journal consumer stopped on an I/O error.
    JournalFailed,
    Shutdown,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub committed: u64,
    pub journaled: u64,
    pub snapshots: u64,
    pub open_connections: u64,
    /// Outbound messages lost to slow readers, across all connections
    pub dropped_messages: u64,
    pub accepting: bool,
}

#[derive(Default)]
pub(crate) struct AtomicEngineStats {
    pub committed: AtomicU64,
    pub journaled: AtomicU64,
    pub snapshots: AtomicU64,
    pub open_connections: AtomicU64,
    pub dropped_messages: Arc<AtomicU64>,
}

impl AtomicEngineStats {
    pub fn snapshot(&self, accepting: bool) -> EngineStats {
        EngineStats {
            committed: self.committed.load(Ordering::Relaxed),
            journaled: self.journaled.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
            open_connections: self.open_connections.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            accepting,
        }
    }
}

/// Journal consumer body. Runs on a blocking thread until the sequencer
/// closes or an append fails.
pub(crate) fn run_journal(
    storage: Arc<dyn Storage>,
    mut events: mpsc::Receiver<SequencedEvent>,
    apply: mpsc::Sender<Command>,
    accepting: Arc<AtomicBool>,
    stats: Arc<AtomicEngineStats>,
    sync_writes: bool,
) {
    while let Some(sequenced) = events.blocking_recv() {
        if let Err(e) = append(storage.as_ref(), &sequenced, sync_writes) {
            log::error!("Journal append failed at sequence {}: {e}", sequenced.sequence);
            accepting.store(false, Ordering::Release);
            let _ = apply.blocking_send(Command::JournalFailed);
            break;
        }
        stats.journaled.fetch_add(1, Ordering::Relaxed);
        if apply.blocking_send(Command::Commit(sequenced)).is_err() {
            log::warn!("Apply consumer gone, journal consumer stopping");
            accepting.store(false, Ordering::Release);
            break;
        }
    }
    log::debug!("Journal consumer stopped");
}

fn append(storage: &dyn Storage, sequenced: &SequencedEvent, sync: bool) -> std::result::Result<(), JournalError> {
    let record = JournalRecord::for_event(sequenced.sequence, &sequenced.event)?;
    let location = storage.append(&record)?;
    if location != Location(sequenced.sequence) {
        log::warn!("Journal placed sequence {} at {location}", sequenced.sequence);
    }
    if sync {
        storage.sync()?;
    }
    Ok(())
}

/// Owns the tree and every connection's distributor.
pub(crate) struct ApplyConsumer {
    persistence: Persistence,
    connections: HashMap<Uuid, Distributor>,
    storage: Arc<dyn Storage>,
    config: EngineConfig,
    stats: Arc<AtomicEngineStats>,
    last_sequence: Option<u64>,
    since_snapshot: u64,
    /// Sequence covered by the newest stored snapshot.
    snapshot_mark: Arc<Mutex<Option<u64>>>,
    waiters: BTreeMap<u64, Vec<oneshot::Sender<()>>>,
    journal_failed: bool,
    snapshot_tasks: Vec<JoinHandle<()>>,
}

impl ApplyConsumer {
    pub fn new(
        persistence: Persistence,
        storage: Arc<dyn Storage>,
        config: EngineConfig,
        stats: Arc<AtomicEngineStats>,
        last_sequence: Option<u64>,
        snapshot_sequence: Option<u64>,
    ) -> Self {
        Self {
            persistence,
            connections: HashMap::new(),
            storage,
            config,
            stats,
            last_sequence,
            since_snapshot: 0,
            snapshot_mark: Arc::new(Mutex::new(snapshot_sequence)),
            waiters: BTreeMap::new(),
            journal_failed: false,
            snapshot_tasks: Vec::new(),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }

        for (_, mut distributor) in self.connections.drain() {
            distributor.close();
        }
        self.stats.open_connections.store(0, Ordering::Relaxed);
        for task in self.snapshot_tasks.drain(..) {
            let _ = task.await;
        }
        log::info!("Apply consumer stopped at sequence {:?}", self.last_sequence);
    }

    /// Returns false on shutdown.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Commit(sequenced) => self.commit(sequenced),
            Command::Broadcast(event) => {
                let log = ChangeLog::new(self.last_sequence.unwrap_or(0));
                let root = self.persistence.root();
                for distributor in self.connections.values_mut() {
                    distributor.distribute(root, &event, &log);
                }
            }
            Command::Connect { id, outbound } => {
                let distributor = Distributor::new(
                    id,
                    self.config.base_path.clone(),
                    self.persistence.authorization().clone(),
                    outbound,
                );
                self.connections.insert(id, distributor);
                self.stats.open_connections.fetch_add(1, Ordering::Relaxed);
                log::info!("Connection {id} opened");
            }
            Command::Attach { id, path, kind } => {
                if let Some(d) = self.connections.get_mut(&id) {
                    d.attach_listener(&self.persistence, path, kind);
                }
            }
            Command::Detach { id, path, kind } => {
                if let Some(d) = self.connections.get_mut(&id) {
                    d.detach_listener(&path, kind);
                }
            }
            Command::AttachQuery { id, path, query } => {
                if let Some(d) = self.connections.get_mut(&id) {
                    d.attach_query(&self.persistence, path, &query);
                }
            }
            Command::DetachQuery { id, path, query } => {
                if let Some(d) = self.connections.get_mut(&id) {
                    d.detach_query(&path, &query);
                }
            }
            Command::RegisterDisconnect { id, event } => {
                if let Some(d) = self.connections.get_mut(&id) {
                    d.register_disconnect_event(event);
                }
            }
            Command::Authenticate {
                id,
                username,
                password,
                reply,
            } => {
                let user = self.connections.get_mut(&id).and_then(|d| {
                    d.authenticate(self.persistence.root(), &username, &password);
                    d.auth().user_node().cloned()
                });
                let _ = reply.send(user);
            }
            Command::Close { id, reply } => {
                let events = match self.connections.remove(&id) {
                    Some(mut d) => {
                        self.stats.open_connections.fetch_sub(1, Ordering::Relaxed);
                        log::info!("Connection {id} closed");
                        d.close()
                    }
                    None => Vec::new(),
                };
                let _ = reply.send(events);
            }
            Command::Read { path, reply } => {
                let _ = reply.send(self.persistence.get(&path));
            }
            Command::Snapshot { reply } => match self.start_snapshot() {
                Some(write) => {
                    let task = tokio::spawn(async move {
                        let _ = reply.send(join_snapshot(write).await);
                    });
                    self.track(task);
                }
                None => {
                    let _ = reply.send(Ok(None));
                }
            },
            Command::WaitApplied { sequence, reply } => {
                if self.last_sequence.is_some_and(|last| last >= sequence) {
                    let _ = reply.send(());
                } else if !self.journal_failed {
                    self.waiters.entry(sequence).or_default().push(reply);
                }
            }
            Command::JournalFailed => {
                self.journal_failed = true;
                // Dropping the senders wakes every waiter with an error.
                self.waiters.clear();
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn commit(&mut self, sequenced: SequencedEvent) {
        let SequencedEvent { sequence, event } = sequenced;
        match self.persistence.apply(&event, sequence) {
            Ok(log) => {
                let root = self.persistence.root();
                for distributor in self.connections.values_mut() {
                    distributor.distribute(root, &event, &log);
                }
                log::debug!("Applied event {sequence}: {} entries", log.entries().len());
            }
            Err(e) => log::warn!("Event {sequence} rejected: {e}"),
        }

        self.last_sequence = Some(sequence);
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        let pending = self.waiters.split_off(&(sequence + 1));
        for reply in std::mem::replace(&mut self.waiters, pending).into_values().flatten() {
            let _ = reply.send(());
        }

        self.since_snapshot += 1;
        let interval = self.config.snapshot_interval;
        if interval > 0 && self.since_snapshot >= interval {
            if let Some(write) = self.start_snapshot() {
                let task = tokio::spawn(async move {
                    if let Err(e) = join_snapshot(write).await {
                        log::error!("Periodic snapshot failed: {e}");
                    }
                });
                self.track(task);
            }
        }
    }

    /// Copy the tree and hand the copy to a blocking writer. None when
    /// nothing has been committed yet.
    fn start_snapshot(&mut self) -> Option<JoinHandle<Result<Option<u64>>>> {
        let sequence = self.last_sequence?;
        let snapshot = Snapshot::new(sequence, self.persistence.root().clone());
        self.since_snapshot = 0;

        let storage = self.storage.clone();
        let mark = self.snapshot_mark.clone();
        let stats = self.stats.clone();
        let truncate = self.config.truncate_on_snapshot;
        Some(tokio::task::spawn_blocking(move || {
            write_snapshot(storage.as_ref(), &mark, &stats, snapshot, truncate)
        }))
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.snapshot_tasks.retain(|t| !t.is_finished());
        self.snapshot_tasks.push(task);
    }
}

async fn join_snapshot(write: JoinHandle<Result<Option<u64>>>) -> Result<Option<u64>> {
    write
        .await
        .map_err(|e| EngineError::Snapshot(format!("snapshot task failed: {e}")))?
}

fn write_snapshot(
    storage: &dyn Storage,
    mark: &Mutex<Option<u64>>,
    stats: &AtomicEngineStats,
    snapshot: Snapshot,
    truncate: bool,
) -> Result<Option<u64>> {
    let mut mark = mark.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(stored) = *mark {
        if stored >= snapshot.sequence {
            return Ok(Some(stored));
        }
    }

    let bytes = snapshot.encode()?;
    storage.save_snapshot(snapshot.sequence, &bytes)?;
    *mark = Some(snapshot.sequence);
    stats.snapshots.fetch_add(1, Ordering::Relaxed);

    let removed = if truncate {
        storage.truncate_through(Location(snapshot.sequence))?
    } else {
        0
    };
    log::info!(
        "Snapshot at sequence {} stored ({} bytes, {removed} journal records truncated)",
        snapshot.sequence,
        bytes.len()
    );
    Ok(Some(snapshot.sequence))
}
