//! The database engine: startup replay, then the live pipeline.
//!
//! ```text
//!  open ──► recover (snapshot + journal) ──► Sequencer ──► journal ──► apply
//!                                                                       │
//!  Connection ─── commands (attach, read, authenticate, close) ─────────┘
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use arbor_core::{Authorization, Event, EventType, Path, Persistence, RuleSet, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::error::{EngineError, Result};
use crate::outbound::Outbound;
use crate::pipeline::{run_journal, ApplyConsumer, AtomicEngineStats, Command, EngineStats};
use crate::recovery::{recover, RecoveryReport};
use crate::sequencer::Sequencer;
use crate::storage::{JournalError, MemoryJournal, RocksJournal, Storage};

/// State shared by the engine handle and every connection.
pub(crate) struct Shared {
    sequencer: Sequencer,
    commands: mpsc::Sender<Command>,
    stats: Arc<AtomicEngineStats>,
    outbound_capacity: usize,
}

impl Shared {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| EngineError::Closed)
    }

    /// Send a command carrying a reply channel and wait for the answer.
    pub async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.send(command(reply)).await?;
        answer.await.map_err(|_| EngineError::Closed)
    }

    /// Validate and sequence a mutation.
    pub async fn publish(&self, event: Event) -> Result<u64> {
        event.validate()?;
        if !event.event_type.is_mutation() {
            return Err(arbor_core::Error::MalformedPayload(format!(
                "'{}' does not change the tree",
                event.event_type.as_str()
            ))
            .into());
        }
        self.sequencer.publish(event).await
    }

    /// Fan an `event` broadcast out to every connection.
    pub async fn broadcast(&self, event: Event) -> Result<()> {
        event.validate()?;
        if !self.sequencer.is_accepting() {
            return Err(EngineError::Closed);
        }
        self.send(Command::Broadcast(event)).await
    }

    pub async fn submit(&self, event: Event) -> Result<Option<u64>> {
        match event.event_type {
            EventType::Event => self.broadcast(event).await.map(|()| None),
            _ => self.publish(event).await.map(Some),
        }
    }

    /// Remove a connection and publish its disconnect events. Returns how
    /// many were published.
    pub async fn close_connection(&self, id: Uuid) -> Result<usize> {
        let events = self.request(|reply| Command::Close { id, reply }).await?;
        let mut published = 0;
        for event in events {
            match self.publish(event).await {
                Ok(sequence) => {
                    log::debug!("Connection {id} disconnect event sequenced as {sequence}");
                    published += 1;
                }
                Err(e) => log::warn!("Connection {id} disconnect event dropped: {e}"),
            }
        }
        Ok(published)
    }
}

pub struct Database {
    shared: Arc<Shared>,
    config: EngineConfig,
    recovery: RecoveryReport,
    journal_task: Option<JoinHandle<()>>,
    apply_task: Option<JoinHandle<()>>,
}

impl Database {
    /// Open the journal named by `config.journal_dir` (in-memory if unset),
    /// replay it and start the pipeline.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let storage: Arc<dyn Storage> = match config.store_config() {
            Some(store) => {
                let journal = tokio::task::spawn_blocking(move || RocksJournal::open(store))
                    .await
                    .map_err(join_error)??;
                Arc::new(journal)
            }
            None => Arc::new(MemoryJournal::new()),
        };
        Self::open_with_storage(config, storage).await
    }

    /// Open over an already constructed journal.
    pub async fn open_with_storage(config: EngineConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let authorization = match &config.rules_path {
            Some(path) => Authorization::with_rules(RuleSet::from_file(path)?),
            None => Authorization::allow_all(),
        };
        let mut persistence = Persistence::new(Arc::new(authorization));

        let policy = config.replay_policy;
        let replay_storage = storage.clone();
        let (persistence, recovery) = tokio::task::spawn_blocking(move || {
            let report = recover(replay_storage.as_ref(), &mut persistence, policy)?;
            Ok::<_, EngineError>((persistence, report))
        })
        .await
        .map_err(join_error)??;

        let accepting = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(AtomicEngineStats::default());
        let capacity = config.pipeline_capacity.max(1);
        let (journal_tx, journal_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(capacity);

        let apply = ApplyConsumer::new(
            persistence,
            storage.clone(),
            config.clone(),
            stats.clone(),
            recovery.last_sequence,
            recovery.snapshot_sequence,
        );
        let apply_task = tokio::spawn(apply.run(command_rx));

        let journal_task = {
            let apply = command_tx.clone();
            let accepting = accepting.clone();
            let stats = stats.clone();
            let sync_writes = config.sync_writes;
            tokio::task::spawn_blocking(move || {
                run_journal(storage, journal_rx, apply, accepting, stats, sync_writes)
            })
        };

        let shared = Arc::new(Shared {
            sequencer: Sequencer::new(recovery.next_sequence(), journal_tx, accepting),
            commands: command_tx,
            stats,
            outbound_capacity: config.outbound_capacity,
        });

        log::info!("Arbor engine open, next sequence {}", recovery.next_sequence());
        Ok(Self {
            shared,
            config,
            recovery,
            journal_task: Some(journal_task),
            apply_task: Some(apply_task),
        })
    }

    pub async fn connect(&self) -> Result<Connection> {
        let id = Uuid::new_v4();
        let (outbound, receiver) = Outbound::channel(
            self.shared.outbound_capacity,
            self.shared.stats.dropped_messages.clone(),
        );
        self.shared.send(Command::Connect { id, outbound }).await?;
        Ok(Connection::new(id, self.shared.clone(), receiver))
    }

    /// Current value at `path`, read in order with mutations.
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        let path = Path::parse(path)?;
        self.shared.request(|reply| Command::Read { path, reply }).await
    }

    /// Submit an event with no connection identity. Returns its sequence
    /// number, or None for an `event` broadcast.
    pub async fn submit(&self, event: Event) -> Result<Option<u64>> {
        self.shared.submit(event).await
    }

    /// Wait until `sequence` has been applied and distributed.
    pub async fn wait_applied(&self, sequence: u64) -> Result<()> {
        self.shared
            .request(|reply| Command::WaitApplied { sequence, reply })
            .await
    }

    /// Store a snapshot of the tree now. Returns the sequence it covers,
    /// or None if nothing has been committed.
    pub async fn snapshot(&self) -> Result<Option<u64>> {
        self.shared.request(|reply| Command::Snapshot { reply }).await?
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats.snapshot(self.shared.sequencer.is_accepting())
    }

    /// What startup replay did.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// False after shutdown or a journal failure.
    pub fn is_accepting(&self) -> bool {
        self.shared.sequencer.is_accepting()
    }

    /// Stop accepting events, drain everything already sequenced through
    /// the journal and the tree, then stop both consumers.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shared.sequencer.close().await;
        if let Some(task) = self.journal_task.take() {
            task.await.map_err(join_error)?;
        }
        let _ = self.shared.send(Command::Shutdown).await;
        if let Some(task) = self.apply_task.take() {
            task.await.map_err(join_error)?;
        }
        log::info!("Arbor engine shut down");
        Ok(())
    }
}

fn join_error(e: JoinError) -> EngineError {
    EngineError::Journal(JournalError::Io(std::io::Error::other(e)))
}
