use thiserror::Error;

use crate::storage::{JournalError, Location};

/// Errors surfaced by the engine and connection handles.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Journal I/O failed. The journal consumer stops and the engine no
    /// longer accepts writes.
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// A journal record failed to decode during replay.
    #[error("Corrupt journal record at {location}: {reason}")]
    CorruptRecord { location: Location, reason: String },

    /// The request was rejected before reaching the tree.
    #[error(transparent)]
    Data(#[from] arbor_core::Error),

    #[error("Engine is closed")]
    Closed,

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
