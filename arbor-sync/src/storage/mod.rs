//! Durable storage for the event journal and tree snapshots.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  JournalRecord  ┌─────────────────────────────────┐
//! │ journal      │ ──────────────► │ DurableLog                      │
//! │ consumer     │                 │   RocksJournal (CF "journal")   │
//! └──────────────┘                 │   MemoryJournal (tests, demos)  │
//!                                  └────────────────┬────────────────┘
//! ┌──────────────┐  Snapshot (LZ4)                  │ read_from(location)
//! │ apply        │ ──────────────► SnapshotStore    ▼
//! │ consumer     │                 (CF "snapshots") replay on startup
//! └──────────────┘
//! ```
//!
//! A [`Location`] is the sequence number of a record. Records are keyed by
//! it, so reading from a location returns records in sequence order.

pub mod memory;
pub mod rocks;
pub mod snapshot;
pub mod wal;

pub use memory::MemoryJournal;
pub use rocks::{RocksJournal, StoreConfig};
pub use snapshot::Snapshot;
pub use wal::{JournalRecord, RecordKind};

use std::fmt;

use thiserror::Error;

/// Journal and snapshot storage errors.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Journal checksum mismatch at sequence {sequence}")]
    ChecksumMismatch { sequence: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal is closed")]
    Closed,
}

impl From<rocksdb::Error> for JournalError {
    fn from(e: rocksdb::Error) -> Self {
        JournalError::Database(e.to_string())
    }
}

/// Position of a record in the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location(pub u64);

impl Location {
    pub fn sequence(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Location {
        Location(self.0 + 1)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Append-only record log.
pub trait DurableLog: Send + Sync {
    /// Append an encoded record under its sequence number.
    fn append(&self, record: &JournalRecord) -> Result<Location, JournalError>;

    /// Make every appended record durable.
    fn sync(&self) -> Result<(), JournalError>;

    /// Raw records at `from` and after, in order.
    fn read_from(&self, from: Location) -> Result<Vec<(Location, Vec<u8>)>, JournalError>;

    fn read_all(&self) -> Result<Vec<(Location, Vec<u8>)>, JournalError> {
        self.read_from(Location(0))
    }

    /// The highest location written, if any.
    fn last_location(&self) -> Result<Option<Location>, JournalError>;

    /// Delete every record at or before `through`. Returns how many went.
    fn truncate_through(&self, through: Location) -> Result<u64, JournalError>;
}

/// Holds the latest tree snapshot.
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, sequence: u64, bytes: &[u8]) -> Result<(), JournalError>;

    /// The latest snapshot and the sequence it covers.
    fn load_snapshot(&self) -> Result<Option<(u64, Vec<u8>)>, JournalError>;
}

/// Everything the engine needs from a storage backend.
pub trait Storage: DurableLog + SnapshotStore {}

impl<T: DurableLog + SnapshotStore> Storage for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_order() {
        assert!(Location(1) < Location(2));
        assert_eq!(Location(4).next(), Location(5));
        assert_eq!(Location(9).to_string(), "#9");
    }

    #[test]
    fn test_error_display() {
        let err = JournalError::ChecksumMismatch { sequence: 42 };
        assert!(err.to_string().contains("42"));
        assert!(JournalError::Closed.to_string().contains("closed"));
    }
}
