//! In-memory journal. Clones share the same records, so a test can "restart"
//! an engine over the journal a previous engine wrote.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DurableLog, JournalError, JournalRecord, Location, SnapshotStore};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<u64, Vec<u8>>,
    snapshot: Option<(u64, Vec<u8>)>,
    syncs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored bytes at `location`.
    pub fn put_raw(&self, location: Location, bytes: Vec<u8>) -> Result<(), JournalError> {
        self.lock()?.records.insert(location.0, bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `sync` was called.
    pub fn sync_count(&self) -> u64 {
        self.lock().map(|inner| inner.syncs).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, JournalError> {
        self.inner
            .lock()
            .map_err(|_| JournalError::Database("memory journal lock poisoned".to_string()))
    }
}

impl DurableLog for MemoryJournal {
    fn append(&self, record: &JournalRecord) -> Result<Location, JournalError> {
        let bytes = record.encode()?;
        self.lock()?.records.insert(record.sequence, bytes);
        Ok(Location(record.sequence))
    }

    fn sync(&self) -> Result<(), JournalError> {
        self.lock()?.syncs += 1;
        Ok(())
    }

    fn read_from(&self, from: Location) -> Result<Vec<(Location, Vec<u8>)>, JournalError> {
        Ok(self
            .lock()?
            .records
            .range(from.0..)
            .map(|(seq, bytes)| (Location(*seq), bytes.clone()))
            .collect())
    }

    fn last_location(&self) -> Result<Option<Location>, JournalError> {
        Ok(self.lock()?.records.keys().next_back().copied().map(Location))
    }

    fn truncate_through(&self, through: Location) -> Result<u64, JournalError> {
        let mut inner = self.lock()?;
        let kept = inner.records.split_off(&through.0.saturating_add(1));
        let removed = inner.records.len() as u64;
        inner.records = kept;
        Ok(removed)
    }
}

impl SnapshotStore for MemoryJournal {
    fn save_snapshot(&self, sequence: u64, bytes: &[u8]) -> Result<(), JournalError> {
        self.lock()?.snapshot = Some((sequence, bytes.to_vec()));
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<(u64, Vec<u8>)>, JournalError> {
        Ok(self.lock()?.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RecordKind;

    #[test]
    fn test_clones_share_records() {
        let journal = MemoryJournal::new();
        let other = journal.clone();
        journal
            .append(&JournalRecord::new(0, RecordKind::Event, b"x".to_vec()))
            .unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other.last_location().unwrap(), Some(Location(0)));
    }

    #[test]
    fn test_truncate_and_read_from() {
        let journal = MemoryJournal::new();
        for seq in 0..6 {
            journal
                .append(&JournalRecord::new(seq, RecordKind::Event, vec![seq as u8]))
                .unwrap();
        }
        assert_eq!(journal.truncate_through(Location(2)).unwrap(), 3);
        let rest: Vec<u64> = journal.read_all().unwrap().iter().map(|(l, _)| l.0).collect();
        assert_eq!(rest, vec![3, 4, 5]);
        assert_eq!(journal.read_from(Location(5)).unwrap().len(), 1);
    }
}
