//! Startup replay: restore the latest snapshot, then redo every journal
//! record after it, in sequence order.

use arbor_core::Persistence;

use crate::config::ReplayPolicy;
use crate::error::{EngineError, Result};
use crate::storage::{JournalRecord, Location, Snapshot, Storage};

/// What replay found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sequence covered by the restored snapshot
    pub snapshot_sequence: Option<u64>,
    /// Journal records re-applied
    pub replayed: u64,
    /// Corrupt records passed over under [`ReplayPolicy::Skip`]
    pub skipped: u64,
    /// Highest sequence seen in the snapshot or the journal
    pub last_sequence: Option<u64>,
}

impl RecoveryReport {
    /// Where the sequencer continues.
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence.map_or(0, |s| s + 1)
    }
}

/// Rebuild `persistence` from `storage`.
pub fn recover(
    storage: &dyn Storage,
    persistence: &mut Persistence,
    policy: ReplayPolicy,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    if let Some((sequence, bytes)) = storage.load_snapshot()? {
        let snapshot = Snapshot::decode(&bytes)
            .map_err(|e| EngineError::Snapshot(format!("snapshot {sequence}: {e}")))?;
        persistence.restore(snapshot.root);
        report.snapshot_sequence = Some(sequence);
        report.last_sequence = Some(sequence);
        log::info!("Restored snapshot at sequence {sequence}");
    }

    let start = report.snapshot_sequence.map_or(Location(0), |s| Location(s).next());
    for (location, bytes) in storage.read_from(start)? {
        report.last_sequence = Some(report.last_sequence.map_or(location.0, |s| s.max(location.0)));

        let record = match decode(location, &bytes) {
            Ok(record) => record,
            Err(reason) => match policy {
                ReplayPolicy::Abort => return Err(EngineError::CorruptRecord { location, reason }),
                ReplayPolicy::Skip => {
                    log::warn!("Skipping corrupt journal record at {location}: {reason}");
                    report.skipped += 1;
                    continue;
                }
            },
        };

        let event = match record.event() {
            Ok(event) => event,
            Err(e) => match policy {
                ReplayPolicy::Abort => {
                    return Err(EngineError::CorruptRecord {
                        location,
                        reason: e.to_string(),
                    })
                }
                ReplayPolicy::Skip => {
                    log::warn!("Skipping undecodable event at {location}: {e}");
                    report.skipped += 1;
                    continue;
                }
            },
        };

        if let Err(e) = persistence.apply(&event, record.sequence) {
            log::warn!("Replayed event {} rejected: {e}", record.sequence);
        }
        report.replayed += 1;
    }

    log::info!(
        "Recovery complete: {} replayed, {} skipped, next sequence {}",
        report.replayed,
        report.skipped,
        report.next_sequence()
    );
    Ok(report)
}

fn decode(location: Location, bytes: &[u8]) -> std::result::Result<JournalRecord, String> {
    let record = JournalRecord::decode(bytes).map_err(|e| e.to_string())?;
    if record.sequence != location.0 {
        return Err(format!("record claims sequence {}", record.sequence));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DurableLog, MemoryJournal, SnapshotStore};
    use arbor_core::{Event, Path, Value};
    use serde_json::json;

    fn journal_of(events: &[Event]) -> MemoryJournal {
        let journal = MemoryJournal::new();
        for (seq, event) in events.iter().enumerate() {
            journal
                .append(&JournalRecord::for_event(seq as u64, event).unwrap())
                .unwrap();
        }
        journal
    }

    fn events() -> Vec<Event> {
        vec![
            Event::set("/users/1", json!({"name": "Ann", "age": 30})),
            Event::set("/users/1/age", 31),
            Event::push_named("/posts", "p1", json!({"t": "hi"})),
            Event::remove("/users/1/name"),
        ]
    }

    fn live_root(events: &[Event]) -> arbor_core::Node {
        let mut p = Persistence::default();
        for (seq, event) in events.iter().enumerate() {
            p.apply(event, seq as u64).unwrap();
        }
        p.root().clone()
    }

    #[test]
    fn test_replay_matches_live_tree() {
        let events = events();
        let journal = journal_of(&events);
        let mut p = Persistence::default();

        let report = recover(&journal, &mut p, ReplayPolicy::Abort).unwrap();
        assert_eq!(report.replayed, 4);
        assert_eq!(report.next_sequence(), 4);
        assert_eq!(p.root(), &live_root(&events));
    }

    #[test]
    fn test_empty_storage() {
        let mut p = Persistence::default();
        let report = recover(&MemoryJournal::new(), &mut p, ReplayPolicy::Abort).unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert_eq!(report.next_sequence(), 0);
    }

    #[test]
    fn test_snapshot_then_tail() {
        let events = events();
        let journal = journal_of(&events);
        let snapshot = Snapshot::new(1, live_root(&events[..2]));
        journal.save_snapshot(1, &snapshot.encode().unwrap()).unwrap();
        journal.truncate_through(Location(1)).unwrap();

        let mut p = Persistence::default();
        let report = recover(&journal, &mut p, ReplayPolicy::Abort).unwrap();
        assert_eq!(report.snapshot_sequence, Some(1));
        assert_eq!(report.replayed, 2);
        assert_eq!(p.root(), &live_root(&events));
    }

    #[test]
    fn test_records_covered_by_snapshot_are_not_redone() {
        let events = events();
        let journal = journal_of(&events);
        let snapshot = Snapshot::new(3, live_root(&events));
        journal.save_snapshot(3, &snapshot.encode().unwrap()).unwrap();

        let mut p = Persistence::default();
        let report = recover(&journal, &mut p, ReplayPolicy::Abort).unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.next_sequence(), 4);
    }

    #[test]
    fn test_corrupt_record_policy() {
        let events = events();
        let journal = journal_of(&events);
        journal.put_raw(Location(1), vec![0xFF; 12]).unwrap();

        let mut p = Persistence::default();
        let err = recover(&journal, &mut p, ReplayPolicy::Abort).unwrap_err();
        assert!(matches!(err, EngineError::CorruptRecord { location: Location(1), .. }));

        let mut p = Persistence::default();
        let report = recover(&journal, &mut p, ReplayPolicy::Skip).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.replayed, 3);
        assert_eq!(report.next_sequence(), 4);
        assert_eq!(
            p.get(&Path::parse("/users/1/age").unwrap()),
            Some(Value::from(30))
        );
    }

    #[test]
    fn test_misplaced_record_is_corrupt() {
        let journal = MemoryJournal::new();
        let record = JournalRecord::for_event(9, &Event::set("/a", 1)).unwrap();
        journal.put_raw(Location(0), record.encode().unwrap()).unwrap();

        let mut p = Persistence::default();
        assert!(matches!(
            recover(&journal, &mut p, ReplayPolicy::Abort),
            Err(EngineError::CorruptRecord { .. })
        ));
    }
}
