//! Journal records: one sequenced event, checksummed.
//!
//! ```text
//! ┌──────────┬──────┬──────────────────────┬──────────┐
//! │ sequence │ kind │ payload (event JSON) │ checksum │
//! │ u64      │ u8   │ variable             │ u32      │
//! └──────────┴──────┴──────────────────────┴──────────┘
//! ```
//!
//! Records are bincode-encoded before they reach the durable log, and
//! verified again when they are read back for replay.

use arbor_core::Event;
use serde::{Deserialize, Serialize};

use super::JournalError;

/// What a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    /// A tree mutation event
    Event = 1,
}

/// A single journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Sequence number assigned by the sequencer
    pub sequence: u64,
    pub kind: RecordKind,
    /// The event in its JSON wire form
    pub payload: Vec<u8>,
    /// FNV-1a fold over every other field
    pub checksum: u32,
}

impl JournalRecord {
    pub fn new(sequence: u64, kind: RecordKind, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(sequence, kind, &payload);
        Self {
            sequence,
            kind,
            payload,
            checksum,
        }
    }

    /// Build the record for a sequenced event.
    pub fn for_event(sequence: u64, event: &Event) -> Result<Self, JournalError> {
        let payload = event
            .to_json()
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        Ok(Self::new(sequence, RecordKind::Event, payload))
    }

    /// Verify the record's checksum.
    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.kind, &self.payload)
    }

    fn compute_checksum(sequence: u64, kind: RecordKind, payload: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        hash ^= sequence as u32;
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
        hash ^= (sequence >> 32) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= kind as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        for chunk in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_le_bytes(word);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    /// Serialize record to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, JournalError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| JournalError::Serialization(e.to_string()))
    }

    /// Deserialize a record and check its checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, JournalError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| JournalError::Deserialization(e.to_string()))?;
        if !record.verify() {
            return Err(JournalError::ChecksumMismatch {
                sequence: record.sequence,
            });
        }
        Ok(record)
    }

    /// Decode the event carried by an `Event` record, marked as replayed.
    pub fn event(&self) -> Result<Event, JournalError> {
        let mut event = Event::from_json(&self.payload)
            .map_err(|e| JournalError::Deserialization(e.to_string()))?;
        event.from_history = true;
        Ok(event)
    }
}
