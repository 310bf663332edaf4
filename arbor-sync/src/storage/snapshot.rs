//! Tree snapshots: the whole tree as JSON, LZ4-compressed.

use arbor_core::Node;
use serde::{Deserialize, Serialize};

use super::JournalError;

/// The tree as of `sequence` (every event up to and including it applied).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub root: Node,
}

impl Snapshot {
    pub fn new(sequence: u64, root: Node) -> Self {
        Self { sequence, root }
    }

    /// Serialize and compress.
    pub fn encode(&self) -> Result<Vec<u8>, JournalError> {
        let json = serde_json::to_vec(self).map_err(|e| JournalError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, JournalError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| JournalError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| JournalError::Deserialization(e.to_string()))
    }
}
