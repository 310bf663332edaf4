//! RocksDB-backed journal and snapshot store.
//!
//! Column families:
//! - `journal`   — Encoded [`JournalRecord`]s keyed by sequence (8 bytes BE)
//! - `snapshots` — The latest tree snapshot under key `latest`
//!   (value: sequence, 8 bytes BE, followed by the LZ4 snapshot bytes)
//!
//! Big-endian keys make RocksDB's byte order equal sequence order, so a
//! forward iterator from a location is a replay in commit order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DurableLog, JournalError, JournalRecord, Location, SnapshotStore};

const CF_JOURNAL: &str = "journal";
const CF_SNAPSHOTS: &str = "snapshots";

const COLUMN_FAMILIES: &[&str] = &[CF_JOURNAL, CF_SNAPSHOTS];

const LATEST_SNAPSHOT: &[u8] = b"latest";

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("arbor_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB journal.
///
/// The handle is shared between the journal consumer (append, sync) and
/// snapshot writers, so the single-threaded DB sits behind a mutex. Each
/// call holds it only for one RocksDB operation or batch.
pub struct RocksJournal {
    db: Mutex<DBWithThreadMode<SingleThreaded>>,
    config: StoreConfig,
}

impl RocksJournal {
    /// Open the journal at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, JournalError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened journal at {}", config.path.display());

        Ok(Self {
            db: Mutex::new(db),
            config,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_JOURNAL => {
                // Sequential appends, sequential reads during replay
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_SNAPSHOTS => {
                // Values are already LZ4 compressed
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn with_db<R>(
        &self,
        f: impl FnOnce(&DBWithThreadMode<SingleThreaded>) -> Result<R, JournalError>,
    ) -> Result<R, JournalError> {
        let db = self
            .db
            .lock()
            .map_err(|_| JournalError::Database("journal lock poisoned".to_string()))?;
        f(&db)
    }
}

impl DurableLog for RocksJournal {
    fn append(&self, record: &JournalRecord) -> Result<Location, JournalError> {
        let value = record.encode()?;
        self.with_db(|db| {
            let cf = cf(db, CF_JOURNAL)?;
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(false);
            db.put_cf_opt(&cf, record.sequence.to_be_bytes(), &value, &write_opts)?;
            Ok(Location(record.sequence))
        })
    }

    fn sync(&self) -> Result<(), JournalError> {
        self.with_db(|db| {
            db.flush_wal(true)?;
            Ok(())
        })
    }

    fn read_from(&self, from: Location) -> Result<Vec<(Location, Vec<u8>)>, JournalError> {
        self.with_db(|db| {
            let cf = cf(db, CF_JOURNAL)?;
            let start_key = from.0.to_be_bytes();
            let mut records = Vec::new();
            for item in db.iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward)) {
                let (key, value) = item?;
                let Some(sequence) = decode_key(&key) else {
                    log::warn!("Skipping journal key of {} bytes", key.len());
                    continue;
                };
                records.push((Location(sequence), value.to_vec()));
            }
            Ok(records)
        })
    }

    fn last_location(&self) -> Result<Option<Location>, JournalError> {
        self.with_db(|db| {
            let cf = cf(db, CF_JOURNAL)?;
            let mut iter = db.iterator_cf(&cf, IteratorMode::End);
            match iter.next() {
                Some(item) => {
                    let (key, _) = item?;
                    Ok(decode_key(&key).map(Location))
                }
                None => Ok(None),
            }
        })
    }

    fn truncate_through(&self, through: Location) -> Result<u64, JournalError> {
        self.with_db(|db| {
            let cf = cf(db, CF_JOURNAL)?;
            let mut count = 0u64;
            let mut batch = WriteBatch::default();
            for item in db.iterator_cf(&cf, IteratorMode::Start) {
                let (key, _) = item?;
                match decode_key(&key) {
                    Some(sequence) if sequence > through.0 => break,
                    _ => {
                        batch.delete_cf(&cf, &key);
                        count += 1;
                    }
                }
            }
            if count > 0 {
                db.write(batch)?;
            }
            Ok(count)
        })
    }
}

impl SnapshotStore for RocksJournal {
    fn save_snapshot(&self, sequence: u64, bytes: &[u8]) -> Result<(), JournalError> {
        let mut value = Vec::with_capacity(8 + bytes.len());
        value.extend_from_slice(&sequence.to_be_bytes());
        value.extend_from_slice(bytes);
        self.with_db(|db| {
            let cf = cf(db, CF_SNAPSHOTS)?;
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(true);
            db.put_cf_opt(&cf, LATEST_SNAPSHOT, &value, &write_opts)?;
            Ok(())
        })
    }

    fn load_snapshot(&self) -> Result<Option<(u64, Vec<u8>)>, JournalError> {
        self.with_db(|db| {
            let cf = cf(db, CF_SNAPSHOTS)?;
            let Some(value) = db.get_cf(&cf, LATEST_SNAPSHOT)? else {
                return Ok(None);
            };
            let sequence = decode_key(&value).ok_or_else(|| {
                JournalError::Deserialization("snapshot record too short".to_string())
            })?;
            Ok(Some((sequence, value[8..].to_vec())))
        })
    }
}

/// Get a column family handle.
fn cf<'a>(
    db: &'a DBWithThreadMode<SingleThreaded>,
    name: &str,
) -> Result<&'a rocksdb::ColumnFamily, JournalError> {
    db.cf_handle(name)
        .ok_or_else(|| JournalError::Database(format!("Column family '{name}' not found")))
}

/// The sequence in the first 8 bytes, big-endian.
fn decode_key(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RecordKind;

    fn open(dir: &tempfile::TempDir) -> RocksJournal {
        RocksJournal::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn record(sequence: u64) -> JournalRecord {
        JournalRecord::new(sequence, RecordKind::Event, format!("e{sequence}").into_bytes())
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        assert!(journal.path().exists());
        assert_eq!(journal.last_location().unwrap(), None);
    }

    #[test]
    fn test_append_read_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);

        // 256 sorts before 3 as a little-endian or decimal key; not as BE.
        for seq in [1, 3, 256] {
            journal.append(&record(seq)).unwrap();
        }
        journal.sync().unwrap();

        let all = journal.read_all().unwrap();
        let locations: Vec<u64> = all.iter().map(|(l, _)| l.0).collect();
        assert_eq!(locations, vec![1, 3, 256]);
        assert_eq!(JournalRecord::decode(&all[2].1).unwrap().payload, b"e256");

        let tail = journal.read_from(Location(3)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(journal.last_location().unwrap(), Some(Location(256)));
    }

    #[test]
    fn test_truncate_through() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        for seq in 0..10 {
            journal.append(&record(seq)).unwrap();
        }

        assert_eq!(journal.truncate_through(Location(4)).unwrap(), 5);
        let remaining = journal.read_all().unwrap();
        assert_eq!(remaining.first().map(|(l, _)| l.0), Some(5));
        assert_eq!(remaining.len(), 5);
    }

    #[test]
    fn test_reopen_keeps_records_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = open(&dir);
            journal.append(&record(0)).unwrap();
            journal.append(&record(1)).unwrap();
            journal.save_snapshot(1, b"tree").unwrap();
            journal.sync().unwrap();
        }

        let journal = open(&dir);
        assert_eq!(journal.last_location().unwrap(), Some(Location(1)));
        assert_eq!(journal.load_snapshot().unwrap(), Some((1, b"tree".to_vec())));
    }

    #[test]
    fn test_snapshot_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        assert_eq!(journal.load_snapshot().unwrap(), None);

        journal.save_snapshot(5, b"old").unwrap();
        journal.save_snapshot(9, b"new").unwrap();
        assert_eq!(journal.load_snapshot().unwrap(), Some((9, b"new".to_vec())));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert_eq!(config.path, PathBuf::from("arbor_data"));
    }
}
