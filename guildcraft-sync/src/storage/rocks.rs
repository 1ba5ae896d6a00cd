//! RocksDB-backed replica store.
//!
//! Column families:
//! - `records`    — one entry per record id (bincode + LZ4)
//! - `tombstones` — one entry per deleted id (bincode + LZ4)
//! - `metadata`   — schema version and last save time (big-endian integers)
//!
//! Full snapshots are written in a single atomic batch, so a crash leaves
//! either the previous or the new replica on disk, never a mix.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::schema::{RecordV1, ReplicaSnapshot, CURRENT_SCHEMA_VERSION};
use crate::record::{Record, RecordId, Tombstone};

const CF_RECORDS: &str = "records";
const CF_TOMBSTONES: &str = "tombstones";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_TOMBSTONES, CF_METADATA];

const KEY_SCHEMA_VERSION: &[u8] = b"schema_version";
const KEY_SAVED_AT: &[u8] = b"saved_at";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 128)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 4MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("guildcraft_data"),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 128,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 32,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Persisted data was written by a newer schema
    UnsupportedSchema { found: u32, supported: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::UnsupportedSchema { found, supported } => write!(
                f,
                "Unsupported schema version {found} (this build supports up to {supported})"
            ),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable home for a node's records and tombstones.
pub struct ReplicaStore {
    /// RocksDB instance (single-threaded mode; the node is single-threaded)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    schema_version: u32,
}

impl ReplicaStore {
    /// Open the store, creating it if missing and migrating older schemas.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let mut store = Self {
            db,
            config,
            schema_version: CURRENT_SCHEMA_VERSION,
        };
        store.schema_version = store.upgrade_schema()?;
        log::info!(
            "Opened replica store at {} (schema v{}, {} records)",
            store.config.path.display(),
            store.schema_version,
            store.record_count()?
        );
        Ok(store)
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are LZ4-compressed already
            CF_RECORDS | CF_TOMBSTONES => {
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_METADATA => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Bring on-disk data to [`CURRENT_SCHEMA_VERSION`]. Returns the version
    /// now on disk.
    fn upgrade_schema(&self) -> Result<u32, StoreError> {
        let stored = self.read_u64(KEY_SCHEMA_VERSION)?.map(|v| v as u32);

        match stored {
            Some(v) if v > CURRENT_SCHEMA_VERSION => Err(StoreError::UnsupportedSchema {
                found: v,
                supported: CURRENT_SCHEMA_VERSION,
            }),
            Some(CURRENT_SCHEMA_VERSION) => Ok(CURRENT_SCHEMA_VERSION),
            Some(1) => {
                self.migrate_v1()?;
                Ok(CURRENT_SCHEMA_VERSION)
            }
            Some(other) => Err(StoreError::DeserializationError(format!(
                "Unknown schema version {other}"
            ))),
            None => {
                let cf = self.cf(CF_METADATA)?;
                let mut write_opts = WriteOptions::default();
                write_opts.set_sync(self.config.sync_writes);
                self.db.put_cf_opt(
                    cf,
                    KEY_SCHEMA_VERSION,
                    (CURRENT_SCHEMA_VERSION as u64).to_be_bytes(),
                    &write_opts,
                )?;
                Ok(CURRENT_SCHEMA_VERSION)
            }
        }
    }

    /// v1 rows carry `owner` instead of `updated_by`; rewrite them in place.
    fn migrate_v1(&self) -> Result<(), StoreError> {
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        let mut migrated = 0usize;
        for item in self.db.iterator_cf(cf_records, IteratorMode::Start) {
            let (key, value) = item?;
            let old: RecordV1 = decode_value(&value)?;
            batch.put_cf(cf_records, &key, encode_value(&old.migrate())?);
            migrated += 1;
        }
        batch.put_cf(
            cf_meta,
            KEY_SCHEMA_VERSION,
            (CURRENT_SCHEMA_VERSION as u64).to_be_bytes(),
        );

        self.write(batch)?;
        log::info!("Migrated replica store v1 → v{CURRENT_SCHEMA_VERSION} ({migrated} records)");
        Ok(())
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace everything on disk with `snapshot` in one atomic batch.
    pub fn save_snapshot(&self, snapshot: &ReplicaSnapshot) -> Result<(), StoreError> {
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_tombstones = self.cf(CF_TOMBSTONES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for cf in [cf_records, cf_tombstones] {
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, &key);
            }
        }

        for record in &snapshot.records {
            batch.put_cf(cf_records, record.id.as_str(), encode_value(record)?);
        }
        for tombstone in &snapshot.tombstones {
            batch.put_cf(cf_tombstones, tombstone.id.as_str(), encode_value(tombstone)?);
        }
        batch.put_cf(cf_meta, KEY_SAVED_AT, snapshot.saved_at.to_be_bytes());

        self.write(batch)?;
        log::debug!(
            "Saved replica snapshot: {} records, {} tombstones",
            snapshot.records.len(),
            snapshot.tombstones.len()
        );
        Ok(())
    }

    /// Load the full replica. Entries come back clean and ordered by id.
    pub fn load_snapshot(&self) -> Result<ReplicaSnapshot, StoreError> {
        let records = self.load_cf::<Record>(CF_RECORDS)?;
        let tombstones = self.load_cf::<Tombstone>(CF_TOMBSTONES)?;
        let saved_at = self.read_u64(KEY_SAVED_AT)?.unwrap_or(0);
        Ok(ReplicaSnapshot::new(records, tombstones, saved_at))
    }

    fn load_cf<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(decode_value(&value)?);
        }
        Ok(out)
    }

    // ─── Single entries ───────────────────────────────────────────────

    /// Upsert one record, clearing any tombstone for its id.
    pub fn put_record(&self, record: &Record) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_RECORDS)?, record.id.as_str(), encode_value(record)?);
        batch.delete_cf(self.cf(CF_TOMBSTONES)?, record.id.as_str());
        self.write(batch)
    }

    /// Store a tombstone and remove the record it deletes.
    pub fn put_tombstone(&self, tombstone: &Tombstone) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_TOMBSTONES)?,
            tombstone.id.as_str(),
            encode_value(tombstone)?,
        );
        batch.delete_cf(self.cf(CF_RECORDS)?, tombstone.id.as_str());
        self.write(batch)
    }

    /// Drop a record without leaving a tombstone (retention pruning).
    pub fn remove_record(&self, id: &RecordId) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_RECORDS)?, id.as_str());
        self.write(batch)
    }

    pub fn get_record(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        match self.db.get_cf(self.cf(CF_RECORDS)?, id.as_str())? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn record_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn read_u64(&self, key: &[u8]) -> Result<Option<u64>, StoreError> {
        match self.db.get_cf(self.cf(CF_METADATA)?, key)? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::DeserializationError(format!(
                        "Metadata {} has {} bytes",
                        String::from_utf8_lossy(key),
                        bytes.len()
                    ))
                })?;
                Ok(Some(u64::from_be_bytes(buf)))
            }
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let encoded = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&encoded))
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}
