//! Versioned persisted form of the replica and its forward migrations.
//!
//! | Version | Layout                                                   |
//! |---------|----------------------------------------------------------|
//! | 1       | records with an `owner` field, no tombstones             |
//! | 2       | records with `updated_by`, tombstones, saved timestamp   |
//!
//! Migrations only run forward. A snapshot written by a newer build is
//! rejected rather than guessed at.

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::record::{PeerId, Record, RecordId, RecordPayload, Tombstone};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Largest decompressed snapshot blob accepted.
pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// Everything needed to restore a node's replicated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub schema_version: u32,
    pub records: Vec<Record>,
    pub tombstones: Vec<Tombstone>,
    /// Server time of the save, in seconds.
    pub saved_at: u64,
}

impl ReplicaSnapshot {
    pub fn new(records: Vec<Record>, tombstones: Vec<Tombstone>, saved_at: u64) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            records,
            tombstones,
            saved_at,
        }
    }

    /// Serialize to a single LZ4-compressed blob (for hosts that persist
    /// one value instead of a database).
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let encoded = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&encoded))
    }

    /// Parse a blob written by [`ReplicaSnapshot::to_bytes`] by this or any
    /// older schema version, migrating it forward.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let declared = bytes
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| StoreError::CompressionError("Snapshot blob truncated".into()))?;
        if declared > MAX_SNAPSHOT_BYTES {
            return Err(StoreError::CompressionError(format!(
                "Declared snapshot size {declared} exceeds limit"
            )));
        }

        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;

        // Every layout leads with the schema version.
        let (version, _): (u32, _) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;

        match version {
            1 => {
                let (v1, _): (SnapshotV1, _) =
                    bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(v1.migrate())
            }
            CURRENT_SCHEMA_VERSION => {
                let (snapshot, _): (ReplicaSnapshot, _) =
                    bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(snapshot)
            }
            other => Err(StoreError::UnsupportedSchema {
                found: other,
                supported: CURRENT_SCHEMA_VERSION,
            }),
        }
    }
}

// ─── Version 1 ────────────────────────────────────────────────────

/// Record layout before tombstones existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordV1 {
    pub id: RecordId,
    pub payload: RecordPayload,
    pub version: u64,
    pub updated_at: u64,
    /// Writer of the record; renamed `updated_by` in version 2.
    pub owner: PeerId,
}

impl RecordV1 {
    pub fn migrate(self) -> Record {
        Record::new(self.id, self.payload, self.version, self.updated_at, self.owner)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotV1 {
    pub schema_version: u32,
    pub records: Vec<RecordV1>,
}

impl SnapshotV1 {
    pub fn migrate(self) -> ReplicaSnapshot {
        let saved_at = self.records.iter().map(|r| r.updated_at).max().unwrap_or(0);
        log::info!(
            "Migrating replica snapshot v1 → v{CURRENT_SCHEMA_VERSION} ({} records)",
            self.records.len()
        );
        ReplicaSnapshot::new(
            self.records.into_iter().map(RecordV1::migrate).collect(),
            Vec::new(),
            saved_at,
        )
    }
}
