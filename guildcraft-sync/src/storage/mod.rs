//! Persistent storage for a node's replica.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  snapshot()   ┌─────────────────┐  save_snapshot()  ┌──────────────┐
//! │ SyncNode    │ ────────────► │ ReplicaSnapshot │ ────────────────► │ ReplicaStore │
//! │ (in-memory) │ ◄──────────── │ (schema v2)     │ ◄──────────────── │ (RocksDB)    │
//! └─────────────┘  restore()    └─────────────────┘  load_snapshot()  └──────┬───────┘
//!                                                                          │
//!                                              ┌───────────────────────────┴────┐
//!                                              │ CF "records"    — live records  │
//!                                              │ CF "tombstones" — deletions     │
//!                                              │ CF "metadata"   — schema, saved │
//!                                              └────────────────────────────────┘
//! ```
//!
//! Hosts without a database can persist [`ReplicaSnapshot::to_bytes`] as a
//! single blob instead.

pub mod rocks;
pub mod schema;

pub use rocks::{ReplicaStore, StoreConfig, StoreError};
pub use schema::{RecordV1, ReplicaSnapshot, SnapshotV1, CURRENT_SCHEMA_VERSION};
