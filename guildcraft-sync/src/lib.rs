//! # guildcraft-sync — Peer-to-peer replication of guild crafting state
//!
//! Every guild member keeps a full replica of the shared records (recipe
//! ownership, craft requests, material snapshots) and converges with the
//! others over a rate-limited, size-limited broadcast channel. There is no
//! authority: conflicts resolve by last-writer-wins, deletions travel as
//! tombstones.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  record_changed   ┌──────────────┐   frames    ┌──────────────┐
//! │ Host (addon  │ ────────────────► │  SyncNode    │ ──────────► │ Guild        │
//! │ UI, bags,    │ ◄──────────────── │  (per peer)  │ ◄────────── │ channel      │
//! │ roster)      │    SyncEvent      └──────┬───────┘   receive   │ (≤255 bytes) │
//! └──────────────┘                          │                     └──────────────┘
//!                                           ▼
//!                    ┌───────────────────────────────────────────┐
//!                    │ ReplicationEngine → Codec → Framer →      │
//!                    │ TransportQueue (priority + token bucket)  │
//!                    └───────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] — Record, tombstone and payload types
//! - [`replication`] — Last-writer-wins merge, dirty tracking, pruning
//! - [`protocol`] / [`codec`] — Wire messages and their versioned encoding
//! - [`framer`] — Splitting and reassembly of oversized frames
//! - [`transport`] — Priority queue with rate limiting and suspension
//! - [`scheduler`] — Publish debouncing
//! - [`membership`] — Guild roster cache
//! - [`node`] — The event-driven sync node
//! - [`runtime`] / [`channel`] — tokio driver and in-process channel
//! - [`storage`] — Snapshot persistence (RocksDB) with schema migration

pub mod channel;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod framer;
pub mod membership;
pub mod node;
pub mod protocol;
pub mod record;
pub mod replication;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use channel::{ChannelError, ChannelFrame, ChannelStats, GuildChannel};
pub use clock::{ManualClock, ServerClock, SystemServerClock};
pub use codec::{Codec, CodecError};
pub use config::{ConfigError, SyncConfig};
pub use error::SyncError;
pub use event::{SyncEvent, TruncationContext};
pub use framer::{Chunk, FrameError, Reassembler};
pub use membership::{MembershipCache, Peer, PeerRole, RosterDiff, RosterSource};
pub use node::{NodeStats, SyncNode};
pub use protocol::{ControlMessage, RecordBatch, WireMessage};
pub use record::{
    CraftRequest, MaterialCount, MaterialSnapshot, PeerId, RecipeOwnership, Record, RecordId,
    RecordPayload, RequestStatus, Tombstone,
};
pub use replication::{BatchOutcome, MergeOutcome, ReplicationEngine, Retention};
pub use runtime::{NodeCommand, RuntimeClosed, SyncHandle, SyncRuntime};
pub use scheduler::PublishScheduler;
pub use storage::{ReplicaSnapshot, ReplicaStore, StoreConfig, StoreError};
pub use transport::{Priority, TransportStats};
