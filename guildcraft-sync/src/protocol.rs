//! Wire messages exchanged over the guild channel.
//!
//! Every payload decodes into one closed [`WireMessage`] variant before any
//! branching logic runs:
//!
//! ```text
//! WireMessage
//!  ├── Delta(RecordBatch)      dirty records + tombstones since last publish
//!  ├── FullState(RecordBatch)  entire local state (rebroadcast)
//!  ├── Fragment(Chunk)         one slice of an oversized encoded message
//!  └── Control(ControlMessage) session hello / full-state request
//! ```
//!
//! The byte layout (header, compression) lives in [`crate::codec`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::framer::Chunk;
use crate::record::{Record, Tombstone};
use crate::transport::Priority;

/// Records and tombstones carried by a delta or full-state message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub tombstones: Vec<Tombstone>,
}

impl RecordBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.tombstones.is_empty()
    }

    /// Number of entries (records + tombstones).
    pub fn len(&self) -> usize {
        self.records.len() + self.tombstones.len()
    }

    /// Split into two batches with about half the entries each, records
    /// before tombstones. With fewer than two entries the second is empty.
    pub fn halve(mut self) -> (RecordBatch, RecordBatch) {
        let mid = self.len() / 2;
        let mut second = RecordBatch::default();
        if mid < self.records.len() {
            second.records = self.records.split_off(mid);
            second.tombstones = std::mem::take(&mut self.tombstones);
        } else {
            second.tombstones = self.tombstones.split_off(mid - self.records.len());
        }
        (self, second)
    }
}

/// Small coordination messages. Always sent at the highest priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Announces a (re)started peer. A session id not seen before from a
    /// member counts as a newly detected peer.
    Hello { session: Uuid, record_count: u32 },
    /// Asks every peer for a full rebroadcast.
    RequestFullState,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    Delta(RecordBatch),
    FullState(RecordBatch),
    Fragment(Chunk),
    Control(ControlMessage),
}

impl WireMessage {
    /// Outbound queue class for this message.
    pub fn priority(&self) -> Priority {
        match self {
            WireMessage::Delta(_) | WireMessage::Fragment(_) => Priority::Incremental,
            WireMessage::FullState(_) => Priority::FullState,
            WireMessage::Control(_) => Priority::Control,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Delta(_) => "delta",
            WireMessage::FullState(_) => "full-state",
            WireMessage::Fragment(_) => "fragment",
            WireMessage::Control(_) => "control",
        }
    }

    pub fn is_fragment(&self) -> bool {
        matches!(self, WireMessage::Fragment(_))
    }
}
