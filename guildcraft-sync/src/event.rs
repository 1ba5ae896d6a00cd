//! Notifications from the sync core to its collaborators.

use crate::record::{PeerId, Record, RecordId};

/// Where data was lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncationContext {
    /// An incomplete chunk set was discarded (timeout, eviction or conflict).
    ChunkReassembly { sender: PeerId, message_id: u32 },
    /// Outbound envelopes were dropped while the queue was full.
    OutboundQueue,
}

/// Events drained by the host via `SyncNode::take_events`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A remote write replaced local state.
    RecordApplied(Record),
    /// A record was removed by a tombstone or by retention pruning.
    RecordDeleted(RecordId),
    /// `dropped` chunks or frames were lost in `context`.
    Truncated {
        context: TruncationContext,
        dropped: usize,
    },
    PeerJoined(PeerId),
    PeerLeft(PeerId),
}
