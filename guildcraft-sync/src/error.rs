//! Aggregate error for per-message failures.
//!
//! None of these are fatal: the node drops the offending message, counts it
//! and carries on. `Stale` merges are outcomes, not errors.

use crate::codec::CodecError;
use crate::framer::FrameError;
use crate::record::PeerId;

#[derive(Debug, Clone)]
pub enum SyncError {
    /// Malformed or corrupt payload.
    Decode(CodecError),
    /// Sender is not a known member.
    UnknownSender(PeerId),
    /// Incomplete chunk set discarded after the reassembly timeout.
    ReassemblyTimeout {
        sender: PeerId,
        message_id: u32,
        received: u16,
        total: u16,
    },
    /// Outbound envelopes dropped while the queue was full.
    QueueOverflow { dropped_envelopes: usize, dropped_frames: usize },
    /// Chunk protocol violation.
    Frame(FrameError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Decode(e) => write!(f, "Decode error: {e}"),
            SyncError::UnknownSender(peer) => write!(f, "Unknown sender: {peer}"),
            SyncError::ReassemblyTimeout {
                sender,
                message_id,
                received,
                total,
            } => write!(
                f,
                "Reassembly timeout: message {message_id} from {sender} ({received}/{total} chunks)"
            ),
            SyncError::QueueOverflow {
                dropped_envelopes,
                dropped_frames,
            } => write!(
                f,
                "Outbound queue overflow: dropped {dropped_envelopes} envelopes ({dropped_frames} frames)"
            ),
            SyncError::Frame(e) => write!(f, "Frame error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Decode(e) => Some(e),
            SyncError::Frame(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for SyncError {
    fn from(e: CodecError) -> Self {
        SyncError::Decode(e)
    }
}

impl From<FrameError> for SyncError {
    fn from(e: FrameError) -> Self {
        SyncError::Frame(e)
    }
}
