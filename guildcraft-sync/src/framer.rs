//! Chunking of oversized payloads and out-of-order reassembly.
//!
//! ```text
//! encoded message (50 KB)
//!   │ split(max_chunk_size = 4 KB)
//!   ▼
//! [0/13] [1/13] ... [12/13]    each wrapped in WireMessage::Fragment
//!   │        lossy, unordered broadcast
//!   ▼
//! Reassembler[(sender, message_id)] ── complete ──► encoded message
//!   │
//!   └── expired after reassembly_timeout ──► truncation event
//! ```
//!
//! Buffers are keyed by `(sender, message_id)` so two peers reusing the
//! same counter never mix. Only completeness matters, not order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::record::PeerId;

/// One ordered fragment of an oversized encoded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Per-sender message counter
    pub message_id: u32,
    /// Position in `0..total`
    pub index: u16,
    pub total: u16,
    pub data: Vec<u8>,
}

/// Chunk protocol violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// `total` of zero or `index >= total`
    InvalidIndex { index: u16, total: u16 },
    /// A chunk disagreed with the total count of its buffer
    TotalMismatch { expected: u16, got: u16 },
    /// Same index delivered twice with different data
    ConflictingChunk { index: u16 },
    /// Buffered bytes would exceed the per-message limit
    MessageTooLarge { limit: usize },
    /// Payload needs more chunks than a u16 can count
    TooManyChunks(usize),
    /// A reassembled payload was itself a fragment
    NestedFragment,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::InvalidIndex { index, total } => {
                write!(f, "Invalid chunk index {index} of {total}")
            }
            FrameError::TotalMismatch { expected, got } => {
                write!(f, "Chunk total mismatch: expected {expected}, got {got}")
            }
            FrameError::ConflictingChunk { index } => {
                write!(f, "Conflicting data for chunk {index}")
            }
            FrameError::MessageTooLarge { limit } => {
                write!(f, "Reassembled message exceeds {limit} bytes")
            }
            FrameError::TooManyChunks(n) => write!(f, "Payload needs {n} chunks"),
            FrameError::NestedFragment => write!(f, "Reassembled payload is a fragment"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Assigns message ids and splits payloads.
#[derive(Debug, Default)]
pub struct Framer {
    next_message_id: u32,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `bytes` into chunks of at most `max_chunk_size` data bytes,
    /// all sharing a fresh message id.
    pub fn split(&mut self, bytes: &[u8], max_chunk_size: usize) -> Result<Vec<Chunk>, FrameError> {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        split(message_id, bytes, max_chunk_size)
    }

    pub fn reset(&mut self) {
        self.next_message_id = 0;
    }
}

/// Split `bytes` into ordered chunks tagged with `message_id`.
pub fn split(message_id: u32, bytes: &[u8], max_chunk_size: usize) -> Result<Vec<Chunk>, FrameError> {
    let max_chunk_size = max_chunk_size.max(1);
    let count = bytes.len().div_ceil(max_chunk_size).max(1);
    let total = u16::try_from(count).map_err(|_| FrameError::TooManyChunks(count))?;

    if bytes.is_empty() {
        return Ok(vec![Chunk {
            message_id,
            index: 0,
            total: 1,
            data: Vec::new(),
        }]);
    }

    Ok(bytes
        .chunks(max_chunk_size)
        .enumerate()
        .map(|(i, data)| Chunk {
            message_id,
            index: i as u16,
            total,
            data: data.to_vec(),
        })
        .collect())
}

/// Transient reassembly state for one multi-part message.
#[derive(Debug)]
struct ChunkSet {
    total: u16,
    parts: Vec<Option<Vec<u8>>>,
    received: u16,
    bytes: usize,
    created_at: Instant,
}

impl ChunkSet {
    fn new(total: u16, now: Instant) -> Self {
        Self {
            total,
            parts: vec![None; total as usize],
            received: 0,
            bytes: 0,
            created_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.total
    }

    fn assemble(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for part in self.parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        out
    }
}

/// A chunk set discarded before completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedSet {
    pub sender: PeerId,
    pub message_id: u32,
    pub received: u16,
    pub total: u16,
}

/// Reassembles chunks per `(sender, message_id)`.
pub struct Reassembler {
    buffers: HashMap<(PeerId, u32), ChunkSet>,
    timeout: Duration,
    /// Concurrent incomplete sets; the oldest is evicted beyond this.
    max_buffers: usize,
    /// Per-message byte cap.
    max_message_bytes: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_buffers: usize, max_message_bytes: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            timeout,
            max_buffers: max_buffers.max(1),
            max_message_bytes,
        }
    }

    /// Feed one chunk.
    ///
    /// Returns `Ok(Some(bytes))` once every chunk of the message has
    /// arrived, `Ok(None)` while incomplete. On a protocol violation the
    /// whole buffer is discarded and the error returned. Every set dropped
    /// here, whether evicted to make room or discarded on a violation, is
    /// pushed onto `discarded`.
    pub fn accumulate(
        &mut self,
        sender: &PeerId,
        chunk: Chunk,
        now: Instant,
        discarded: &mut Vec<DiscardedSet>,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        if chunk.total == 0 || chunk.index >= chunk.total {
            return Err(FrameError::InvalidIndex {
                index: chunk.index,
                total: chunk.total,
            });
        }
        if chunk.total == 1 {
            return Ok(Some(chunk.data));
        }

        let key = (sender.clone(), chunk.message_id);

        if !self.buffers.contains_key(&key) {
            if self.buffers.len() >= self.max_buffers {
                if let Some(oldest) = self.evict_oldest() {
                    discarded.push(oldest);
                }
            }
            self.buffers.insert(key.clone(), ChunkSet::new(chunk.total, now));
        }

        let result = Self::insert(
            self.buffers.get_mut(&key),
            chunk,
            self.max_message_bytes,
        );
        match result {
            Ok(true) => Ok(self.buffers.remove(&key).map(ChunkSet::assemble)),
            Ok(false) => Ok(None),
            Err(e) => {
                if let Some(set) = self.buffers.remove(&key) {
                    discarded.push(DiscardedSet {
                        sender: key.0,
                        message_id: key.1,
                        received: set.received,
                        total: set.total,
                    });
                }
                Err(e)
            }
        }
    }

    /// Returns whether the set is now complete.
    fn insert(
        set: Option<&mut ChunkSet>,
        chunk: Chunk,
        max_message_bytes: usize,
    ) -> Result<bool, FrameError> {
        let Some(set) = set else {
            return Ok(false);
        };
        if set.total != chunk.total {
            return Err(FrameError::TotalMismatch {
                expected: set.total,
                got: chunk.total,
            });
        }

        let slot = &mut set.parts[chunk.index as usize];
        match slot {
            Some(existing) if *existing == chunk.data => return Ok(set.is_complete()),
            Some(_) => return Err(FrameError::ConflictingChunk { index: chunk.index }),
            None => {}
        }

        if set.bytes + chunk.data.len() > max_message_bytes {
            return Err(FrameError::MessageTooLarge {
                limit: max_message_bytes,
            });
        }
        set.bytes += chunk.data.len();
        set.received += 1;
        *slot = Some(chunk.data);
        Ok(set.is_complete())
    }

    fn evict_oldest(&mut self) -> Option<DiscardedSet> {
        let key = self
            .buffers
            .iter()
            .min_by_key(|(_, set)| set.created_at)
            .map(|(key, _)| key.clone())?;
        let set = self.buffers.remove(&key)?;
        Some(DiscardedSet {
            sender: key.0,
            message_id: key.1,
            received: set.received,
            total: set.total,
        })
    }

    /// Discard every set older than the reassembly timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<DiscardedSet> {
        let timeout = self.timeout;
        let stale: Vec<(PeerId, u32)> = self
            .buffers
            .iter()
            .filter(|(_, set)| now.saturating_duration_since(set.created_at) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| {
                self.buffers.remove(&key).map(|set| DiscardedSet {
                    sender: key.0,
                    message_id: key.1,
                    received: set.received,
                    total: set.total,
                })
            })
            .collect()
    }

    /// Drop every buffer belonging to `sender`.
    pub fn forget_sender(&mut self, sender: &PeerId) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|(peer, _), _| peer != sender);
        before - self.buffers.len()
    }

    /// Number of incomplete sets held.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
