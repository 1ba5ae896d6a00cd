//! In-process guild channel: size-limited fan-out to every member.
//!
//! Stands in for the game's addon channel in hosts without one and in
//! integration tests. Every frame goes to every subscriber, the sender
//! included (receivers filter their own echoes, as the real channel
//! requires). Frames above `max_frame_size` are rejected.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers; a lagging
//! receiver loses the oldest frames, which the sync protocol tolerates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::membership::Peer;
use crate::record::PeerId;

/// One frame on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFrame {
    pub sender: PeerId,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_rejected: u64,
    pub active_members: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    FrameTooLarge { size: usize, limit: usize },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::FrameTooLarge { size, limit } => {
                write!(f, "Frame of {size} bytes exceeds channel limit of {limit}")
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Lock-free counters; read via [`GuildChannel::stats`].
struct AtomicChannelStats {
    frames_sent: AtomicU64,
    frames_rejected: AtomicU64,
}

/// A broadcast group for one guild.
pub struct GuildChannel {
    sender: broadcast::Sender<Arc<ChannelFrame>>,
    members: Arc<RwLock<HashSet<PeerId>>>,
    capacity: usize,
    max_frame_size: usize,
    atomic_stats: Arc<AtomicChannelStats>,
}

impl GuildChannel {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize, max_frame_size: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: Arc::new(RwLock::new(HashSet::new())),
            capacity,
            max_frame_size,
            atomic_stats: Arc::new(AtomicChannelStats {
                frames_sent: AtomicU64::new(0),
                frames_rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Join the channel; the returned receiver sees every later frame.
    pub async fn join(&self, peer: PeerId) -> broadcast::Receiver<Arc<ChannelFrame>> {
        let mut members = self.members.write().await;
        log::debug!("{} joined guild channel ({} members)", peer, members.len() + 1);
        members.insert(peer);
        self.sender.subscribe()
    }

    /// Leave the channel. Receivers already handed out keep working until
    /// dropped.
    pub async fn leave(&self, peer: &PeerId) -> bool {
        self.members.write().await.remove(peer)
    }

    /// Send a frame to every subscriber. Returns the number of receivers.
    pub fn send(&self, sender: &PeerId, bytes: Vec<u8>) -> Result<usize, ChannelError> {
        if bytes.len() > self.max_frame_size {
            self.atomic_stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::FrameTooLarge {
                size: bytes.len(),
                limit: self.max_frame_size,
            });
        }

        let frame = Arc::new(ChannelFrame {
            sender: sender.clone(),
            bytes,
        });
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Current members as an online roster.
    pub async fn roster(&self, now_secs: u64) -> Vec<Peer> {
        let members = self.members.read().await;
        let mut roster: Vec<Peer> = members
            .iter()
            .map(|id| Peer::online(id.clone(), now_secs))
            .collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_member(&self, peer: &PeerId) -> bool {
        self.members.read().await.contains(peer)
    }

    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_rejected: self.atomic_stats.frames_rejected.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Raw receiver without joining (observers, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChannelFrame>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_leave() {
        let channel = GuildChannel::new(16, 255);
        let alice = PeerId::from("Alice");

        let _rx = channel.join(alice.clone()).await;
        assert_eq!(channel.member_count().await, 1);
        assert!(channel.is_member(&alice).await);

        assert!(channel.leave(&alice).await);
        assert!(!channel.is_member(&alice).await);
    }

    #[tokio::test]
    async fn test_fan_out_includes_sender() {
        let channel = GuildChannel::new(16, 255);
        let alice = PeerId::from("Alice");
        let mut rx_alice = channel.join(alice.clone()).await;
        let mut rx_bob = channel.join(PeerId::from("Bob")).await;

        let count = channel.send(&alice, vec![1, 2, 3]).unwrap();
        assert_eq!(count, 2);

        let frame = rx_bob.recv().await.unwrap();
        assert_eq!(frame.sender, alice);
        assert_eq!(frame.bytes, vec![1, 2, 3]);
        assert_eq!(rx_alice.recv().await.unwrap().sender, alice);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let channel = GuildChannel::new(16, 8);
        let alice = PeerId::from("Alice");
        let _rx = channel.join(alice.clone()).await;

        let err = channel.send(&alice, vec![0; 9]).unwrap_err();
        assert_eq!(err, ChannelError::FrameTooLarge { size: 9, limit: 8 });

        channel.send(&alice, vec![0; 8]).unwrap();
        let stats = channel.stats().await;
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_rejected, 1);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn test_roster_sorted() {
        let channel = GuildChannel::new(4, 255);
        let _a = channel.join(PeerId::from("Zed")).await;
        let _b = channel.join(PeerId::from("Abe")).await;
        let roster = channel.roster(50).await;
        assert_eq!(roster[0].id, PeerId::from("Abe"));
        assert!(roster.iter().all(|p| p.online && p.last_seen == 50));
    }
}
