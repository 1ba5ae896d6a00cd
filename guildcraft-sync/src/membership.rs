//! Known-peer cache used to validate inbound senders.
//!
//! The roster collaborator reports the guild roster; the cache keeps it in
//! a hash map so each inbound frame is checked in O(1) instead of scanning
//! the roster per message.
//!
//! ```text
//! roster change ──► refresh(peers) ──► RosterDiff { came_online, left }
//! periodic tick ──► needs_refresh(now)? ──► RosterSource::roster()
//! inbound frame ──► is_member(sender)?  ── no ──► dropped
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::record::PeerId;

/// Guild rank, used by collaborators for permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Leader,
    Officer,
    Member,
}

/// A known participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// Server time the roster last saw this peer online, in seconds.
    pub last_seen: u64,
    pub online: bool,
    pub role: PeerRole,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>, last_seen: u64, online: bool, role: PeerRole) -> Self {
        Self {
            id: id.into(),
            last_seen,
            online,
            role,
        }
    }

    /// Online member seen at `last_seen`.
    pub fn online(id: impl Into<PeerId>, last_seen: u64) -> Self {
        Self::new(id, last_seen, true, PeerRole::Member)
    }
}

/// Supplies the roster for the periodic fallback refresh.
pub trait RosterSource: Send {
    fn roster(&self) -> Vec<Peer>;
}

impl<F> RosterSource for F
where
    F: Fn() -> Vec<Peer> + Send,
{
    fn roster(&self) -> Vec<Peer> {
        self()
    }
}

/// Changes observed by one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    /// Peers that were unknown or offline and are now online.
    pub came_online: Vec<PeerId>,
    /// Peers no longer on the roster.
    pub left: Vec<PeerId>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.came_online.is_empty() && self.left.is_empty()
    }
}

/// O(1) membership lookups over the last roster snapshot.
pub struct MembershipCache {
    local: PeerId,
    members: HashMap<PeerId, Peer>,
    last_refresh: Option<Instant>,
    refresh_interval: Duration,
    /// Peers unseen for longer than this are pruned.
    stale_after_secs: u64,
}

impl MembershipCache {
    pub fn new(local: PeerId, refresh_interval: Duration, stale_after_secs: u64) -> Self {
        Self {
            local,
            members: HashMap::new(),
            last_refresh: None,
            refresh_interval,
            stale_after_secs,
        }
    }

    /// Replace the known-peer set.
    pub fn refresh(&mut self, peers: Vec<Peer>, now: Instant) -> RosterDiff {
        let mut diff = RosterDiff::default();
        let mut next = HashMap::with_capacity(peers.len());

        for mut peer in peers {
            if peer.id == self.local {
                continue;
            }
            let existing = self.members.get(&peer.id);
            let was_online = existing.is_some_and(|p| p.online);
            // Rosters may lag behind frames we already received.
            if let Some(existing) = existing {
                peer.last_seen = peer.last_seen.max(existing.last_seen);
            }
            if peer.online && !was_online {
                diff.came_online.push(peer.id.clone());
            }
            next.insert(peer.id.clone(), peer);
        }

        let kept: HashSet<&PeerId> = next.keys().collect();
        diff.left = self
            .members
            .keys()
            .filter(|id| !kept.contains(id))
            .cloned()
            .collect();

        diff.came_online.sort();
        diff.left.sort();

        self.members = next;
        self.last_refresh = Some(now);

        if !diff.is_empty() {
            log::debug!(
                "Roster refresh: {} members, {} came online, {} left",
                self.members.len(),
                diff.came_online.len(),
                diff.left.len()
            );
        }
        diff
    }

    /// Whether `id` may send to us. The local peer always is.
    pub fn is_member(&self, id: &PeerId) -> bool {
        *id == self.local || self.members.contains_key(id)
    }

    /// Mark a member as seen (any valid inbound frame counts).
    pub fn touch(&mut self, id: &PeerId, server_time: u64) {
        if let Some(peer) = self.members.get_mut(id) {
            peer.last_seen = peer.last_seen.max(server_time);
        }
    }

    /// Whether the periodic fallback refresh is due.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        match self.last_refresh {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.refresh_interval,
        }
    }

    /// Remove peers not seen within the staleness threshold.
    pub fn prune_stale(&mut self, server_time: u64) -> Vec<PeerId> {
        let cutoff = server_time.saturating_sub(self.stale_after_secs);
        let mut stale: Vec<PeerId> = self
            .members
            .values()
            .filter(|p| !p.online && p.last_seen < cutoff)
            .map(|p| p.id.clone())
            .collect();
        stale.sort();

        for id in &stale {
            self.members.remove(id);
        }
        stale
    }

    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.members.get(id)
    }

    /// Remote members currently online.
    pub fn online_peers(&self) -> impl Iterator<Item = &Peer> {
        self.members.values().filter(|p| p.online)
    }

    /// Number of remote members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MembershipCache {
        MembershipCache::new(PeerId::from("Me"), Duration::from_secs(60), 3600)
    }

    #[test]
    fn test_local_peer_always_member() {
        let c = cache();
        assert!(c.is_member(&PeerId::from("Me")));
        assert!(!c.is_member(&PeerId::from("Stranger")));
    }

    #[test]
    fn test_refresh_replaces_set() {
        let mut c = cache();
        let now = Instant::now();
        c.refresh(vec![Peer::online("Alice", 10), Peer::online("Bob", 10)], now);
        assert!(c.is_member(&PeerId::from("Alice")));
        assert_eq!(c.len(), 2);

        let diff = c.refresh(vec![Peer::online("Bob", 11)], now);
        assert!(!c.is_member(&PeerId::from("Alice")));
        assert_eq!(diff.left, vec![PeerId::from("Alice")]);
        assert!(diff.came_online.is_empty());
    }

    #[test]
    fn test_refresh_reports_peers_coming_online() {
        let mut c = cache();
        let now = Instant::now();
        let diff = c.refresh(
            vec![Peer::online("Alice", 10), Peer::new("Bob", 5, false, PeerRole::Officer)],
            now,
        );
        assert_eq!(diff.came_online, vec![PeerId::from("Alice")]);

        let diff = c.refresh(vec![Peer::online("Alice", 12), Peer::online("Bob", 12)], now);
        assert_eq!(diff.came_online, vec![PeerId::from("Bob")]);
    }

    #[test]
    fn test_roster_entry_for_self_ignored() {
        let mut c = cache();
        let diff = c.refresh(vec![Peer::online("Me", 1)], Instant::now());
        assert!(diff.is_empty());
        assert!(c.is_empty());
    }

    #[test]
    fn test_needs_refresh_interval() {
        let mut c = cache();
        let t0 = Instant::now();
        assert!(c.needs_refresh(t0));
        c.refresh(Vec::new(), t0);
        assert!(!c.needs_refresh(t0 + Duration::from_secs(59)));
        assert!(c.needs_refresh(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_prune_stale_offline_peers() {
        let mut c = cache();
        c.refresh(
            vec![
                Peer::new("Old", 100, false, PeerRole::Member),
                Peer::new("Recent", 9_000, false, PeerRole::Member),
                Peer::online("Online", 100),
            ],
            Instant::now(),
        );
        let pruned = c.prune_stale(10_000);
        assert_eq!(pruned, vec![PeerId::from("Old")]);
        assert!(c.is_member(&PeerId::from("Recent")));
        assert!(c.is_member(&PeerId::from("Online")));
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let mut c = cache();
        c.refresh(vec![Peer::new("Alice", 10, false, PeerRole::Member)], Instant::now());
        c.touch(&PeerId::from("Alice"), 50);
        c.touch(&PeerId::from("Alice"), 20);
        assert_eq!(c.peer(&PeerId::from("Alice")).unwrap().last_seen, 50);
    }

    #[test]
    fn test_refresh_keeps_newer_last_seen() {
        let mut c = cache();
        let now = Instant::now();
        c.refresh(vec![Peer::new("Alice", 10, false, PeerRole::Member)], now);
        c.touch(&PeerId::from("Alice"), 9_500);

        // A lagging roster must not make an active peer look stale.
        c.refresh(vec![Peer::new("Alice", 10, false, PeerRole::Member)], now);
        assert_eq!(c.peer(&PeerId::from("Alice")).unwrap().last_seen, 9_500);
        assert!(c.prune_stale(10_000).is_empty());

        c.refresh(vec![Peer::new("Alice", 9_800, false, PeerRole::Member)], now);
        assert_eq!(c.peer(&PeerId::from("Alice")).unwrap().last_seen, 9_800);
    }

    #[test]
    fn test_closure_roster_source() {
        let source = || vec![Peer::online("Alice", 1)];
        assert_eq!(RosterSource::roster(&source).len(), 1);
    }
}
