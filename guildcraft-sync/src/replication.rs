//! Replication engine: record store, dirty tracking and the LWW merge.
//!
//! The engine exclusively owns the record and tombstone sets. Local writes
//! bump the per-record version and mark the entry dirty; inbound batches are
//! merged one entry at a time:
//!
//! ```text
//! incoming Record R
//!   │
//!   ├─ tombstone(id).deleted_at >= R.updated_at ──► Suppressed
//!   ├─ no local, or R > local by (version, updated_at, updated_by)
//!   │                                           ──► Applied (clean, drop older tombstone)
//!   └─ otherwise                                ──► Stale
//!
//! incoming Tombstone T
//!   ├─ local.updated_at > T.deleted_at          ──► Stale
//!   └─ otherwise remove record, keep the later tombstone ──► Deleted
//! ```
//!
//! Deletions always travel as tombstones, never as omission from a batch.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Last Write Wins, Tombstones)

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::event::SyncEvent;
use crate::protocol::RecordBatch;
use crate::record::{PeerId, Record, RecordId, RecordPayload, Tombstone};

/// Result of merging one incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Incoming record replaced (or created) local state.
    Applied,
    /// Incoming tombstone removed a record or replaced an older tombstone.
    Deleted,
    /// Local state is at least as new.
    Stale,
    /// A tombstone at least as new as the record hides it.
    Suppressed,
}

/// Per-batch merge totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub deleted: usize,
    pub stale: usize,
    pub suppressed: usize,
}

impl BatchOutcome {
    fn count(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => self.applied += 1,
            MergeOutcome::Deleted => self.deleted += 1,
            MergeOutcome::Stale => self.stale += 1,
            MergeOutcome::Suppressed => self.suppressed += 1,
        }
    }

    /// Whether anything changed local state.
    pub fn changed(&self) -> bool {
        self.applied > 0 || self.deleted > 0
    }
}

/// Retention windows for [`ReplicationEngine::prune`].
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub tombstone_secs: u64,
    pub record_secs: u64,
}

/// What a prune pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub tombstones: usize,
    pub records: Vec<RecordId>,
}

/// Owner of the replicated record set.
pub struct ReplicationEngine {
    local: PeerId,
    records: BTreeMap<RecordId, Record>,
    tombstones: BTreeMap<RecordId, Tombstone>,
}

impl ReplicationEngine {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            records: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    // ─── Local writes ───────────────────────────────────────────────

    /// Record a local mutation. Returns false when the payload is unchanged.
    ///
    /// The new version exceeds both the current record and any tombstone for
    /// the id, and the timestamp is moved past the tombstone so the write
    /// cannot be suppressed by our own earlier delete.
    pub fn record_changed(&mut self, id: RecordId, payload: RecordPayload, server_time: u64) -> bool {
        let tombstone = self.tombstones.remove(&id);

        let (base_version, min_time) = match (self.records.get(&id), &tombstone) {
            (Some(existing), _) => {
                if existing.payload == payload {
                    return false;
                }
                (existing.version, existing.updated_at)
            }
            (None, Some(t)) => (t.version, t.deleted_at.saturating_add(1)),
            (None, None) => (0, 0),
        };

        let mut record = Record::new(
            id.clone(),
            payload,
            base_version + 1,
            server_time.max(min_time),
            self.local.clone(),
        );
        record.dirty = true;

        log::trace!("Local write {} v{}", id, record.version);
        self.records.insert(id, record);
        true
    }

    /// Delete a record locally, leaving a dirty tombstone. Returns false if
    /// there was nothing to delete.
    pub fn record_deleted(&mut self, id: &RecordId, server_time: u64) -> bool {
        let Some(record) = self.records.remove(id) else {
            return false;
        };

        let mut tombstone = Tombstone::new(
            id.clone(),
            server_time.max(record.updated_at),
            self.local.clone(),
            record.version + 1,
        );
        tombstone.dirty = true;

        log::trace!("Local delete {} v{}", id, tombstone.version);
        self.tombstones.insert(id.clone(), tombstone);
        true
    }

    // ─── Merge ──────────────────────────────────────────────────────

    /// Merge one incoming record.
    pub fn merge_record(&mut self, incoming: Record) -> MergeOutcome {
        if let Some(t) = self.tombstones.get(&incoming.id) {
            if t.suppresses(&incoming) {
                return MergeOutcome::Suppressed;
            }
        }

        if let Some(local) = self.records.get(&incoming.id) {
            if incoming.lww_cmp(local) != Ordering::Greater {
                return MergeOutcome::Stale;
            }
        }

        self.tombstones.remove(&incoming.id);
        let mut record = incoming;
        record.dirty = false;
        self.records.insert(record.id.clone(), record);
        MergeOutcome::Applied
    }

    /// Merge one incoming tombstone.
    pub fn merge_tombstone(&mut self, incoming: Tombstone) -> MergeOutcome {
        if let Some(local) = self.records.get(&incoming.id) {
            if local.updated_at > incoming.deleted_at {
                return MergeOutcome::Stale;
            }
        }

        let removed = self.records.remove(&incoming.id).is_some();
        let replaces = match self.tombstones.get(&incoming.id) {
            Some(existing) => incoming.lww_cmp(existing) == Ordering::Greater,
            None => true,
        };

        if replaces {
            let mut tombstone = incoming;
            tombstone.dirty = false;
            self.tombstones.insert(tombstone.id.clone(), tombstone);
        }

        if removed || replaces {
            MergeOutcome::Deleted
        } else {
            MergeOutcome::Stale
        }
    }

    /// Merge a delta or full-state batch, pushing events for every change.
    pub fn apply_batch(&mut self, batch: RecordBatch, events: &mut Vec<SyncEvent>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for record in batch.records {
            let applied = record.clone();
            let result = self.merge_record(record);
            if result == MergeOutcome::Applied {
                events.push(SyncEvent::RecordApplied(applied));
            }
            outcome.count(result);
        }

        for tombstone in batch.tombstones {
            let id = tombstone.id.clone();
            let result = self.merge_tombstone(tombstone);
            if result == MergeOutcome::Deleted {
                events.push(SyncEvent::RecordDeleted(id));
            }
            outcome.count(result);
        }

        outcome
    }

    // ─── Publication ────────────────────────────────────────────────

    /// Whether any record or tombstone awaits publication.
    pub fn has_dirty(&self) -> bool {
        self.records.values().any(|r| r.dirty) || self.tombstones.values().any(|t| t.dirty)
    }

    /// Dirty entries since the last publish. Clears the dirty flags.
    pub fn collect_delta(&mut self) -> RecordBatch {
        let mut batch = RecordBatch::default();
        for record in self.records.values_mut().filter(|r| r.dirty) {
            record.dirty = false;
            batch.records.push(record.clone());
        }
        for tombstone in self.tombstones.values_mut().filter(|t| t.dirty) {
            tombstone.dirty = false;
            batch.tombstones.push(tombstone.clone());
        }
        batch
    }

    /// Every record and tombstone. Clears the dirty flags.
    pub fn full_state(&mut self) -> RecordBatch {
        for record in self.records.values_mut() {
            record.dirty = false;
        }
        for tombstone in self.tombstones.values_mut() {
            tombstone.dirty = false;
        }
        RecordBatch {
            records: self.records.values().cloned().collect(),
            tombstones: self.tombstones.values().cloned().collect(),
        }
    }

    // ─── Maintenance ────────────────────────────────────────────────

    /// Garbage-collect expired tombstones and drop records last written by
    /// peers that are no longer members. Pruned records are local-only
    /// removals and emit `RecordDeleted`.
    pub fn prune<F>(
        &mut self,
        server_time: u64,
        retention: Retention,
        is_member: F,
        events: &mut Vec<SyncEvent>,
    ) -> PruneReport
    where
        F: Fn(&PeerId) -> bool,
    {
        let mut report = PruneReport::default();

        let tombstone_cutoff = server_time.saturating_sub(retention.tombstone_secs);
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, t| t.dirty || t.deleted_at >= tombstone_cutoff);
        report.tombstones = before - self.tombstones.len();

        let record_cutoff = server_time.saturating_sub(retention.record_secs);
        let local = &self.local;
        report.records = self
            .records
            .values()
            .filter(|r| {
                r.updated_at < record_cutoff && r.updated_by != *local && !is_member(&r.updated_by)
            })
            .map(|r| r.id.clone())
            .collect();

        for id in &report.records {
            self.records.remove(id);
            events.push(SyncEvent::RecordDeleted(id.clone()));
        }

        if report.tombstones > 0 || !report.records.is_empty() {
            log::debug!(
                "Pruned {} tombstones, {} orphaned records",
                report.tombstones,
                report.records.len()
            );
        }
        report
    }

    /// Drop all state.
    pub fn reset(&mut self) {
        self.records.clear();
        self.tombstones.clear();
    }

    /// Replace all state with persisted entries. Restored entries are clean.
    pub fn restore(&mut self, records: Vec<Record>, tombstones: Vec<Tombstone>) {
        self.reset();
        for mut r in records {
            r.dirty = false;
            self.records.insert(r.id.clone(), r);
        }
        for mut t in tombstones {
            t.dirty = false;
            // A record and a tombstone for one id cannot both be live.
            match self.records.get(&t.id) {
                Some(r) if !t.suppresses(r) => continue,
                Some(_) => {
                    self.records.remove(&t.id);
                }
                None => {}
            }
            self.tombstones.insert(t.id.clone(), t);
        }
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn tombstone(&self, id: &RecordId) -> Option<&Tombstone> {
        self.tombstones.get(id)
    }

    /// Records ordered by id.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MaterialCount, MaterialSnapshot};

    fn payload(count: u32) -> RecordPayload {
        RecordPayload::Materials(MaterialSnapshot {
            owner: PeerId::from("A"),
            items: vec![MaterialCount { item_id: 2772, count }],
        })
    }

    fn remote(id: &str, version: u64, at: u64, by: &str, count: u32) -> Record {
        Record::new(RecordId::from(id), payload(count), version, at, PeerId::from(by))
    }

    fn engine(local: &str) -> ReplicationEngine {
        ReplicationEngine::new(PeerId::from(local))
    }

    #[test]
    fn test_local_write_bumps_version_and_marks_dirty() {
        let mut e = engine("A");
        let id = RecordId::from("r1");
        assert!(e.record_changed(id.clone(), payload(1), 100));
        assert!(e.record_changed(id.clone(), payload(2), 101));
        let r = e.get(&id).unwrap();
        assert_eq!(r.version, 2);
        assert_eq!(r.updated_by, PeerId::from("A"));
        assert!(r.dirty);
    }

    #[test]
    fn test_unchanged_payload_is_noop() {
        let mut e = engine("A");
        let id = RecordId::from("r1");
        e.record_changed(id.clone(), payload(1), 100);
        e.collect_delta();
        assert!(!e.record_changed(id.clone(), payload(1), 200));
        assert!(!e.has_dirty());
        assert_eq!(e.get(&id).unwrap().version, 1);
    }

    #[test]
    fn test_collect_delta_clears_dirty() {
        let mut e = engine("A");
        e.record_changed(RecordId::from("r1"), payload(1), 100);
        e.record_changed(RecordId::from("r2"), payload(1), 100);
        let delta = e.collect_delta();
        assert_eq!(delta.records.len(), 2);
        assert!(!e.has_dirty());
        assert!(e.collect_delta().is_empty());
    }

    #[test]
    fn test_apply_same_record_twice_is_idempotent() {
        let mut e = engine("B");
        let r = remote("r1", 1, 100, "A", 5);
        assert_eq!(e.merge_record(r.clone()), MergeOutcome::Applied);
        assert_eq!(e.merge_record(r.clone()), MergeOutcome::Stale);
        assert_eq!(e.get(&r.id).unwrap(), &r);
        assert_eq!(e.len(), 1);
    }

    #[test]
    fn test_older_version_is_stale() {
        let mut e = engine("B");
        e.merge_record(remote("r1", 3, 100, "A", 3));
        assert_eq!(e.merge_record(remote("r1", 2, 900, "Z", 2)), MergeOutcome::Stale);
        assert_eq!(e.get(&RecordId::from("r1")).unwrap().version, 3);
    }

    #[test]
    fn test_tie_break_is_order_independent() {
        let a = remote("r1", 2, 100, "Alice", 1);
        let b = remote("r1", 2, 100, "Bob", 2);

        let mut e1 = engine("X");
        e1.merge_record(a.clone());
        e1.merge_record(b.clone());

        let mut e2 = engine("Y");
        e2.merge_record(b.clone());
        e2.merge_record(a.clone());

        let id = RecordId::from("r1");
        assert_eq!(e1.get(&id).unwrap().updated_by, PeerId::from("Bob"));
        assert_eq!(e1.get(&id), e2.get(&id));
    }

    #[test]
    fn test_merged_record_is_clean() {
        let mut e = engine("A");
        let id = RecordId::from("r1");
        e.record_changed(id.clone(), payload(1), 100);
        e.merge_record(remote("r1", 5, 100, "B", 9));
        assert!(!e.get(&id).unwrap().dirty);
        assert!(!e.has_dirty());
    }

    #[test]
    fn test_local_delete_creates_dirty_tombstone() {
        let mut e = engine("A");
        let id = RecordId::from("r1");
        e.record_changed(id.clone(), payload(1), 100);
        e.collect_delta();

        assert!(e.record_deleted(&id, 150));
        assert!(e.get(&id).is_none());
        let t = e.tombstone(&id).unwrap();
        assert_eq!(t.version, 2);
        assert_eq!(t.deleted_at, 150);

        let delta = e.collect_delta();
        assert!(delta.records.is_empty());
        assert_eq!(delta.tombstones.len(), 1);
        assert!(!e.record_deleted(&id, 160));
    }

    #[test]
    fn test_tombstone_blocks_resurrection() {
        let mut e = engine("B");
        e.merge_record(remote("r1", 1, 100, "A", 1));
        let t = Tombstone::new(RecordId::from("r1"), 200, PeerId::from("A"), 2);
        assert_eq!(e.merge_tombstone(t), MergeOutcome::Deleted);

        // Older and same-second writes stay dead, even with a higher version.
        assert_eq!(e.merge_record(remote("r1", 1, 100, "A", 1)), MergeOutcome::Suppressed);
        assert_eq!(e.merge_record(remote("r1", 9, 200, "Z", 1)), MergeOutcome::Suppressed);
        assert!(e.get(&RecordId::from("r1")).is_none());

        // A later write recreates it and drops the tombstone.
        assert_eq!(e.merge_record(remote("r1", 3, 201, "A", 7)), MergeOutcome::Applied);
        assert!(e.tombstone(&RecordId::from("r1")).is_none());
    }

    #[test]
    fn test_tombstone_older_than_record_is_stale() {
        let mut e = engine("B");
        e.merge_record(remote("r1", 2, 300, "A", 1));
        let t = Tombstone::new(RecordId::from("r1"), 200, PeerId::from("C"), 2);
        assert_eq!(e.merge_tombstone(t), MergeOutcome::Stale);
        assert!(e.get(&RecordId::from("r1")).is_some());
    }

    #[test]
    fn test_later_tombstone_kept() {
        let mut e = engine("B");
        let id = RecordId::from("r1");
        e.merge_tombstone(Tombstone::new(id.clone(), 300, PeerId::from("A"), 2));
        assert_eq!(
            e.merge_tombstone(Tombstone::new(id.clone(), 200, PeerId::from("C"), 2)),
            MergeOutcome::Stale
        );
        assert_eq!(e.tombstone(&id).unwrap().deleted_at, 300);
        assert_eq!(
            e.merge_tombstone(Tombstone::new(id.clone(), 400, PeerId::from("C"), 2)),
            MergeOutcome::Deleted
        );
        assert_eq!(e.tombstone(&id).unwrap().deleted_by, PeerId::from("C"));
    }

    #[test]
    fn test_rewrite_after_own_delete_outranks_tombstone() {
        let mut e = engine("A");
        let id = RecordId::from("r1");
        e.record_changed(id.clone(), payload(1), 100);
        e.record_deleted(&id, 100);
        e.record_changed(id.clone(), payload(2), 100);

        let r = e.get(&id).unwrap();
        assert_eq!(r.version, 3);
        assert_eq!(r.updated_at, 101);
        assert!(e.tombstone(&id).is_none());
    }

    #[test]
    fn test_apply_batch_emits_events() {
        let mut e = engine("B");
        e.merge_record(remote("r2", 1, 50, "A", 1));
        let batch = RecordBatch {
            records: vec![remote("r1", 1, 100, "A", 1)],
            tombstones: vec![Tombstone::new(RecordId::from("r2"), 60, PeerId::from("A"), 2)],
        };
        let mut events = Vec::new();
        let outcome = e.apply_batch(batch, &mut events);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.deleted, 1);
        assert!(outcome.changed());
        assert!(matches!(events[0], SyncEvent::RecordApplied(ref r) if r.id.as_str() == "r1"));
        assert_eq!(events[1], SyncEvent::RecordDeleted(RecordId::from("r2")));
    }

    #[test]
    fn test_version_monotonic_across_merges() {
        let mut e = engine("B");
        let id = RecordId::from("r1");
        let mut last = 0;
        for (v, at) in [(1, 10), (3, 5), (2, 50), (3, 6), (1, 99)] {
            e.merge_record(remote("r1", v, at, "A", v as u32));
            let now = e.get(&id).unwrap().version;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 3);
        assert_eq!(e.get(&id).unwrap().updated_at, 6);
    }

    #[test]
    fn test_prune_tombstones_and_orphans() {
        let mut e = engine("Me");
        e.merge_record(remote("gone", 1, 100, "Departed", 1));
        e.merge_record(remote("kept", 1, 100, "Member", 1));
        e.merge_tombstone(Tombstone::new(RecordId::from("old"), 100, PeerId::from("Member"), 1));
        e.merge_tombstone(Tombstone::new(RecordId::from("new"), 9_500, PeerId::from("Member"), 1));

        let mut events = Vec::new();
        let report = e.prune(
            10_000,
            Retention { tombstone_secs: 1_000, record_secs: 1_000 },
            |p| p.as_str() == "Member",
            &mut events,
        );

        assert_eq!(report.tombstones, 1);
        assert_eq!(report.records, vec![RecordId::from("gone")]);
        assert!(e.get(&RecordId::from("kept")).is_some());
        assert!(e.tombstone(&RecordId::from("new")).is_some());
        assert_eq!(events, vec![SyncEvent::RecordDeleted(RecordId::from("gone"))]);
    }

    #[test]
    fn test_restore_is_clean() {
        let mut e = engine("A");
        let mut r = remote("r1", 1, 100, "A", 1);
        r.dirty = true;
        e.restore(vec![r], vec![Tombstone::new(RecordId::from("r2"), 1, PeerId::from("A"), 1)]);
        assert_eq!(e.len(), 1);
        assert_eq!(e.tombstone_count(), 1);
        assert!(!e.has_dirty());
    }
}
