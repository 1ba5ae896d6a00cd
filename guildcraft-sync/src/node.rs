//! The sync node: one owner for every component, driven by discrete events.
//!
//! ```text
//!  record_changed / record_deleted          receive(sender, bytes)
//!            │                                       │
//!            ▼                                       ▼
//!   ReplicationEngine (dirty, version++)     MembershipCache::is_member
//!            │                                       │
//!   PublishScheduler (debounce)              codec::decode ─► Fragment? ─► Reassembler
//!            │                                       │                        │
//!   Codec::encode ─► Framer::split                   ▼                        │
//!            │                             ReplicationEngine::apply_batch ◄───┘
//!            ▼
//!   TransportQueue (priority, token bucket, suspension) ──► tick(now) ──► frames
//! ```
//!
//! Every handler runs to completion before the next event is processed, so
//! no component needs interior locking. Timers are evaluated in [`SyncNode::tick`]
//! against the `Instant` supplied by the caller.

use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

use crate::clock::ServerClock;
use crate::codec::{self, Codec, CodecError, HEADER_LEN};
use crate::config::{ConfigError, SyncConfig};
use crate::error::SyncError;
use crate::event::{SyncEvent, TruncationContext};
use crate::framer::{DiscardedSet, FrameError, Framer, Reassembler};
use crate::membership::{MembershipCache, Peer, RosterSource};
use crate::protocol::{ControlMessage, RecordBatch, WireMessage};
use crate::record::{PeerId, Record, RecordId, RecordPayload};
use crate::replication::{ReplicationEngine, Retention};
use crate::scheduler::{PublishDecision, PublishScheduler};
use crate::storage::{ReplicaSnapshot, StoreError, CURRENT_SCHEMA_VERSION};
use crate::transport::{OutboundEnvelope, Priority, TokenBucket, TransportQueue, TransportStats};

/// Worst-case bytes a fragment frame adds around its data slice
/// (header, variant tag, message id, index, total, length prefix).
const FRAGMENT_OVERHEAD: usize = HEADER_LEN + 21;

/// Node counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Our own frames echoed back by the channel.
    pub frames_ignored_self: u64,
    pub records_applied: u64,
    pub records_deleted: u64,
    pub records_stale: u64,
    pub records_suppressed: u64,
    pub dropped_unknown_sender: u64,
    pub dropped_decode: u64,
    pub dropped_frame: u64,
    pub truncations: u64,
    pub delta_publishes: u64,
    pub full_publishes: u64,
    /// New sessions announced by members.
    pub sessions_detected: u64,
}

type SuspensionPredicate = Box<dyn Fn() -> bool + Send>;

/// A guild member's replica plus the machinery to keep it in sync.
pub struct SyncNode {
    config: SyncConfig,
    local: PeerId,
    session: Uuid,
    clock: Box<dyn ServerClock>,

    engine: ReplicationEngine,
    membership: MembershipCache,
    roster_source: Option<Box<dyn RosterSource>>,

    codec: Codec,
    framer: Framer,
    reassembler: Reassembler,
    queue: TransportQueue,

    delta_scheduler: PublishScheduler,
    full_scheduler: PublishScheduler,
    last_full_sync: Instant,
    last_prune: Instant,

    suspended: bool,
    suspension_predicate: Option<SuspensionPredicate>,

    /// Last session announced by each member.
    sessions: HashMap<PeerId, Uuid>,
    events: Vec<SyncEvent>,
    stats: NodeStats,
}

impl SyncNode {
    /// Create a node. Nothing is sent until [`SyncNode::start`].
    pub fn new(
        local: PeerId,
        config: SyncConfig,
        clock: impl ServerClock + 'static,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let bucket = TokenBucket::new(
            config.rate_limit_tokens,
            config.rate_limit_interval,
            config.rate_limit_burst,
            now,
        );

        Ok(Self {
            session: Uuid::new_v4(),
            clock: Box::new(clock),
            engine: ReplicationEngine::new(local.clone()),
            membership: MembershipCache::new(
                local.clone(),
                config.roster_refresh_interval,
                config.peer_stale_after_secs,
            ),
            roster_source: None,
            codec: Codec::new(config.compression_threshold, config.legacy_transport),
            framer: Framer::new(),
            reassembler: Reassembler::new(
                config.reassembly_timeout,
                config.max_reassembly_buffers,
                config.max_reassembly_bytes,
            ),
            queue: TransportQueue::new(bucket, config.max_queued_frames),
            delta_scheduler: PublishScheduler::new(config.publish_cooldown),
            full_scheduler: PublishScheduler::new(config.full_sync_cooldown),
            last_full_sync: now,
            last_prune: now,
            suspended: false,
            suspension_predicate: None,
            sessions: HashMap::new(),
            events: Vec::new(),
            stats: NodeStats::default(),
            local,
            config,
        })
    }

    /// Announce this session and share any restored state.
    pub fn start(&mut self, now: Instant) {
        log::info!(
            "Sync node {} starting (session {}, {} records)",
            self.local,
            self.session,
            self.engine.len()
        );
        self.send_hello(now);
        if !self.engine.is_empty() || self.engine.tombstone_count() > 0 {
            self.request_full_sync(now);
        }
    }

    // ─── Collaborator → core ─────────────────────────────────────────

    /// A local mutation (recipe learned, request created, materials changed).
    pub fn record_changed(&mut self, id: RecordId, payload: RecordPayload, now: Instant) {
        let server_time = self.clock.now_secs();
        if self.engine.record_changed(id, payload, server_time) {
            self.schedule_delta(now);
        }
    }

    /// A local deletion. Published as a tombstone.
    pub fn record_deleted(&mut self, id: &RecordId, now: Instant) {
        let server_time = self.clock.now_secs();
        if self.engine.record_deleted(id, server_time) {
            self.schedule_delta(now);
        }
    }

    /// Roster change notification from the host.
    pub fn peer_list_changed(&mut self, peers: Vec<Peer>, now: Instant) {
        let diff = self.membership.refresh(peers, now);

        for peer in &diff.left {
            self.sessions.remove(peer);
            self.reassembler.forget_sender(peer);
            self.events.push(SyncEvent::PeerLeft(peer.clone()));
        }
        for peer in &diff.came_online {
            self.events.push(SyncEvent::PeerJoined(peer.clone()));
        }

        if !diff.came_online.is_empty() {
            log::debug!("{} peers came online, scheduling full sync", diff.came_online.len());
            self.request_full_sync(now);
        }
    }

    /// Install the periodic fallback roster source.
    pub fn set_roster_source(&mut self, source: impl RosterSource + 'static) {
        self.roster_source = Some(Box::new(source));
    }

    /// Install a predicate evaluated on every tick; sending pauses while it
    /// returns true (e.g. the player is in combat).
    pub fn set_suspension_predicate<F>(&mut self, predicate: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.suspension_predicate = Some(Box::new(predicate));
    }

    /// Explicitly pause or resume sending.
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
        self.apply_suspension();
    }

    fn apply_suspension(&mut self) {
        let predicate = self.suspension_predicate.as_ref().is_some_and(|p| p());
        self.queue.set_suspended(self.suspended || predicate);
    }

    // ─── Inbound ─────────────────────────────────────────────────────

    /// Handle one frame from the channel.
    ///
    /// Failures drop only this frame and leave the record set untouched.
    pub fn receive(&mut self, sender: &PeerId, bytes: &[u8], now: Instant) -> Result<(), SyncError> {
        self.stats.frames_received += 1;

        if *sender == self.local {
            self.stats.frames_ignored_self += 1;
            return Ok(());
        }
        if !self.membership.is_member(sender) {
            self.stats.dropped_unknown_sender += 1;
            return Err(self.dropped(sender, SyncError::UnknownSender(sender.clone())));
        }

        let msg = match codec::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.dropped_decode += 1;
                return Err(self.dropped(sender, e.into()));
            }
        };
        self.membership.touch(sender, self.clock.now_secs());

        let msg = match msg {
            WireMessage::Fragment(chunk) => match self.reassemble(sender, chunk, now)? {
                Some(msg) => msg,
                None => return Ok(()),
            },
            other => other,
        };

        self.dispatch(sender, msg, now);
        Ok(())
    }

    fn reassemble(
        &mut self,
        sender: &PeerId,
        chunk: crate::framer::Chunk,
        now: Instant,
    ) -> Result<Option<WireMessage>, SyncError> {
        let mut discarded = Vec::new();
        let result = self.reassembler.accumulate(sender, chunk, now, &mut discarded);
        for set in discarded {
            log::debug!(
                "Discarded reassembly buffer {} from {} ({}/{} chunks)",
                set.message_id,
                set.sender,
                set.received,
                set.total
            );
            self.report_discarded(set);
        }

        let bytes = match result {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.stats.dropped_frame += 1;
                return Err(self.dropped(sender, e.into()));
            }
        };

        match codec::decode(&bytes) {
            Ok(WireMessage::Fragment(_)) => {
                self.stats.dropped_frame += 1;
                Err(self.dropped(sender, FrameError::NestedFragment.into()))
            }
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                self.stats.dropped_decode += 1;
                Err(self.dropped(sender, e.into()))
            }
        }
    }

    fn dispatch(&mut self, sender: &PeerId, msg: WireMessage, now: Instant) {
        log::trace!("Received {} from {}", msg.kind(), sender);
        match msg {
            WireMessage::Delta(batch) | WireMessage::FullState(batch) => {
                let outcome = self.engine.apply_batch(batch, &mut self.events);
                self.stats.records_applied += outcome.applied as u64;
                self.stats.records_deleted += outcome.deleted as u64;
                self.stats.records_stale += outcome.stale as u64;
                self.stats.records_suppressed += outcome.suppressed as u64;
            }
            WireMessage::Control(ControlMessage::Hello { session, record_count }) => {
                let previous = self.sessions.insert(sender.clone(), session);
                if previous != Some(session) {
                    self.stats.sessions_detected += 1;
                    // A restarted peer numbers its messages afresh.
                    let stale = self.reassembler.forget_sender(sender);
                    if stale > 0 {
                        log::debug!("Dropped {} partial messages from {}'s old session", stale, sender);
                    }
                    log::debug!(
                        "New session {} from {} ({} records), scheduling full sync",
                        session,
                        sender,
                        record_count
                    );
                    self.request_full_sync(now);
                }
            }
            WireMessage::Control(ControlMessage::RequestFullState) => {
                log::debug!("{} requested full state", sender);
                self.request_full_sync(now);
            }
            // Fragments were unwrapped by the caller
            WireMessage::Fragment(_) => {}
        }
    }

    /// Log a dropped message (raised to `warn` in diagnostics mode) and
    /// hand the error back.
    fn dropped(&self, sender: &PeerId, err: SyncError) -> SyncError {
        if self.config.diagnostics {
            log::warn!("Dropped message from {sender}: {err}");
        } else {
            log::trace!("Dropped message from {sender}: {err}");
        }
        err
    }

    fn report_discarded(&mut self, set: DiscardedSet) {
        let missing = set.total.saturating_sub(set.received) as usize;
        self.stats.truncations += 1;
        self.events.push(SyncEvent::Truncated {
            context: TruncationContext::ChunkReassembly {
                sender: set.sender,
                message_id: set.message_id,
            },
            dropped: missing,
        });
    }

    // ─── Timers ──────────────────────────────────────────────────────

    /// Periodic tick: expire buffers, fire debounced publishes, refresh the
    /// roster, prune, then release whatever frames the transport allows.
    pub fn tick(&mut self, now: Instant) -> Vec<Vec<u8>> {
        for set in self.reassembler.expire(now) {
            let err = SyncError::ReassemblyTimeout {
                sender: set.sender.clone(),
                message_id: set.message_id,
                received: set.received,
                total: set.total,
            };
            self.dropped(&set.sender, err);
            self.report_discarded(set);
        }

        if self.membership.needs_refresh(now) {
            if let Some(peers) = self.roster_source.as_ref().map(|s| s.roster()) {
                self.peer_list_changed(peers, now);
            }
        }

        if self.delta_scheduler.poll(now) {
            self.publish_delta(now);
        }
        if self.full_scheduler.poll(now) {
            self.publish_full(now);
        }
        if now.saturating_duration_since(self.last_full_sync) >= self.config.full_sync_interval {
            log::debug!("Periodic full sync");
            self.request_full_sync(now);
        }

        if now.saturating_duration_since(self.last_prune) >= self.config.prune_interval {
            self.prune(now);
        }

        self.apply_suspension();
        let frames = self.queue.drain(now);
        self.stats.frames_sent += frames.len() as u64;
        frames
    }

    fn prune(&mut self, now: Instant) {
        self.last_prune = now;
        let server_time = self.clock.now_secs();

        for peer in self.membership.prune_stale(server_time) {
            self.sessions.remove(&peer);
            self.events.push(SyncEvent::PeerLeft(peer));
        }

        let retention = Retention {
            tombstone_secs: self.config.tombstone_retention_secs,
            record_secs: self.config.record_retention_secs,
        };
        let membership = &self.membership;
        self.engine.prune(
            server_time,
            retention,
            |peer| membership.is_member(peer),
            &mut self.events,
        );
    }

    // ─── Outbound ────────────────────────────────────────────────────

    fn schedule_delta(&mut self, now: Instant) {
        if self.delta_scheduler.notify_dirty(now) == PublishDecision::Immediate {
            self.publish_delta(now);
        }
    }

    /// Schedule a (debounced) full rebroadcast.
    pub fn request_full_sync(&mut self, now: Instant) {
        self.last_full_sync = now;
        // Nothing to share yet; leave the window open for real state.
        if self.engine.is_empty() && self.engine.tombstone_count() == 0 {
            return;
        }
        if self.full_scheduler.notify_dirty(now) == PublishDecision::Immediate {
            self.publish_full(now);
        }
    }

    fn publish_delta(&mut self, now: Instant) {
        let batch = self.engine.collect_delta();
        if batch.is_empty() {
            return;
        }
        log::debug!("Publishing delta: {} entries", batch.len());
        self.stats.delta_publishes += 1;
        self.send_batch(batch, false, now);
    }

    fn publish_full(&mut self, now: Instant) {
        self.last_full_sync = now;
        let batch = self.engine.full_state();
        if batch.is_empty() {
            return;
        }
        log::info!(
            "Publishing full state: {} records, {} tombstones",
            batch.records.len(),
            batch.tombstones.len()
        );
        self.stats.full_publishes += 1;
        self.send_batch(batch, true, now);
    }

    fn send_hello(&mut self, now: Instant) {
        let hello = ControlMessage::Hello {
            session: self.session,
            record_count: u32::try_from(self.engine.len()).unwrap_or(u32::MAX),
        };
        self.send(WireMessage::Control(hello), now);
    }

    /// Queue a delta or full-state batch as one or more messages. A batch
    /// whose encoding exceeds the decode limit, the reassembly limit or the
    /// queue capacity is halved until every part fits.
    fn send_batch(&mut self, batch: RecordBatch, full: bool, now: Instant) {
        let kind = if full { "full-state" } else { "delta" };
        let mut pending = vec![batch];
        let mut parts = 0usize;

        while let Some(batch) = pending.pop() {
            let msg = if full {
                WireMessage::FullState(batch)
            } else {
                WireMessage::Delta(batch)
            };
            let priority = msg.priority();
            match self.encode_frames(&msg) {
                Ok(frames) if frames.len() <= self.config.max_queued_frames => {
                    parts += 1;
                    self.enqueue(frames, priority, now);
                    continue;
                }
                Ok(_) => {}
                Err(e) if exceeds_limits(&e) => {}
                Err(e) => {
                    log::warn!("Failed to encode {}: {}", kind, e);
                    continue;
                }
            }

            let (WireMessage::Delta(batch) | WireMessage::FullState(batch)) = msg else {
                continue;
            };
            if batch.len() < 2 {
                log::warn!(
                    "Dropping {} entry too large to send: {:?}",
                    kind,
                    batch.records.first().map(|r| &r.id)
                );
                continue;
            }
            let (first, second) = batch.halve();
            // Popped in order: first half goes out first.
            pending.push(second);
            pending.push(first);
        }

        if parts > 1 {
            log::debug!("Split {} publish into {} messages", kind, parts);
        }
    }

    /// Encode, fragment if needed, and queue one message.
    fn send(&mut self, msg: WireMessage, now: Instant) {
        let priority = msg.priority();
        match self.encode_frames(&msg) {
            Ok(frames) => self.enqueue(frames, priority, now),
            Err(e) => log::warn!("Failed to encode {}: {}", msg.kind(), e),
        }
    }

    fn enqueue(&mut self, frames: Vec<Vec<u8>>, priority: Priority, now: Instant) {
        let envelope = OutboundEnvelope::new(frames, priority, now);
        if let Some(overflow) = self.queue.enqueue(envelope) {
            let err = SyncError::QueueOverflow {
                dropped_envelopes: overflow.dropped_envelopes,
                dropped_frames: overflow.dropped_frames,
            };
            self.dropped(&self.local, err);
            self.stats.truncations += 1;
            self.events.push(SyncEvent::Truncated {
                context: TruncationContext::OutboundQueue,
                dropped: overflow.dropped_frames,
            });
        }
    }

    fn encode_frames(&mut self, msg: &WireMessage) -> Result<Vec<Vec<u8>>, SyncError> {
        let bytes = self.codec.encode(msg)?;
        if bytes.len() <= self.config.max_chunk_size {
            return Ok(vec![bytes]);
        }

        // Receivers refuse chunk sets larger than this.
        if bytes.len() > self.config.max_reassembly_bytes {
            return Err(FrameError::MessageTooLarge {
                limit: self.config.max_reassembly_bytes,
            }
            .into());
        }

        let data_size = self.config.max_chunk_size - FRAGMENT_OVERHEAD;
        let chunks = self.framer.split(&bytes, data_size)?;
        log::trace!("Fragmenting {} ({} bytes) into {} chunks", msg.kind(), bytes.len(), chunks.len());

        chunks
            .into_iter()
            .map(|chunk| {
                self.codec
                    .encode(&WireMessage::Fragment(chunk))
                    .map_err(SyncError::from)
            })
            .collect()
    }

    /// Whether outbound work is waiting (for hosts that tick on demand).
    pub fn has_pending_output(&self) -> bool {
        !self.queue.is_empty() || self.delta_scheduler.is_pending() || self.full_scheduler.is_pending()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Profile reset: drop all replicated and transient state, start a new
    /// session and ask peers to rebroadcast.
    pub fn reset(&mut self, now: Instant) {
        log::info!("Resetting sync node {}", self.local);
        self.engine.reset();
        self.reassembler.clear();
        self.framer.reset();
        self.queue.clear();
        self.delta_scheduler.reset();
        self.full_scheduler.reset();
        self.sessions.clear();
        self.events.clear();
        self.session = Uuid::new_v4();
        self.last_full_sync = now;
        self.last_prune = now;

        self.send(WireMessage::Control(ControlMessage::RequestFullState), now);
        self.send_hello(now);
    }

    /// Drain pending events.
    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Export the replicated state for persistence.
    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot::new(
            self.engine.records().cloned().collect(),
            self.engine.tombstones().cloned().collect(),
            self.clock.now_secs(),
        )
    }

    /// Replace the replicated state with a persisted snapshot.
    pub fn restore(&mut self, snapshot: ReplicaSnapshot) -> Result<(), StoreError> {
        if snapshot.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found: snapshot.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        log::info!(
            "Restoring {} records, {} tombstones",
            snapshot.records.len(),
            snapshot.tombstones.len()
        );
        self.engine.restore(snapshot.records, snapshot.tombstones);
        Ok(())
    }

    // ─── Queries ─────────────────────────────────────────────────────

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.engine.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.engine.records()
    }

    pub fn engine(&self) -> &ReplicationEngine {
        &self.engine
    }

    pub fn membership(&self) -> &MembershipCache {
        &self.membership
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_suspended(&self) -> bool {
        self.queue.is_suspended()
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.queued_frames()
    }

    pub fn queued_envelopes(&self, priority: Priority) -> usize {
        self.queue.queued_envelopes(priority)
    }

    /// Incomplete chunk sets held for reassembly.
    pub fn pending_reassembly(&self) -> usize {
        self.reassembler.pending()
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.clone()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.queue.stats()
    }
}

/// Errors fixed by sending fewer entries per message.
fn exceeds_limits(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Decode(CodecError::TooLarge(_))
            | SyncError::Frame(FrameError::MessageTooLarge { .. } | FrameError::TooManyChunks(_))
    )
}
