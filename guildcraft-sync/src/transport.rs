//! Outbound queue with token-bucket rate limiting and suspension.
//!
//! ```text
//! enqueue(envelope) ──► [ Control   ] ─┐
//!                       [ FullState ] ─┼─ highest class first, FIFO within
//!                       [ Delta     ] ─┘
//!                             │
//!                drain(now):  suspended? ── yes ──► nothing sent
//!                             │ no
//!                             ▼
//!                       token available? ── no ──► stop, retry next tick
//!                             │ yes
//!                             ▼
//!                       one frame out, one token spent
//! ```
//!
//! The queue is bounded in frames. Overflow drops whole envelopes from the
//! lowest class first, so a burst of deltas can never push out a control
//! message.
//!
//! Reference: Tanenbaum — Computer Networks, Section 5.4 (Token Bucket)

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Priority class of an outbound envelope. Higher drains first and is
/// dropped last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Incremental delta (and its fragments)
    Incremental = 0,
    /// Full-state rebroadcast
    FullState = 1,
    /// Hello / full-state request
    Control = 2,
}

impl Priority {
    const ALL_DESCENDING: [Priority; 3] =
        [Priority::Control, Priority::FullState, Priority::Incremental];
    const ALL_ASCENDING: [Priority; 3] =
        [Priority::Incremental, Priority::FullState, Priority::Control];

    fn slot(self) -> usize {
        self as usize
    }
}

/// A queued message: one or more encoded frames sent back to back.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    frames: VecDeque<Vec<u8>>,
    priority: Priority,
    enqueued_at: Instant,
    /// Frames already handed to the channel.
    sent: usize,
}

impl OutboundEnvelope {
    pub fn new(frames: Vec<Vec<u8>>, priority: Priority, enqueued_at: Instant) -> Self {
        Self {
            frames: frames.into(),
            priority,
            enqueued_at,
            sent: 0,
        }
    }

    pub fn single(frame: Vec<u8>, priority: Priority, enqueued_at: Instant) -> Self {
        Self::new(vec![frame], priority, enqueued_at)
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Frames still waiting to be sent.
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    fn in_flight(&self) -> bool {
        self.sent > 0
    }
}

/// Token bucket: `tokens_per_interval` tokens every `interval`, capped
/// at `burst`. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u32,
    burst: u32,
    tokens_per_interval: u32,
    interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(tokens_per_interval: u32, interval: Duration, burst: u32, now: Instant) -> Self {
        let burst = burst.max(1);
        Self {
            tokens: burst,
            burst,
            tokens_per_interval: tokens_per_interval.max(1),
            interval: interval.max(Duration::from_millis(1)),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = (elapsed.as_nanos() / self.interval.as_nanos()) as u64;
        if intervals == 0 {
            return;
        }
        let added = intervals.saturating_mul(self.tokens_per_interval as u64);
        self.tokens = (self.tokens as u64 + added).min(self.burst as u64) as u32;
        if self.tokens == self.burst {
            self.last_refill = now;
        } else {
            self.last_refill += self.interval * intervals as u32;
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    /// Tokens available at `now`.
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens
    }
}

/// Envelopes dropped by one enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Overflow {
    pub dropped_envelopes: usize,
    pub dropped_frames: usize,
}

/// Statistics for monitoring transport health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub envelopes_sent: u64,
    pub envelopes_dropped: u64,
    pub frames_dropped: u64,
}

/// Priority/FIFO outbound queue.
pub struct TransportQueue {
    classes: [VecDeque<OutboundEnvelope>; 3],
    bucket: TokenBucket,
    suspended: bool,
    max_frames: usize,
    queued_frames: usize,
    stats: TransportStats,
}

impl TransportQueue {
    pub fn new(bucket: TokenBucket, max_frames: usize) -> Self {
        Self {
            classes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            bucket,
            suspended: false,
            max_frames: max_frames.max(1),
            queued_frames: 0,
            stats: TransportStats::default(),
        }
    }

    /// Queue an envelope, dropping lower-priority work if over capacity.
    ///
    /// The envelope itself is dropped when everything already queued
    /// outranks it (or it alone exceeds the capacity).
    pub fn enqueue(&mut self, envelope: OutboundEnvelope) -> Option<Overflow> {
        let mut overflow = Overflow::default();
        let incoming = envelope.remaining();

        if incoming == 0 {
            return None;
        }
        if incoming > self.max_frames {
            self.record_drop(&mut overflow, incoming);
            return Some(overflow);
        }

        while self.queued_frames + incoming > self.max_frames {
            match self.drop_victim(envelope.priority) {
                Some(frames) => self.record_drop(&mut overflow, frames),
                None => {
                    self.record_drop(&mut overflow, incoming);
                    return Some(overflow);
                }
            }
        }

        self.queued_frames += incoming;
        self.classes[envelope.priority.slot()].push_back(envelope);

        if overflow.dropped_envelopes > 0 {
            Some(overflow)
        } else {
            None
        }
    }

    fn record_drop(&mut self, overflow: &mut Overflow, frames: usize) {
        overflow.dropped_envelopes += 1;
        overflow.dropped_frames += frames;
        self.stats.envelopes_dropped += 1;
        self.stats.frames_dropped += frames as u64;
    }

    /// Remove one envelope at or below `ceiling`, lowest class first,
    /// oldest not-yet-started envelope within the class. Returns its
    /// remaining frame count.
    fn drop_victim(&mut self, ceiling: Priority) -> Option<usize> {
        for priority in Priority::ALL_ASCENDING {
            if priority > ceiling {
                break;
            }
            let class = &mut self.classes[priority.slot()];
            if class.is_empty() {
                continue;
            }
            let idx = class.iter().position(|e| !e.in_flight()).unwrap_or(0);
            if let Some(victim) = class.remove(idx) {
                self.queued_frames -= victim.remaining();
                return Some(victim.remaining());
            }
        }
        None
    }

    /// Release frames allowed by suspension and the rate limiter.
    pub fn drain(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if self.suspended {
            return out;
        }

        while let Some(priority) = self.next_class() {
            if !self.bucket.try_acquire(now) {
                break;
            }
            let class = &mut self.classes[priority.slot()];
            let Some(envelope) = class.front_mut() else {
                break;
            };
            if let Some(frame) = envelope.frames.pop_front() {
                envelope.sent += 1;
                self.queued_frames -= 1;
                self.stats.frames_sent += 1;
                out.push(frame);
            }
            if envelope.frames.is_empty() {
                class.pop_front();
                self.stats.envelopes_sent += 1;
            }
        }

        out
    }

    fn next_class(&self) -> Option<Priority> {
        Priority::ALL_DESCENDING
            .into_iter()
            .find(|p| !self.classes[p.slot()].is_empty())
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        if self.suspended != suspended {
            log::debug!(
                "Transport {} ({} frames queued)",
                if suspended { "suspended" } else { "resumed" },
                self.queued_frames
            );
        }
        self.suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Frames waiting across all classes.
    pub fn queued_frames(&self) -> usize {
        self.queued_frames
    }

    /// Envelopes waiting in one class.
    pub fn queued_envelopes(&self, priority: Priority) -> usize {
        self.classes[priority.slot()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued_frames == 0
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    /// Drop everything queued (profile reset). Not counted as overflow.
    pub fn clear(&mut self) {
        for class in &mut self.classes {
            class.clear();
        }
        self.queued_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(burst: u32, max_frames: usize, now: Instant) -> TransportQueue {
        TransportQueue::new(TokenBucket::new(1, Duration::from_secs(1), burst, now), max_frames)
    }

    fn env(tag: u8, frames: usize, priority: Priority, now: Instant) -> OutboundEnvelope {
        OutboundEnvelope::new(vec![vec![tag]; frames], priority, now)
    }

    #[test]
    fn test_token_bucket_refill() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(2, Duration::from_secs(1), 4, t0);
        for _ in 0..4 {
            assert!(bucket.try_acquire(t0));
        }
        assert!(!bucket.try_acquire(t0));
        assert!(!bucket.try_acquire(t0 + Duration::from_millis(999)));
        assert_eq!(bucket.available(t0 + Duration::from_secs(1)), 2);
        // capped at burst
        assert_eq!(bucket.available(t0 + Duration::from_secs(60)), 4);
    }

    #[test]
    fn test_token_bucket_keeps_fractional_progress() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1, Duration::from_secs(1), 2, t0);
        assert!(bucket.try_acquire(t0));
        assert!(bucket.try_acquire(t0));
        // 1.5 intervals: one token, half an interval carried over
        assert!(bucket.try_acquire(t0 + Duration::from_millis(1500)));
        assert!(!bucket.try_acquire(t0 + Duration::from_millis(1900)));
        assert!(bucket.try_acquire(t0 + Duration::from_millis(2000)));
    }

    #[test]
    fn test_drain_respects_rate_limit() {
        let t0 = Instant::now();
        let mut q = queue(2, 64, t0);
        q.enqueue(env(1, 5, Priority::Incremental, t0));

        assert_eq!(q.drain(t0).len(), 2);
        assert_eq!(q.drain(t0).len(), 0);
        assert_eq!(q.drain(t0 + Duration::from_secs(1)).len(), 1);
        assert_eq!(q.queued_frames(), 2);
    }

    #[test]
    fn test_chunks_consume_one_token_each() {
        let t0 = Instant::now();
        let mut q = queue(3, 64, t0);
        q.enqueue(env(1, 3, Priority::FullState, t0));
        assert_eq!(q.drain(t0).len(), 3);
        assert_eq!(q.stats().envelopes_sent, 1);
        assert_eq!(q.stats().frames_sent, 3);
    }

    #[test]
    fn test_nothing_sent_while_suspended() {
        let t0 = Instant::now();
        let mut q = queue(10, 64, t0);
        q.set_suspended(true);
        q.enqueue(env(1, 1, Priority::Control, t0));
        q.enqueue(env(2, 1, Priority::Incremental, t0));

        assert!(q.drain(t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(q.queued_frames(), 2);

        q.set_suspended(false);
        let sent = q.drain(t0 + Duration::from_secs(30));
        assert_eq!(sent, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_drain_order_by_priority_then_fifo() {
        let t0 = Instant::now();
        let mut q = queue(10, 64, t0);
        q.enqueue(env(1, 1, Priority::Incremental, t0));
        q.enqueue(env(2, 1, Priority::FullState, t0));
        q.enqueue(env(3, 1, Priority::Incremental, t0));
        q.enqueue(env(4, 1, Priority::Control, t0));

        assert_eq!(q.drain(t0), vec![vec![4], vec![2], vec![1], vec![3]]);
    }

    #[test]
    fn test_overflow_drops_lowest_priority_first() {
        let t0 = Instant::now();
        let mut q = queue(10, 4, t0);
        q.set_suspended(true);
        q.enqueue(env(1, 1, Priority::Control, t0));
        q.enqueue(env(2, 1, Priority::FullState, t0));
        q.enqueue(env(3, 1, Priority::Incremental, t0));
        q.enqueue(env(4, 1, Priority::Incremental, t0));

        let overflow = q.enqueue(env(5, 1, Priority::FullState, t0)).unwrap();
        assert_eq!(overflow.dropped_envelopes, 1);
        assert_eq!(q.queued_envelopes(Priority::Incremental), 1);

        q.enqueue(env(6, 2, Priority::Control, t0)).unwrap();
        assert_eq!(q.queued_envelopes(Priority::Incremental), 0);
        assert_eq!(q.queued_envelopes(Priority::FullState), 1);
        assert_eq!(q.queued_envelopes(Priority::Control), 2);
        assert_eq!(q.queued_frames(), 4);

        q.set_suspended(false);
        // full-state 2 was the oldest of its class, so it went before 5
        let sent = q.drain(t0);
        assert_eq!(sent, vec![vec![1], vec![6], vec![6], vec![5]]);
    }

    #[test]
    fn test_low_priority_envelope_rejected_when_queue_outranks_it() {
        let t0 = Instant::now();
        let mut q = queue(10, 2, t0);
        q.set_suspended(true);
        q.enqueue(env(1, 1, Priority::Control, t0));
        q.enqueue(env(2, 1, Priority::FullState, t0));

        let overflow = q.enqueue(env(3, 1, Priority::Incremental, t0)).unwrap();
        assert_eq!(overflow, Overflow { dropped_envelopes: 1, dropped_frames: 1 });
        assert_eq!(q.queued_envelopes(Priority::Incremental), 0);
        assert_eq!(q.queued_frames(), 2);
    }

    #[test]
    fn test_envelope_larger_than_capacity_dropped() {
        let t0 = Instant::now();
        let mut q = queue(10, 3, t0);
        let overflow = q.enqueue(env(1, 4, Priority::Control, t0)).unwrap();
        assert_eq!(overflow.dropped_frames, 4);
        assert!(q.is_empty());
    }

    #[test]
    fn test_in_flight_envelope_spared() {
        let t0 = Instant::now();
        let mut q = queue(1, 4, t0);
        q.enqueue(env(1, 3, Priority::Incremental, t0));
        assert_eq!(q.drain(t0).len(), 1); // envelope 1 now in flight
        q.enqueue(env(2, 1, Priority::Incremental, t0));
        q.enqueue(env(3, 2, Priority::FullState, t0)).unwrap();

        // envelope 2 was dropped, not the in-flight remainder of 1
        assert_eq!(q.queued_envelopes(Priority::Incremental), 1);
        assert_eq!(q.queued_frames(), 4);
    }

    #[test]
    fn test_clear() {
        let t0 = Instant::now();
        let mut q = queue(1, 8, t0);
        q.enqueue(env(1, 3, Priority::Incremental, t0));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.stats().envelopes_dropped, 0);
    }
}
