//! Leading + trailing edge debounce for outbound publishes.
//!
//! ```text
//! notify ─┬─► publish now ──────── window ──────────┬─► trailing publish
//!         │   notify ┐ notify ┐ notify ┐            │   (one, if any
//!         │          └────────┴────────┴─ coalesce ─┘    notify landed)
//! ```
//!
//! The first mutation after a quiet period publishes immediately. Further
//! mutations inside the cooldown window collapse into exactly one trailing
//! publish, fired by [`PublishScheduler::poll`] once the window closes. The
//! trailing publish opens a new window of its own.

use std::time::{Duration, Instant};

/// What the caller should do after [`PublishScheduler::notify_dirty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishDecision {
    /// Publish now; a cooldown window has started.
    Immediate,
    /// Cooling down; one trailing publish is now scheduled.
    Deferred,
    /// Cooling down and a trailing publish was already scheduled.
    Coalesced,
}

/// Debounces bursts of dirty notifications.
#[derive(Debug, Clone)]
pub struct PublishScheduler {
    cooldown: Duration,
    window_ends: Option<Instant>,
    trailing: bool,
}

impl PublishScheduler {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            window_ends: None,
            trailing: false,
        }
    }

    /// Report that something changed and should be published.
    pub fn notify_dirty(&mut self, now: Instant) -> PublishDecision {
        if !self.cooling_down(now) {
            self.window_ends = Some(now + self.cooldown);
            self.trailing = false;
            return PublishDecision::Immediate;
        }

        if self.trailing {
            PublishDecision::Coalesced
        } else {
            self.trailing = true;
            PublishDecision::Deferred
        }
    }

    /// Returns true exactly once per window when a trailing publish is due.
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.trailing || self.cooling_down(now) {
            return false;
        }
        self.trailing = false;
        self.window_ends = Some(now + self.cooldown);
        true
    }

    pub fn cooling_down(&self, now: Instant) -> bool {
        self.window_ends.is_some_and(|end| now < end)
    }

    /// Whether a trailing publish is scheduled.
    pub fn is_pending(&self) -> bool {
        self.trailing
    }

    /// When the pending trailing publish becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        if self.trailing {
            self.window_ends
        } else {
            None
        }
    }

    /// Drop the window and any scheduled publish.
    pub fn reset(&mut self) {
        self.window_ends = None;
        self.trailing = false;
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_millis(500);

    #[test]
    fn test_first_notify_is_immediate() {
        let mut s = PublishScheduler::new(COOLDOWN);
        let t0 = Instant::now();
        assert_eq!(s.notify_dirty(t0), PublishDecision::Immediate);
        assert!(s.cooling_down(t0));
        assert!(!s.is_pending());
    }

    #[test]
    fn test_burst_coalesces_into_one_trailing() {
        let mut s = PublishScheduler::new(COOLDOWN);
        let t0 = Instant::now();
        let mut immediate = 0;
        let mut trailing = 0;

        for i in 0..10u64 {
            let now = t0 + Duration::from_millis(i * 10);
            if s.notify_dirty(now) == PublishDecision::Immediate {
                immediate += 1;
            }
            if s.poll(now) {
                trailing += 1;
            }
        }
        assert!(s.is_pending());

        // Nothing fires before the window closes.
        assert!(!s.poll(t0 + Duration::from_millis(499)));
        if s.poll(t0 + COOLDOWN) {
            trailing += 1;
        }
        assert!(!s.poll(t0 + COOLDOWN + Duration::from_millis(1)));

        assert_eq!(immediate, 1);
        assert_eq!(trailing, 1);
    }

    #[test]
    fn test_decisions_within_window() {
        let mut s = PublishScheduler::new(COOLDOWN);
        let t0 = Instant::now();
        s.notify_dirty(t0);
        assert_eq!(s.notify_dirty(t0 + Duration::from_millis(1)), PublishDecision::Deferred);
        assert_eq!(s.notify_dirty(t0 + Duration::from_millis(2)), PublishDecision::Coalesced);
        assert_eq!(s.deadline(), Some(t0 + COOLDOWN));
    }

    #[test]
    fn test_trailing_publish_opens_new_window() {
        let mut s = PublishScheduler::new(COOLDOWN);
        let t0 = Instant::now();
        s.notify_dirty(t0);
        s.notify_dirty(t0 + Duration::from_millis(100));

        let fired_at = t0 + COOLDOWN;
        assert!(s.poll(fired_at));
        assert_eq!(
            s.notify_dirty(fired_at + Duration::from_millis(10)),
            PublishDecision::Deferred
        );
        assert!(s.poll(fired_at + COOLDOWN));
    }

    #[test]
    fn test_quiet_period_returns_to_immediate() {
        let mut s = PublishScheduler::new(COOLDOWN);
        let t0 = Instant::now();
        s.notify_dirty(t0);
        assert_eq!(s.notify_dirty(t0 + COOLDOWN * 2), PublishDecision::Immediate);
    }

    #[test]
    fn test_reset_drops_pending() {
        let mut s = PublishScheduler::new(COOLDOWN);
        let t0 = Instant::now();
        s.notify_dirty(t0);
        s.notify_dirty(t0);
        s.reset();
        assert!(!s.is_pending());
        assert!(!s.poll(t0 + COOLDOWN));
        assert_eq!(s.notify_dirty(t0), PublishDecision::Immediate);
    }
}
