//! Server clock abstraction.
//!
//! Record timestamps use the shared server clock (seconds), not local time,
//! so peers in different time zones or with drifting clocks still agree on
//! ordering. Timers (debounce, reassembly) use the `Instant` passed to each
//! event instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Source of server time in whole seconds.
pub trait ServerClock: Send {
    fn now_secs(&self) -> u64;
}

/// Wall clock, for hosts without a server time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemServerClock;

impl ServerClock for SystemServerClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Settable clock shared between a test and the node under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl ServerClock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
