// =============================================================================
// Clock — injectable wall time
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};

/// Source of "now" in epoch milliseconds. Seeding, staleness checks and the
/// synthetic stream read time only through this trait.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Operating-system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock. Every read advances it by `step_ms`, which lets a
/// synthetic stream cross bucket boundaries without waiting on real time.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
    step_ms: i64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self::stepping(start_ms, 0)
    }

    pub fn stepping(start_ms: i64, step_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            step_ms,
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.fetch_add(self.step_ms, Ordering::SeqCst)
    }
}
