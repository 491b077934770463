//! Injectable time source (§9 design note: "Time source").
//!
//! Mirrors the teacher's habit of keeping I/O and time behind small traits so
//! unit tests can drive them deterministically (see how `tokio::time::Instant`
//! is wrapped rather than used directly in `xmlstream/common.rs`).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Milliseconds since an arbitrary epoch. Only relative comparisons matter.
pub type Millis = i64;

/// A replaceable `now()`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> Millis;
}

/// Real wall-clock time, backed by `std::time::SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Millis)
            .unwrap_or(0)
    }
}

/// A manually-advanced clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct TestClock(Arc<AtomicI64>);

impl TestClock {
    pub fn new(start_ms: Millis) -> Self {
        TestClock(Arc::new(AtomicI64::new(start_ms)))
    }

    pub fn advance(&self, delta_ms: Millis) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: Millis) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> Millis {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared handle to a [`Clock`] implementation.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
