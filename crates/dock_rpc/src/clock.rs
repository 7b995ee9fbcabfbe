use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Injected time source for envelope timestamps. Consumers take a clock from
/// their host collaborator rather than reaching for the system clock directly.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Default clock backed by the OS wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Monotonic-or-later fake clock for tests: every call returns a value strictly
/// greater than or equal to the last one, advancing by at least one millisecond.
#[derive(Debug, Default)]
pub struct FakeClock {
    next: AtomicU64,
}

impl FakeClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            next: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.next.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_millis(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
