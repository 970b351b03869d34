//! Bounded attempt counter used by every reliability loop.
//!
//! Each logical retry loop (login wait, heartbeat watchdog, every
//! file-transfer step) owns its own instance; counters are never shared
//! across unrelated operations. The counter is atomic so the heartbeat
//! instance can be ticked by the connection's timer task and inspected
//! by the supervisor at the same time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Default attempt limit.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A bounded attempt counter with a per-attempt timeout.
///
/// The overflow action is the caller's: `attempt()` returning `false`
/// is mapped to a timeout failure (token waits) or a connection close
/// (heartbeat watchdog).
#[derive(Debug)]
pub struct Retry {
    max_attempts: u32,
    timeout: Duration,
    count: AtomicU32,
}

impl Retry {
    pub fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts,
            timeout,
            count: AtomicU32::new(0),
        }
    }

    /// Per-attempt timeout for waits armed against this counter.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Consume one attempt.
    ///
    /// Returns `false` once the counter exceeds the limit — on exactly
    /// the `(max_attempts + 1)`-th call absent resets.
    pub fn attempt(&self) -> bool {
        self.count.fetch_add(1, Ordering::AcqRel) + 1 <= self.max_attempts
    }

    /// Zero the counter (progress was observed).
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    /// Jump the counter to the limit so the next `attempt()` overflows.
    /// Used to short-circuit a retry loop after a definitive failure.
    pub fn force_overflow(&self) {
        self.count.store(self.max_attempts, Ordering::Release);
    }

    /// Whether the counter has already run past its limit.
    ///
    /// A passive query — never consumes an attempt. The supervisor uses
    /// this to spot dead connections without touching their counters.
    pub fn is_overflow(&self) -> bool {
        self.count.load(Ordering::Acquire) > self.max_attempts
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT)
    }
}
