use parking_lot::{const_mutex, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Expiration sentinel: a time that never arrives.
pub const INFINITE: i64 = i64::MAX;

/// Duration sentinel: "unset" in negotiation and "terminate" on the wire.
pub const DURATION_MAX: i32 = i32::MAX - 1;

/// Incarnation id of an agent, application, remote agent or lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Instance(pub i64);

impl Instance {
    pub const NONE: Instance = Instance(0);

    pub fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static LAST_INSTANCE: Mutex<i64> = const_mutex(0);

/// Returns a strictly increasing instance id, seeded from wall-clock ticks so
/// that a restarted process still hands out larger ids than its predecessor.
pub fn next_instance() -> Instance {
    let ticks = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos() / 100).unwrap_or(i64::MAX - 1))
        .unwrap_or(0);
    let mut last = LAST_INSTANCE.lock();
    let next = ticks.max(*last + 1);
    *last = next;
    Instance(next)
}

/// Monotonic millisecond clock on tokio's `Instant`; paused-time tests drive every deadline.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn now(&self) -> i64 {
        i64::try_from(Instant::now().saturating_duration_since(self.origin).as_millis())
            .unwrap_or(INFINITE - 1)
    }

    /// Converts an engine time back into a tokio instant, `None` for `INFINITE`.
    pub fn instant_at(&self, at: i64) -> Option<Instant> {
        if at == INFINITE {
            return None;
        }
        let offset = u64::try_from(at.max(0)).unwrap_or(0);
        Some(self.origin + std::time::Duration::from_millis(offset))
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// `base + duration`, saturating at `INFINITE` and treating `DURATION_MAX` as unbounded.
pub fn add_duration(base: i64, duration_ms: i32) -> i64 {
    if base == INFINITE || duration_ms == DURATION_MAX {
        return INFINITE;
    }
    base.saturating_add(i64::from(duration_ms))
}

/// Remaining milliseconds until `at`, clamped into the `i32` range used by TTLs.
pub fn remaining_ms(at: i64, now: i64) -> i32 {
    if at == INFINITE {
        return i32::MAX;
    }
    i32::try_from(at.saturating_sub(now)).unwrap_or(if at > now { i32::MAX } else { i32::MIN })
}
