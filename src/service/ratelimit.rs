//! Per-client fixed-window rate limiting.
//!
//! One limiter instance guards one route. Windows are keyed by client IP;
//! stale windows are swept opportunistically so the map stays bounded by
//! the active client set.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sweep threshold: once the map holds this many entries, expired windows
/// are dropped on the next acquire.
const SWEEP_AT: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    started: Instant,
    count: u32,
}

/// Fixed-window counter per client IP.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    slots: Mutex<HashMap<IpAddr, WindowSlot>>,
}

impl FixedWindowLimiter {
    /// Allow `limit` requests per `window` per client.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Convenience: `limit` per minute.
    #[must_use]
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Convenience: `limit` per hour.
    #[must_use]
    pub fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(3600))
    }

    /// Take one unit of budget for `client`. Returns `false` when the
    /// client is over budget for the current window.
    #[must_use]
    pub fn try_acquire(&self, client: IpAddr) -> bool {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        if slots.len() >= SWEEP_AT {
            let window = self.window;
            slots.retain(|_, slot| now.duration_since(slot.started) < window);
        }

        let slot = slots.entry(client).or_insert(WindowSlot {
            started: now,
            count: 0,
        });
        if now.duration_since(slot.started) >= self.window {
            slot.started = now;
            slot.count = 0;
        }
        if slot.count >= self.limit {
            return false;
        }
        slot.count += 1;
        true
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
