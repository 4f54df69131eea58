//! Process-wide circuit breaker for the scan path.
//!
//! Opens after a configured number of *consecutive* scanner failures and
//! auto-closes once the cooldown elapses. While open, the boundary returns
//! a transient-unavailability status instead of invoking the scanner.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Breaker that opens after `threshold` consecutive failures and
    /// auto-closes after `cooldown`.
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether a request may pass. An expired cooldown closes the breaker
    /// and resets the failure count.
    #[must_use]
    pub fn try_pass(&self) -> bool {
        let mut state = self.state.lock();
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                state.open_until = None;
                state.consecutive_failures = 0;
                tracing::info!("circuit breaker cooled down, closing");
                true
            }
            None => true,
        }
    }

    /// Record a successful scan, resetting the consecutive counter.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
    }

    /// Record a failed scan. Returns `true` when this failure tripped the
    /// breaker open.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.open_until.is_none() && state.consecutive_failures >= self.threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                failures = state.consecutive_failures,
                cooldown_s = self.cooldown.as_secs(),
                "circuit breaker opened",
            );
            return true;
        }
        false
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
