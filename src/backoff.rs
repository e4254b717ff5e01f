//! Spin-then-yield-then-park waiting for the blocking variants
//!
//! The fast path stays in user space: spin with `spin_loop` hints, then
//! yield the thread, and only once both budgets are spent fall back to short
//! sleeps until the operation succeeds or the deadline passes.

use crossbeam_utils::Backoff;
use std::time::{Duration, Instant};

/// Tuning for blocking send/receive
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Busy-spin rounds before yielding
    pub spin_limit: u32,
    /// Yield rounds before parking
    pub yield_limit: u32,
    /// Sleep per round once parked
    pub park: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            spin_limit: 64,
            yield_limit: 16,
            park: Duration::from_micros(50),
        }
    }
}

/// Retry `attempt` until it yields `Some`, or `timeout` expires.
///
/// Returns `None` on timeout. `None` for `timeout` waits forever.
pub fn wait_for<T, F>(config: &BackoffConfig, timeout: Option<Duration>, mut attempt: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    if let Some(v) = attempt() {
        return Some(v);
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let backoff = Backoff::new();
    let mut rounds: u32 = 0;
    let mut parked = false;

    loop {
        if let Some(v) = attempt() {
            return Some(v);
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            return None;
        }

        rounds = rounds.saturating_add(1);
        if rounds <= config.spin_limit {
            backoff.spin();
        } else if rounds <= config.spin_limit.saturating_add(config.yield_limit)
            && !backoff.is_completed()
        {
            backoff.snooze();
        } else {
            if !parked {
                tracing::trace!(rounds, "backoff escalated to parking");
                parked = true;
            }
            let nap = match deadline {
                Some(d) => config.park.min(d.saturating_duration_since(Instant::now())),
                None => config.park,
            };
            std::thread::sleep(nap);
        }
    }
}
