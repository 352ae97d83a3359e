//! Execution circuit breaker.
//!
//! Too many execution failures inside the rolling window halt all
//! submissions for a cooldown period, then the breaker re-arms on its own.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, info};

use crate::types::monotonic_now_ns;

struct BreakerState {
    /// Monotonic ns timestamps of recent failures
    failures: VecDeque<u64>,
    open_until_ns: Option<u64>,
}

pub struct CircuitBreaker {
    threshold: usize,
    window_ns: u64,
    cooldown_ns: u64,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold,
            window_ns: window.as_nanos() as u64,
            cooldown_ns: cooldown.as_nanos() as u64,
            state: Mutex::new(BreakerState {
                failures: VecDeque::new(),
                open_until_ns: None,
            }),
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(monotonic_now_ns());
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.failures.clear();
    }

    pub fn is_halted(&self) -> bool {
        self.is_halted_at(monotonic_now_ns())
    }

    fn record_failure_at(&self, now_ns: u64) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.failures.push_back(now_ns);
        let cutoff = now_ns.saturating_sub(self.window_ns);
        while state.failures.front().is_some_and(|&t| t < cutoff) {
            state.failures.pop_front();
        }
        if state.failures.len() >= self.threshold && state.open_until_ns.is_none() {
            state.open_until_ns = Some(now_ns + self.cooldown_ns);
            error!(
                "[BREAKER] tripped: {} failures in window, halting submissions for {}s",
                state.failures.len(),
                self.cooldown_ns / 1_000_000_000
            );
        }
    }

    fn is_halted_at(&self, now_ns: u64) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.open_until_ns {
            Some(until) if now_ns >= until => {
                state.open_until_ns = None;
                state.failures.clear();
                info!("[BREAKER] cooldown expired, re-armed");
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(60), Duration::from_secs(30))
    }

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn test_trips_after_threshold_in_window() {
        let cb = breaker();
        for i in 0..4 {
            cb.record_failure_at(i * SEC);
        }
        assert!(!cb.is_halted_at(5 * SEC));

        cb.record_failure_at(5 * SEC);
        assert!(cb.is_halted_at(6 * SEC));
    }

    #[test]
    fn test_old_failures_age_out() {
        let cb = breaker();
        for i in 0..4 {
            cb.record_failure_at(i * SEC);
        }
        // the fifth failure lands after the first four left the window
        cb.record_failure_at(120 * SEC);
        assert!(!cb.is_halted_at(121 * SEC));
    }

    #[test]
    fn test_success_clears_failures() {
        let cb = breaker();
        for i in 0..4 {
            cb.record_failure_at(i * SEC);
        }
        cb.record_success();
        cb.record_failure_at(5 * SEC);
        assert!(!cb.is_halted_at(6 * SEC));
    }

    #[test]
    fn test_cooldown_rearms() {
        let cb = breaker();
        for i in 0..5 {
            cb.record_failure_at(i * SEC);
        }
        assert!(cb.is_halted_at(10 * SEC));
        assert!(cb.is_halted_at(33 * SEC));
        // trip was at t=4s, cooldown 30s
        assert!(!cb.is_halted_at(35 * SEC));
        // re-armed clean: a single new failure does not trip
        cb.record_failure_at(36 * SEC);
        assert!(!cb.is_halted_at(37 * SEC));
    }
}
