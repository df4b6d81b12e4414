//! Circuit breaker for the LLM dependency.
//!
//! Opens after `failure_threshold` consecutive failures and fails fast for
//! `timeout_seconds`; the first call after the window acts as the half-open
//! probe (success closes, failure reopens and resets the timer). Safe for
//! concurrent callers within one process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout_seconds: u64,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

/// Snapshot exported for metrics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub is_open: bool,
    pub failure_count: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub time_remaining_seconds: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            timeout_seconds: timeout_seconds.max(1),
            state: Mutex::new(BreakerState::default()),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Admission check: call before every guarded request.
    ///
    /// `Err(retry_in_seconds)` means the circuit is open and the call must
    /// fail fast. When the cool-down has elapsed the circuit half-opens: the
    /// state resets and this call is admitted as the probe.
    pub fn admit(&self) -> Result<(), u64> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        let Some(opened_at) = state.opened_at else {
            return Ok(());
        };
        let elapsed = opened_at.elapsed().as_secs();
        if elapsed > self.timeout_seconds {
            tracing::info!(
                timeout_seconds = self.timeout_seconds,
                "circuit breaker timeout elapsed, half-open probe admitted"
            );
            state.opened_at = None;
            state.failure_count = 0;
            return Ok(());
        }
        let remaining = self.timeout_seconds - elapsed;
        tracing::warn!(
            failure_count = state.failure_count,
            remaining_s = remaining,
            "circuit breaker open, failing fast"
        );
        Err(remaining)
    }

    /// Record a successful call; resets the consecutive-failure counter.
    pub fn on_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        if state.failure_count > 0 {
            tracing::info!(
                previous_failures = state.failure_count,
                "circuit breaker recovered"
            );
        }
        state.failure_count = 0;
        state.opened_at = None;
    }

    /// Record a failed call; opens the circuit at the threshold.
    pub fn on_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.failure_count += 1;
        if state.failure_count >= self.failure_threshold {
            state.opened_at = Some(Instant::now());
            tracing::error!(
                failure_count = state.failure_count,
                failure_threshold = self.failure_threshold,
                timeout_seconds = self.timeout_seconds,
                "circuit breaker opened"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.opened_at {
            Some(t) => t.elapsed().as_secs() <= self.timeout_seconds,
            None => false,
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let state = self.state.lock().unwrap();
        let time_remaining = state.opened_at.and_then(|t| {
            let elapsed = t.elapsed().as_secs();
            (elapsed <= self.timeout_seconds).then(|| self.timeout_seconds - elapsed)
        });
        BreakerStats {
            is_open: time_remaining.is_some(),
            failure_count: state.failure_count,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            time_remaining_seconds: time_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(3, 60);
        for _ in 0..2 {
            assert!(cb.admit().is_ok());
            cb.on_failure();
        }
        assert!(!cb.is_open());
        assert!(cb.admit().is_ok());
        cb.on_failure();
        assert!(cb.is_open());
        assert!(cb.admit().is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new(3, 60);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert!(!cb.is_open(), "count must restart after a success");
        cb.on_failure();
        assert!(cb.is_open());
    }

    #[test]
    fn stats_track_totals() {
        let cb = CircuitBreaker::new(2, 60);
        let _ = cb.admit();
        cb.on_success();
        let _ = cb.admit();
        cb.on_failure();
        let _ = cb.admit();
        cb.on_failure();
        // open now: denied call still counts as a call
        assert!(cb.admit().is_err());
        let stats = cb.stats();
        assert!(stats.is_open);
        assert_eq!(stats.total_calls, 4);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.failure_count, 2);
        assert!(stats.time_remaining_seconds.is_some());
    }

    #[test]
    fn zero_config_values_are_clamped() {
        let cb = CircuitBreaker::new(0, 0);
        cb.on_failure();
        assert!(cb.is_open(), "threshold clamps to 1");
    }
}
