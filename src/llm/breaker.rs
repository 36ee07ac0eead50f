//! Per-provider circuit breaker
//!
//! Opens after a run of consecutive failures; while open the provider is
//! skipped without a call. After the cooldown one probe attempt is allowed
//! (half-open); any success closes the breaker.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Consecutive failures before the breaker opens
pub const FAILURE_THRESHOLD: u32 = 3;

/// How long an open breaker rejects calls
pub const COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the provider must be skipped. Returns false once the
    /// cooldown has elapsed so a single half-open probe can go through.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        if state.consecutive_failures < FAILURE_THRESHOLD {
            return false;
        }
        match state.last_failure {
            Some(at) => at.elapsed() < COOLDOWN,
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.last_failure = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new();
        assert!(!breaker.is_open());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_closes() {
        let breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new();
        for _ in 0..3 {
            breaker.record_failure();
        }
        // Simulate an elapsed cooldown by backdating the last failure
        {
            let mut state = breaker.state.lock();
            state.last_failure = Some(Instant::now() - COOLDOWN - Duration::from_secs(1));
        }
        assert!(!breaker.is_open());
        // The probe fails: the breaker snaps open again
        breaker.record_failure();
        assert!(breaker.is_open());
    }
}
