//! Per-target circuit breaker.
//!
//! States: `closed` (normal), `open` (rejecting after the consecutive
//! failure threshold tripped), `half-open` (probing after the recovery
//! timeout). A success in half-open closes the circuit; a failure
//! reopens it.

use chrono::{DateTime, Duration, Utc};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without dialing the target.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

/// A single target's breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probing: bool,
}

impl CircuitBreaker {
    /// Create a breaker tripping after `failure_threshold` consecutive
    /// failures, probing again after `recovery_timeout_s`.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout_s: i64) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout: Duration::seconds(recovery_timeout_s.max(1)),
            consecutive_failures: 0,
            opened_at: None,
            probing: false,
        }
    }

    /// The state at `now`.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened) if now - opened >= self.recovery_timeout => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Whether a call may proceed at `now`. In half-open, only the
    /// first caller gets the probe; the rest are rejected until the
    /// probe resolves.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state(now) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.probing {
                    false
                } else {
                    self.probing = true;
                    true
                }
            },
        }
    }

    /// Record a success: closes the circuit.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probing = false;
    }

    /// Record a failure at `now`: trips the circuit at the threshold,
    /// reopens it from half-open.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.probing = false;
        if self.consecutive_failures >= self.failure_threshold {
            self.opened_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_until_threshold() {
        let mut cb = CircuitBreaker::new(3, 60);
        let now = Utc::now();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Closed);
        assert!(cb.allow(now));
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Open);
        assert!(!cb.allow(now));
    }

    #[test]
    fn success_resets_the_count() {
        let mut cb = CircuitBreaker::new(3, 60);
        let now = Utc::now();
        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_recovery_timeout_allows_one_probe() {
        let mut cb = CircuitBreaker::new(1, 60);
        let t0 = Utc::now();
        cb.record_failure(t0);
        assert_eq!(cb.state(t0), CircuitState::Open);

        let t1 = t0 + Duration::seconds(61);
        assert_eq!(cb.state(t1), CircuitState::HalfOpen);
        assert!(cb.allow(t1), "first probe passes");
        assert!(!cb.allow(t1), "second caller waits for the probe");
    }

    #[test]
    fn probe_success_closes() {
        let mut cb = CircuitBreaker::new(1, 60);
        let t0 = Utc::now();
        cb.record_failure(t0);
        let t1 = t0 + Duration::seconds(61);
        assert!(cb.allow(t1));
        cb.record_success();
        assert_eq!(cb.state(t1), CircuitState::Closed);
        assert!(cb.allow(t1));
    }

    #[test]
    fn probe_failure_reopens() {
        let mut cb = CircuitBreaker::new(1, 60);
        let t0 = Utc::now();
        cb.record_failure(t0);
        let t1 = t0 + Duration::seconds(61);
        assert!(cb.allow(t1));
        cb.record_failure(t1);
        assert_eq!(cb.state(t1), CircuitState::Open);
        let t2 = t1 + Duration::seconds(61);
        assert_eq!(cb.state(t2), CircuitState::HalfOpen);
    }
}
