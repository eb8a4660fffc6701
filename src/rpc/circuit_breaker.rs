//! Circuit breaker for the client pool (spec §4.2).
//!
//! Closed → Open → HalfOpen → Closed, with a rolling failure window in
//! the closed state (reused from `http-rpc-provider::circuit_breaker`,
//! since spec.md doesn't define window behavior and letting failures
//! accumulate indefinitely across unrelated time periods is a worse
//! reading of "consecutive failures").

use parking_lot::RwLock;
use std::time::{Duration, Instant};

use crate::error::EngineError;

/// Circuit breaker states (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Successes required in half-open before closing.
    pub half_open_limit: u32,
    /// How long to stay open before probing half-open.
    pub reset_timeout: Duration,
    /// Rolling window for failure counting while closed.
    pub window_duration: Duration,
}

impl CircuitBreakerConfig {
    /// Reject thresholds that could never open or never close the
    /// breaker (spec §A.3).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.failure_threshold == 0 {
            return Err(EngineError::ConfigInvalid {
                reason: "circuit breaker failure_threshold must be greater than zero".to_string(),
            });
        }
        if self.half_open_limit == 0 {
            return Err(EngineError::ConfigInvalid {
                reason: "circuit breaker half_open_limit must be greater than zero".to_string(),
            });
        }
        if self.reset_timeout.is_zero() {
            return Err(EngineError::ConfigInvalid {
                reason: "circuit breaker reset_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_limit: 2,
            reset_timeout: Duration::from_secs(30),
            window_duration: Duration::from_secs(60),
        }
    }
}

struct State {
    state: CircuitState,
    failure_count: u32,
    half_open_in_flight: u32,
    last_failure_at: Instant,
    window_start: Instant,
}

impl Default for State {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_in_flight: 0,
            last_failure_at: now,
            window_start: now,
        }
    }
}

/// A single circuit breaker shared by the pool across all clients
/// (spec §3: "a single optional circuit breaker" per pool).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State::default()),
        }
    }

    /// Whether a request may currently proceed (spec §4.2 `AllowRequest`).
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.write();
        match state.state {
            CircuitState::Closed => {
                if state.window_start.elapsed() > self.config.window_duration {
                    state.failure_count = 0;
                    state.window_start = Instant::now();
                }
                true
            }
            CircuitState::Open => {
                if state.last_failure_at.elapsed() >= self.config.reset_timeout {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_in_flight = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => state.half_open_in_flight < self.config.half_open_limit,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.write();
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.half_open_in_flight += 1;
                if state.half_open_in_flight >= self.config.half_open_limit {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.half_open_in_flight = 0;
                    state.window_start = Instant::now();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.write();
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.last_failure_at = Instant::now();
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.failure_count = self.config.failure_threshold;
                state.half_open_in_flight = 0;
                state.last_failure_at = Instant::now();
            }
            CircuitState::Open => {
                state.last_failure_at = Instant::now();
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.read().state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.read().failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_failure_threshold() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::ConfigInvalid { .. })));
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        assert!(cb.allow_request());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            half_open_limit: 2,
            reset_timeout: Duration::from_millis(1),
            ..Default::default()
        });
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(1),
            ..Default::default()
        });
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn window_resets_failure_count_once_closed_and_expired() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            window_duration: Duration::from_millis(1),
            ..Default::default()
        });
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_request());
        assert_eq!(cb.failure_count(), 0);
    }
}
