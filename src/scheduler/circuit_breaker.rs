//! Circuit breaker for the acquisition path.
//!
//! Repeated Redis failures open the breaker so ticks stop hammering an
//! unavailable server. After the cooldown one probing window (half-open) lets
//! calls through: a success closes the breaker, a failure re-opens it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{info, warn};

use crate::metrics::SchedulerMetrics;

use super::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    changed_at: Instant,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    metrics: SchedulerMetrics,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                changed_at: Instant::now(),
            }),
            metrics: SchedulerMetrics::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a guarded call may proceed now.
    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    fn allow_request_at(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now.saturating_duration_since(inner.changed_at) >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.changed_at = now;
                    info!(breaker = self.name, "Circuit breaker half-open, probing");
                    true
                } else {
                    self.metrics.record_circuit_breaker("blocked");
                    false
                }
            }
            CircuitState::HalfOpen => {
                if now.saturating_duration_since(inner.changed_at)
                    >= self.config.half_open_duration
                {
                    self.close(&mut inner, now);
                }
                true
            }
        }
    }

    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            self.close(&mut inner, Instant::now());
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => self.open(&mut inner, now, "half_open_failure"),
            CircuitState::Open => {}
            CircuitState::Closed => {
                inner.failures.push_back(now);
                while inner.failures.front().is_some_and(|at| {
                    now.saturating_duration_since(*at) > self.config.failure_window
                }) {
                    inner.failures.pop_front();
                }
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    self.open(&mut inner, now, "failure_threshold");
                }
            }
        }
    }

    fn open(&self, inner: &mut BreakerState, now: Instant, reason: &str) {
        inner.state = CircuitState::Open;
        inner.changed_at = now;
        inner.failures.clear();
        self.metrics.record_circuit_breaker("trip");
        warn!(
            breaker = self.name,
            reason = reason,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn close(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Closed;
        inner.changed_at = now;
        inner.failures.clear();
        self.metrics.record_circuit_breaker("recovery");
        info!(breaker = self.name, "Circuit breaker closed");
    }
}
