//! Per-destination circuit breaker.
//!
//! ```text
//! Closed --(threshold consecutive failures)--> Open
//! Open   --(cooldown elapsed, next attempt)--> HalfOpen (one trial)
//! HalfOpen --success--> Closed
//! HalfOpen --failure--> Open (cooldown restarts)
//! ```
//!
//! Backpressure responses are neutral: they neither count as failures nor
//! close the circuit, but they do release a half-open trial slot.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::DeliveryError;

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    /// How long an open circuit rejects attempts.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Health of one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct Entry {
    state: CircuitState,
    consecutive_failures: u32,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }
}

/// Tracks delivery health for every destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state for a destination.
    pub fn state(&self, destination: &str) -> CircuitState {
        self.entries()
            .get(destination)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Ask to make an attempt now.
    pub fn try_acquire(&self, destination: &str) -> Result<(), DeliveryError> {
        self.try_acquire_at(destination, Instant::now())
    }

    /// Ask to make an attempt at `now`. Fails fast while open, and while a
    /// half-open trial is already in flight.
    pub fn try_acquire_at(&self, destination: &str, now: Instant) -> Result<(), DeliveryError> {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(destination) else {
            return Ok(());
        };

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { until } if now < until => Err(DeliveryError::CircuitOpen {
                destination: destination.to_string(),
                retry_after: until - now,
            }),
            CircuitState::Open { .. } => {
                entry.state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                tracing::info!(destination, "circuit half-open, allowing trial delivery");
                Ok(())
            }
            CircuitState::HalfOpen {
                trial_in_flight: false,
            } => {
                entry.state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(())
            }
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => Err(DeliveryError::CircuitOpen {
                destination: destination.to_string(),
                retry_after: Duration::ZERO,
            }),
        }
    }

    /// The attempt succeeded.
    pub fn record_success(&self, destination: &str) {
        let mut entries = self.entries();
        if let Some(entry) = entries.remove(destination) {
            if entry.state != CircuitState::Closed {
                tracing::info!(destination, "circuit closed");
            }
        }
    }

    /// The attempt failed.
    pub fn record_failure(&self, destination: &str) {
        self.record_failure_at(destination, Instant::now());
    }

    /// [`CircuitBreaker::record_failure`] with an explicit clock.
    pub fn record_failure_at(&self, destination: &str, now: Instant) {
        let mut entries = self.entries();
        let entry = entries.entry(destination.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        let reopen = matches!(entry.state, CircuitState::HalfOpen { .. });
        let trip = matches!(entry.state, CircuitState::Closed)
            && entry.consecutive_failures >= self.config.threshold;

        if reopen || trip {
            entry.state = CircuitState::Open {
                until: now + self.config.cooldown,
            };
            tracing::info!(
                destination,
                failures = entry.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            );
        } else {
            tracing::debug!(
                destination,
                failures = entry.consecutive_failures,
                "delivery failure recorded"
            );
        }
    }

    /// The attempt ended without telling us anything about health
    /// (backpressure). Releases a half-open trial slot.
    pub fn record_neutral(&self, destination: &str) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(destination) {
            if let CircuitState::HalfOpen { .. } = entry.state {
                entry.state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }
}
