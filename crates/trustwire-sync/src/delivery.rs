//! Reliable outbound callback delivery.
//!
//! Wraps a [`CallbackTransport`] with:
//!
//! - a cap on deliveries in flight (excess callers wait for a permit)
//! - a per-destination [`CircuitBreaker`] that fails fast while open
//! - payload downgrade: oversized `data` is replaced by a fetch URL
//! - a per-call timeout
//!
//! Delivery never retries on its own. A backpressure answer (429/503) is
//! reported as [`DeliveryOutcome::Backpressure`] for the caller to reschedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::circuit::{CircuitBreaker, CircuitConfig};
use crate::error::DeliveryError;
use crate::messages::CallbackMessage;
use crate::transport::CallbackTransport;

/// Delivery limits.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_concurrent: usize,
    /// Largest serialized `data` sent inline, in bytes.
    pub max_payload_for_high_granularity: usize,
    pub request_timeout: Duration,
    /// Deliver inline from [`DeliveryManager::notify`] instead of spawning.
    pub sync_callbacks: bool,
    pub circuit: CircuitConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_payload_for_high_granularity: 65_536,
            request_timeout: Duration::from_secs(10),
            sync_callbacks: false,
            circuit: CircuitConfig::default(),
        }
    }
}

/// A callback ready to send.
#[derive(Debug, Clone)]
pub struct OutboundCallback {
    /// Breaker key, normally the peer's actor id.
    pub destination: String,
    pub url: String,
    pub secret: String,
    pub message: CallbackMessage,
    /// Where the receiver can fetch `data` if it is dropped for size.
    pub fallback_url: Option<String>,
}

/// How a delivery ended when the peer answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16, downgraded: bool },
    /// The peer asked us to slow down.
    Backpressure { status: u16 },
}

fn is_backpressure(status: u16) -> bool {
    status == 429 || status == 503
}

/// An attempt admitted by the breaker. Dropping it without an outcome (the
/// delivery future was cancelled) counts as neutral so a half-open trial
/// slot is never leaked.
struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    destination: &'a str,
    settled: bool,
}

impl<'a> Attempt<'a> {
    fn start(breaker: &'a CircuitBreaker, destination: &'a str) -> Result<Self, DeliveryError> {
        breaker.try_acquire(destination)?;
        Ok(Self {
            breaker,
            destination,
            settled: false,
        })
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.destination);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.destination);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_neutral(self.destination);
        }
    }
}

/// Delivers callbacks with bounded concurrency and circuit breaking.
///
/// Clones share permits and breaker state.
#[derive(Clone)]
pub struct DeliveryManager {
    transport: Arc<dyn CallbackTransport>,
    permits: Arc<Semaphore>,
    breaker: Arc<CircuitBreaker>,
    config: DeliveryConfig,
}

impl DeliveryManager {
    pub fn new(transport: Arc<dyn CallbackTransport>, config: DeliveryConfig) -> Self {
        Self {
            transport,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            breaker: Arc::new(CircuitBreaker::new(config.circuit.clone())),
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Breaker state, shared by all clones.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Deliveries currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent
            .max(1)
            .saturating_sub(self.permits.available_permits())
    }

    /// Stop accepting deliveries. Waiting and later callers get
    /// [`DeliveryError::Closed`].
    pub fn close(&self) {
        self.permits.close();
    }

    /// Deliver one callback and wait for the answer.
    pub async fn deliver(
        &self,
        mut callback: OutboundCallback,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let destination = callback.destination.clone();
        let attempt = Attempt::start(&self.breaker, &destination)?;

        let mut downgraded = false;
        let size = callback.message.data_len();
        if size > self.config.max_payload_for_high_granularity {
            tracing::debug!(
                destination = %destination,
                sequence = callback.message.sequence,
                size,
                "payload too large, sending low granularity callback"
            );
            callback.message.downgrade(callback.fallback_url.take());
            downgraded = true;
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return Err(DeliveryError::Closed);
        };

        let result = self
            .transport
            .post(
                &callback.url,
                &callback.secret,
                &callback.message,
                self.config.request_timeout,
            )
            .await;

        match result {
            Ok(status) if (200..300).contains(&status) => {
                attempt.success();
                tracing::debug!(
                    destination = %destination,
                    sequence = callback.message.sequence,
                    status,
                    "callback delivered"
                );
                Ok(DeliveryOutcome::Delivered { status, downgraded })
            }
            Ok(status) if is_backpressure(status) => {
                drop(attempt);
                tracing::debug!(
                    destination = %destination,
                    sequence = callback.message.sequence,
                    status,
                    "peer applied backpressure"
                );
                Ok(DeliveryOutcome::Backpressure { status })
            }
            Ok(status) => {
                attempt.failure();
                Err(DeliveryError::Status(status))
            }
            Err(e) => {
                if e.counts_as_failure() {
                    attempt.failure();
                }
                Err(e)
            }
        }
    }

    /// Deliver on the runtime. The handle may be awaited or dropped.
    pub fn dispatch(
        &self,
        callback: OutboundCallback,
    ) -> JoinHandle<Result<DeliveryOutcome, DeliveryError>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.deliver(callback).await })
    }

    /// Fire-and-forget delivery with failures logged. Inline when
    /// `sync_callbacks` is set, otherwise spawned and the handle returned.
    pub async fn notify(&self, callback: OutboundCallback) -> Option<JoinHandle<()>> {
        if self.config.sync_callbacks {
            log_outcome(&callback, self.deliver(callback.clone()).await);
            return None;
        }

        let manager = self.clone();
        Some(tokio::spawn(async move {
            let result = manager.deliver(callback.clone()).await;
            log_outcome(&callback, result);
        }))
    }
}

fn log_outcome(callback: &OutboundCallback, result: Result<DeliveryOutcome, DeliveryError>) {
    match result {
        Ok(DeliveryOutcome::Delivered { .. }) => {}
        Ok(DeliveryOutcome::Backpressure { status }) => tracing::warn!(
            destination = %callback.destination,
            sequence = callback.message.sequence,
            status,
            "callback dropped under backpressure"
        ),
        Err(e) => tracing::warn!(
            destination = %callback.destination,
            sequence = callback.message.sequence,
            error = %e,
            "callback delivery failed"
        ),
    }
}
