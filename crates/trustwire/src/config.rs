//! Node configuration.
//!
//! Every option has a default, so an empty JSON object is a valid file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trustwire_sync::{CircuitConfig, DeliveryConfig, ProcessorConfig};

use crate::error::{NodeError, Result};

/// Options recognized by a [`Node`](crate::Node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustwireConfig {
    /// How long a gap may stay unfilled before a resync.
    pub gap_timeout_seconds: u64,
    /// Early callbacks buffered per subscription.
    pub max_pending: usize,
    /// Outbound deliveries in flight.
    pub max_concurrent_callbacks: usize,
    /// Largest inline diff, in bytes.
    pub max_payload_for_high_granularity: usize,
    /// Consecutive failures that open a destination's circuit.
    pub circuit_breaker_threshold: u32,
    /// Seconds an open circuit rejects deliveries.
    pub circuit_breaker_cooldown: u64,
    /// Mirror applied callback data into the local store.
    pub auto_storage: bool,
    /// Sequence inbound callbacks. When off they are applied on arrival.
    pub auto_sequence: bool,
    /// Tell peers when the permissions we grant them change.
    pub notify_peer_on_change: bool,
    /// Purge mirrored data a peer stopped granting access to.
    pub auto_delete_on_revocation: bool,
    /// Deliver outbound callbacks inline instead of in the background.
    pub sync_callbacks: bool,
    pub request_timeout_seconds: u64,
    /// Sequence number of the first callback on a subscription.
    pub first_sequence: u64,
}

impl Default for TrustwireConfig {
    fn default() -> Self {
        Self {
            gap_timeout_seconds: 30,
            max_pending: 100,
            max_concurrent_callbacks: 10,
            max_payload_for_high_granularity: 65_536,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: 60,
            auto_storage: true,
            auto_sequence: true,
            notify_peer_on_change: true,
            auto_delete_on_revocation: false,
            sync_callbacks: false,
            request_timeout_seconds: 10,
            first_sequence: 1,
        }
    }
}

impl TrustwireConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| NodeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable the protocol.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.gap_timeout_seconds == 0, "gap_timeout_seconds must be positive"),
            (self.max_pending == 0, "max_pending must be positive"),
            (self.max_concurrent_callbacks == 0, "max_concurrent_callbacks must be positive"),
            (self.circuit_breaker_threshold == 0, "circuit_breaker_threshold must be positive"),
            (self.request_timeout_seconds == 0, "request_timeout_seconds must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(NodeError::Config((*message).to_string())),
            None => Ok(()),
        }
    }

    pub fn gap_timeout(&self) -> Duration {
        Duration::from_secs(self.gap_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            gap_timeout: self.gap_timeout(),
            max_pending: self.max_pending,
            first_sequence: self.first_sequence,
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_concurrent: self.max_concurrent_callbacks,
            max_payload_for_high_granularity: self.max_payload_for_high_granularity,
            request_timeout: self.request_timeout(),
            sync_callbacks: self.sync_callbacks,
            circuit: CircuitConfig {
                threshold: self.circuit_breaker_threshold,
                cooldown: Duration::from_secs(self.circuit_breaker_cooldown),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: TrustwireConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TrustwireConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.processor_config().gap_timeout, Duration::from_secs(30));
        assert_eq!(config.delivery_config().circuit.threshold, 5);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_pending": 5, "auto_delete_on_revocation": true, "unknown_option": 1}}"#
        )
        .unwrap();

        let config = TrustwireConfig::load(file.path()).unwrap();
        assert_eq!(config.max_pending, 5);
        assert!(config.auto_delete_on_revocation);
        assert_eq!(config.gap_timeout_seconds, 30);
    }

    #[test]
    fn test_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_pending": 0}}"#).unwrap();
        assert!(matches!(
            TrustwireConfig::load(file.path()),
            Err(NodeError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_pending": "lots"}}"#).unwrap();
        assert!(matches!(
            TrustwireConfig::load(file.path()),
            Err(NodeError::Config(_))
        ));

        assert!(matches!(
            TrustwireConfig::load("/nonexistent/trustwire.json"),
            Err(NodeError::Io(_))
        ));
    }
}
