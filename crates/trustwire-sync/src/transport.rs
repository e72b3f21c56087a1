//! Transport abstraction for outbound callbacks.
//!
//! The transport layer posts one encoded callback and reports the peer's
//! status code. Retry, backpressure and circuit decisions live above it in
//! [`DeliveryManager`](crate::delivery::DeliveryManager).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::messages::CallbackMessage;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Posts callbacks to peers.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    /// POST `message` to `url` with `secret` as bearer token. Returns the
    /// response status; any status is `Ok`, classification is the caller's.
    async fn post(
        &self,
        url: &str,
        secret: &str,
        message: &CallbackMessage,
        timeout: Duration,
    ) -> Result<u16>;
}

/// Receives callbacks addressed to one node.
///
/// The in-memory transport routes to this; an HTTP server adapter would too.
#[async_trait]
pub trait CallbackEndpoint: Send + Sync {
    /// Handle a POST to `path` (relative to the node's base URI). Returns the
    /// status code to answer with.
    async fn receive(&self, path: &str, secret: &str, body: &[u8]) -> u16;
}

/// HTTP transport backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxy, TLS roots, connection pool).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallbackTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        secret: &str,
        message: &CallbackMessage,
        timeout: Duration,
    ) -> Result<u16> {
        let response = self
            .client
            .post(url)
            .bearer_auth(secret)
            .json(message)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DeliveryError::Timeout(err.to_string())
                } else {
                    DeliveryError::Transport(err.to_string())
                }
            })?;
        Ok(response.status().as_u16())
    }
}

/// In-memory transport for tests and embedded deployments.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::RwLock;

    /// One callback as observed by the network.
    #[derive(Debug, Clone, PartialEq)]
    pub struct SentCallback {
        pub url: String,
        pub secret: String,
        pub message: CallbackMessage,
        /// `None` when the post never reached an endpoint.
        pub status: Option<u16>,
    }

    #[derive(Default)]
    struct Network {
        endpoints: RwLock<HashMap<String, Arc<dyn CallbackEndpoint>>>,
        offline: RwLock<HashSet<String>>,
        forced: RwLock<HashMap<String, u16>>,
        sent: Mutex<Vec<SentCallback>>,
    }

    /// Routes callbacks to registered endpoints by base URI.
    ///
    /// Clones share the same network.
    #[derive(Clone, Default)]
    pub struct MemoryTransport {
        network: Arc<Network>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Attach an endpoint at `base_uri`.
        pub async fn register(&self, base_uri: &str, endpoint: Arc<dyn CallbackEndpoint>) {
            self.network
                .endpoints
                .write()
                .await
                .insert(base_uri.trim_end_matches('/').to_string(), endpoint);
        }

        /// Detach an endpoint.
        pub async fn unregister(&self, base_uri: &str) {
            self.network
                .endpoints
                .write()
                .await
                .remove(base_uri.trim_end_matches('/'));
        }

        /// Make posts under `base_uri` fail with a connection error.
        pub async fn set_offline(&self, base_uri: &str, offline: bool) {
            let base = base_uri.trim_end_matches('/').to_string();
            let mut set = self.network.offline.write().await;
            if offline {
                set.insert(base);
            } else {
                set.remove(&base);
            }
        }

        /// Answer every post under `base_uri` with `status`, whether or not an
        /// endpoint is registered there. `None` restores routing.
        pub async fn respond_with(&self, base_uri: &str, status: Option<u16>) {
            let base = base_uri.trim_end_matches('/').to_string();
            let mut forced = self.network.forced.write().await;
            match status {
                Some(status) => forced.insert(base, status),
                None => forced.remove(&base),
            };
        }

        /// Everything posted so far, in order.
        pub fn sent(&self) -> Vec<SentCallback> {
            self.network
                .sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Forget the sent log.
        pub fn clear_sent(&self) {
            self.network
                .sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        fn record(&self, url: &str, secret: &str, message: &CallbackMessage, status: Option<u16>) {
            self.network
                .sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(SentCallback {
                    url: url.to_string(),
                    secret: secret.to_string(),
                    message: message.clone(),
                    status,
                });
        }

        async fn route(&self, url: &str) -> Option<(String, String)> {
            let endpoints = self.network.endpoints.read().await;
            longest_base(endpoints.keys(), url).map(|base| (base.clone(), url[base.len()..].to_string()))
        }
    }

    fn under_base(url: &str, base: &str) -> bool {
        url.strip_prefix(base)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    fn longest_base<'a>(bases: impl Iterator<Item = &'a String>, url: &str) -> Option<&'a String> {
        bases
            .filter(|base| under_base(url, base))
            .max_by_key(|base| base.len())
    }

    #[async_trait]
    impl CallbackTransport for MemoryTransport {
        async fn post(
            &self,
            url: &str,
            secret: &str,
            message: &CallbackMessage,
            timeout: Duration,
        ) -> Result<u16> {
            let offline = {
                let offline = self.network.offline.read().await;
                longest_base(offline.iter(), url).cloned()
            };
            if let Some(base) = offline {
                self.record(url, secret, message, None);
                return Err(DeliveryError::Transport(format!("connection refused: {base}")));
            }

            let forced = {
                let forced = self.network.forced.read().await;
                longest_base(forced.keys(), url).and_then(|base| forced.get(base).copied())
            };
            if let Some(status) = forced {
                self.record(url, secret, message, Some(status));
                return Ok(status);
            }

            let Some((base, path)) = self.route(url).await else {
                self.record(url, secret, message, None);
                return Err(DeliveryError::Transport(format!("no route to {url}")));
            };
            let body =
                serde_json::to_vec(message).map_err(|e| DeliveryError::Serialization(e.to_string()))?;
            let endpoint = self.network.endpoints.read().await.get(&base).cloned();
            let Some(endpoint) = endpoint else {
                self.record(url, secret, message, None);
                return Err(DeliveryError::Transport(format!("no route to {url}")));
            };

            match tokio::time::timeout(timeout, endpoint.receive(&path, secret, &body)).await {
                Ok(status) => {
                    self.record(url, secret, message, Some(status));
                    Ok(status)
                }
                Err(_) => {
                    self.record(url, secret, message, None);
                    Err(DeliveryError::Timeout(format!("{url} after {timeout:?}")))
                }
            }
        }
    }
}

pub use memory::{MemoryTransport, SentCallback};
