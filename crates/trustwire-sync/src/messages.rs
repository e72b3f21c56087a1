//! Callback wire messages.
//!
//! A callback is a JSON object POSTed by a publisher to a subscriber:
//!
//! ```text
//! { "sequence": 7, "type": "diff", "data": {...}, "subscriptionid": "sub1",
//!   "granularity": "high", "url": "...", "timestamp": 1700000000000 }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trustwire_core::{ActorId, SubscriptionId};

use crate::error::SyncError;

/// What a callback carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackKind {
    /// Incremental change.
    Diff,
    /// Authoritative full state.
    Resync,
    /// The sender's grants to us changed.
    Permission,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallbackKind::Diff => "diff",
            CallbackKind::Resync => "resync",
            CallbackKind::Permission => "permission",
        })
    }
}

/// Whether the payload is inline or must be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// `data` carries the diff.
    High,
    /// No `data`; fetch from `url`.
    Low,
}

/// Which endpoint family a callback is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackTarget {
    Subscriptions,
    Permissions,
}

impl CallbackTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackTarget::Subscriptions => "subscriptions",
            CallbackTarget::Permissions => "permissions",
        }
    }

    /// Parse a path segment.
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "subscriptions" => Some(CallbackTarget::Subscriptions),
            "permissions" => Some(CallbackTarget::Permissions),
            _ => None,
        }
    }
}

impl fmt::Display for CallbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback message as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackMessage {
    pub sequence: u64,
    #[serde(rename = "type")]
    pub kind: CallbackKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(
        rename = "subscriptionid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub subscription_id: Option<SubscriptionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl CallbackMessage {
    /// A high-granularity message carrying `data`.
    pub fn new(sequence: u64, kind: CallbackKind, data: Value) -> Self {
        Self {
            sequence,
            kind,
            data: Some(data),
            subscription_id: None,
            granularity: None,
            url: None,
            timestamp: None,
        }
    }

    /// Builder: address a subscription.
    pub fn for_subscription(mut self, subscription_id: SubscriptionId) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    /// Builder: stamp with a send time.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Decode from a request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(body).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    /// Size of the serialized `data` field in bytes.
    pub fn data_len(&self) -> usize {
        self.data
            .as_ref()
            .and_then(|d| serde_json::to_vec(d).ok())
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Replace the inline payload with a reference to fetch it from.
    pub fn downgrade(&mut self, url: Option<String>) {
        self.data = None;
        self.granularity = Some(Granularity::Low);
        self.url = url;
    }

    /// The payload handed to callback handlers: `data`, or `null` when the
    /// message carries none.
    pub fn payload(&self) -> Value {
        self.data.clone().unwrap_or(Value::Null)
    }
}

/// Build the URL of a peer's callback endpoint.
///
/// `{base_uri}/callbacks/{target}/{sender}[/{subscription}]`
pub fn callback_url(
    base_uri: &str,
    target: CallbackTarget,
    sender: &ActorId,
    subscription_id: Option<&SubscriptionId>,
) -> String {
    let mut url = format!(
        "{}/callbacks/{}/{}",
        base_uri.trim_end_matches('/'),
        target,
        sender
    );
    if let Some(sub) = subscription_id {
        url.push('/');
        url.push_str(sub.as_str());
    }
    url
}
