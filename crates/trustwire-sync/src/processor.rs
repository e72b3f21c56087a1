//! Inbound callback sequencing.
//!
//! Turns at-least-once, unordered callback delivery into an ordered,
//! exactly-once-applied stream per `(peer, subscription)`.
//!
//! ## State Machine
//!
//! For each key the processor persists the last applied sequence and a
//! bounded buffer of callbacks that arrived early:
//!
//! ```text
//! seq <  expected  -> Duplicate        (handler not called)
//! seq == expected  -> Processed        (apply, then flush contiguous buffer)
//! seq >  expected  -> Pending          (buffered)
//!                  -> PendingRejected  (buffer full, entry discarded)
//! oldest buffered entry past gap timeout
//!                  -> ResyncTriggered  (buffer dropped, expected kept)
//! ```
//!
//! Resync callbacks carry authoritative state and are applied regardless of
//! any gap. All state writes go through compare-and-swap while holding a
//! per-key async lock, so keys never block each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trustwire_core::{now_millis, ActorId, SubscriptionId};
use trustwire_store::{AttrKey, AttributeStore};

use crate::error::{Result, SyncError};
use crate::messages::CallbackKind;

/// Bucket holding per-subscription sequencing state.
pub const CALLBACK_STATE_BUCKET: &str = "_callback_state";

/// Sequencing configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How long the oldest buffered callback may wait for the gap to fill.
    pub gap_timeout: Duration,
    /// Maximum buffered callbacks per subscription.
    pub max_pending: usize,
    /// Sequence number expected on first contact.
    pub first_sequence: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            gap_timeout: Duration::from_secs(30),
            max_pending: 100,
            first_sequence: 1,
        }
    }
}

/// Outcome of processing one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// Applied, together with any buffered callbacks it unblocked.
    Processed { applied: Vec<u64> },
    /// Already applied earlier.
    Duplicate,
    /// Buffered until the gap before it fills.
    Pending,
    /// Buffer full; the callback was discarded.
    PendingRejected,
    /// The gap could not be filled in time; buffered callbacks were dropped
    /// and the caller must re-fetch authoritative state.
    ResyncTriggered,
}

impl ProcessResult {
    /// Whether the sender should consider the callback accepted.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ProcessResult::PendingRejected)
    }
}

/// One callback as seen by handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub peer_id: ActorId,
    pub subscription_id: SubscriptionId,
    pub sequence: u64,
    pub kind: CallbackKind,
    pub payload: Value,
}

/// Applies callbacks to application state.
///
/// Called at most once per sequence number, in increasing order. An error
/// leaves the sequence unapplied so a redelivery will call it again.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn handle(&self, event: &CallbackEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> CallbackHandler for F
where
    F: Fn(CallbackEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &CallbackEvent) -> anyhow::Result<()> {
        (self)(event.clone()).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PendingCallback {
    sequence: u64,
    kind: CallbackKind,
    #[serde(default)]
    payload: Value,
    arrived_at: i64,
}

/// Persisted sequencing state for one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub peer_id: ActorId,
    pub subscription_id: SubscriptionId,
    /// Last applied sequence. `None` before first contact.
    #[serde(default)]
    pub last_sequence: Option<u64>,
    #[serde(default)]
    pending: Vec<PendingCallback>,
}

impl SubscriptionState {
    fn new(peer_id: ActorId, subscription_id: SubscriptionId) -> Self {
        Self {
            peer_id,
            subscription_id,
            last_sequence: None,
            pending: Vec::new(),
        }
    }

    /// Next sequence to apply.
    pub fn expected(&self, first_sequence: u64) -> u64 {
        self.last_sequence
            .map(|last| last + 1)
            .unwrap_or(first_sequence)
    }

    /// Sequences currently buffered, ascending.
    pub fn pending_sequences(&self) -> Vec<u64> {
        self.pending.iter().map(|p| p.sequence).collect()
    }

    fn oldest_arrival(&self) -> Option<i64> {
        self.pending.iter().map(|p| p.arrived_at).min()
    }

    fn gap_expired(&self, now: i64, timeout_ms: i64) -> bool {
        self.oldest_arrival()
            .is_some_and(|oldest| now.saturating_sub(oldest) > timeout_ms)
    }
}

fn state_name(peer_id: &ActorId, subscription_id: &SubscriptionId) -> String {
    format!("{}:{}", peer_id, subscription_id)
}

/// Sequencing state machine for one receiving actor.
pub struct CallbackProcessor {
    actor_id: ActorId,
    store: Arc<dyn AttributeStore>,
    config: ProcessorConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CallbackProcessor {
    pub fn new(actor_id: ActorId, store: Arc<dyn AttributeStore>, config: ProcessorConfig) -> Self {
        Self {
            actor_id,
            store,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn key_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    // Drops the map entry once nobody else holds or waits on the lock.
    // Clones are only handed out under the map lock, so a count of two
    // (the map and `lock`) means no other task can be using it.
    fn release_key_lock(&self, name: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = locks
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2);
        if unused {
            locks.remove(name);
        }
    }

    fn state_key(&self, name: &str) -> AttrKey {
        AttrKey::new(self.actor_id.as_str(), CALLBACK_STATE_BUCKET, name)
    }

    fn gap_timeout_ms(&self) -> i64 {
        self.config.gap_timeout.as_millis().min(i64::MAX as u128) as i64
    }

    async fn load(
        &self,
        key: &AttrKey,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
    ) -> Result<(Option<Value>, SubscriptionState)> {
        let raw = self.store.get_attr(key).await?;
        let state = match &raw {
            Some(value) => serde_json::from_value(value.clone())?,
            None => SubscriptionState::new(peer_id.clone(), subscription_id.clone()),
        };
        Ok((raw, state))
    }

    async fn save(&self, key: &AttrKey, old: Option<&Value>, state: &SubscriptionState) -> Result<()> {
        let new = serde_json::to_value(state)?;
        if self.store.conditional_update_attr(key, old, new).await? {
            Ok(())
        } else {
            Err(SyncError::StateConflict {
                peer_id: state.peer_id.to_string(),
                subscription_id: state.subscription_id.to_string(),
            })
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Processing
    // ─────────────────────────────────────────────────────────────────────────

    /// Process one inbound callback.
    pub async fn process_callback(
        &self,
        event: CallbackEvent,
        handler: &dyn CallbackHandler,
    ) -> Result<ProcessResult> {
        self.process_callback_at(event, handler, now_millis()).await
    }

    /// [`CallbackProcessor::process_callback`] with an explicit clock (Unix ms).
    pub async fn process_callback_at(
        &self,
        event: CallbackEvent,
        handler: &dyn CallbackHandler,
        now: i64,
    ) -> Result<ProcessResult> {
        let name = state_name(&event.peer_id, &event.subscription_id);
        let lock = self.key_lock(&name);
        let _guard = lock.lock().await;

        let key = self.state_key(&name);
        let (raw, mut state) = self.load(&key, &event.peer_id, &event.subscription_id).await?;
        let expected = state.expected(self.config.first_sequence);

        if event.kind == CallbackKind::Resync {
            if event.sequence < expected {
                return Ok(ProcessResult::Duplicate);
            }
            handler.handle(&event).await.map_err(SyncError::Handler)?;

            let dropped = state.pending.len();
            state.last_sequence = Some(event.sequence);
            state.pending.clear();
            self.save(&key, raw.as_ref(), &state).await?;

            tracing::info!(
                peer_id = %event.peer_id,
                subscription_id = %event.subscription_id,
                sequence = event.sequence,
                dropped,
                "applied resync callback"
            );
            return Ok(ProcessResult::Processed {
                applied: vec![event.sequence],
            });
        }

        if state.gap_expired(now, self.gap_timeout_ms()) {
            let dropped = state.pending.len();
            state.pending.clear();
            self.save(&key, raw.as_ref(), &state).await?;

            tracing::warn!(
                peer_id = %event.peer_id,
                subscription_id = %event.subscription_id,
                expected,
                dropped,
                "gap not filled in time, resync required"
            );
            return Ok(ProcessResult::ResyncTriggered);
        }

        if event.sequence < expected {
            tracing::debug!(
                peer_id = %event.peer_id,
                subscription_id = %event.subscription_id,
                sequence = event.sequence,
                "duplicate callback"
            );
            return Ok(ProcessResult::Duplicate);
        }

        if event.sequence > expected {
            if state.pending.iter().any(|p| p.sequence == event.sequence) {
                return Ok(ProcessResult::Pending);
            }
            if state.pending.len() >= self.config.max_pending {
                tracing::warn!(
                    peer_id = %event.peer_id,
                    subscription_id = %event.subscription_id,
                    sequence = event.sequence,
                    max_pending = self.config.max_pending,
                    "pending buffer full, rejecting callback"
                );
                return Ok(ProcessResult::PendingRejected);
            }

            let at = state
                .pending
                .partition_point(|p| p.sequence < event.sequence);
            state.pending.insert(
                at,
                PendingCallback {
                    sequence: event.sequence,
                    kind: event.kind,
                    payload: event.payload,
                    arrived_at: now,
                },
            );
            self.save(&key, raw.as_ref(), &state).await?;

            tracing::debug!(
                peer_id = %event.peer_id,
                subscription_id = %event.subscription_id,
                sequence = event.sequence,
                expected,
                "buffered out-of-order callback"
            );
            return Ok(ProcessResult::Pending);
        }

        handler.handle(&event).await.map_err(SyncError::Handler)?;
        state.last_sequence = Some(event.sequence);
        let mut applied = vec![event.sequence];

        let applied_to = event.sequence;
        state.pending.retain(|p| p.sequence > applied_to);
        while state
            .pending
            .first()
            .is_some_and(|p| Some(p.sequence) == state.last_sequence.map(|l| l + 1))
        {
            let next = state.pending.remove(0);
            let buffered = CallbackEvent {
                peer_id: event.peer_id.clone(),
                subscription_id: event.subscription_id.clone(),
                sequence: next.sequence,
                kind: next.kind,
                payload: next.payload,
            };

            if let Err(e) = handler.handle(&buffered).await {
                // Keep it buffered; what was applied so far stays applied.
                tracing::warn!(
                    peer_id = %event.peer_id,
                    subscription_id = %event.subscription_id,
                    sequence = buffered.sequence,
                    error = %e,
                    "handler failed while flushing buffered callback"
                );
                state.pending.insert(
                    0,
                    PendingCallback {
                        sequence: buffered.sequence,
                        kind: buffered.kind,
                        payload: buffered.payload,
                        arrived_at: next.arrived_at,
                    },
                );
                break;
            }

            state.last_sequence = Some(buffered.sequence);
            applied.push(buffered.sequence);
        }

        self.save(&key, raw.as_ref(), &state).await?;
        tracing::debug!(
            peer_id = %event.peer_id,
            subscription_id = %event.subscription_id,
            ?applied,
            "applied callbacks"
        );
        Ok(ProcessResult::Processed { applied })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State Management
    // ─────────────────────────────────────────────────────────────────────────

    /// After re-fetching authoritative state at `sequence`, continue from
    /// `sequence + 1` with an empty buffer.
    pub async fn reset_after_resync(
        &self,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
        sequence: u64,
    ) -> Result<()> {
        let name = state_name(peer_id, subscription_id);
        let lock = self.key_lock(&name);
        let _guard = lock.lock().await;

        let key = self.state_key(&name);
        let (raw, mut state) = self.load(&key, peer_id, subscription_id).await?;
        state.last_sequence = Some(sequence);
        state.pending.clear();
        self.save(&key, raw.as_ref(), &state).await?;

        tracing::info!(peer_id = %peer_id, subscription_id = %subscription_id, sequence, "sequencing reset after resync");
        Ok(())
    }

    /// Current state of a subscription, if any.
    pub async fn state(
        &self,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<SubscriptionState>> {
        let key = self.state_key(&state_name(peer_id, subscription_id));
        match self.store.get_attr(&key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Next sequence that will be applied.
    pub async fn expected_sequence(
        &self,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
    ) -> Result<u64> {
        Ok(self
            .state(peer_id, subscription_id)
            .await?
            .map(|s| s.expected(self.config.first_sequence))
            .unwrap_or(self.config.first_sequence))
    }

    /// Forget one subscription's state. Returns whether any existed.
    pub async fn clear_state(&self, peer_id: &ActorId, subscription_id: &SubscriptionId) -> Result<bool> {
        let name = state_name(peer_id, subscription_id);
        let lock = self.key_lock(&name);
        let removed = {
            let _guard = lock.lock().await;
            self.store.delete_attr(&self.state_key(&name)).await?
        };
        self.release_key_lock(&name, lock);
        Ok(removed)
    }

    /// Forget every subscription tied to `peer_id`. Returns how many were
    /// removed.
    pub async fn clear_all_state_for_peer(&self, peer_id: &ActorId) -> Result<usize> {
        let prefix = format!("{}:", peer_id);
        let bucket = self
            .store
            .list_bucket(self.actor_id.as_str(), CALLBACK_STATE_BUCKET)
            .await?;

        let mut removed = 0;
        for (name, value) in bucket {
            let belongs = match serde_json::from_value::<SubscriptionState>(value) {
                Ok(state) => &state.peer_id == peer_id,
                Err(_) => name.starts_with(&prefix),
            };
            if !belongs {
                continue;
            }

            let lock = self.key_lock(&name);
            let deleted = {
                let _guard = lock.lock().await;
                self.store.delete_attr(&self.state_key(&name)).await?
            };
            self.release_key_lock(&name, lock);
            if deleted {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(peer_id = %peer_id, removed, "cleared callback state for peer");
        }
        Ok(removed)
    }

    /// Subscriptions whose oldest buffered callback is past the gap timeout.
    pub async fn stale_subscriptions(&self) -> Result<Vec<(ActorId, SubscriptionId)>> {
        self.stale_subscriptions_at(now_millis()).await
    }

    /// [`CallbackProcessor::stale_subscriptions`] with an explicit clock.
    pub async fn stale_subscriptions_at(&self, now: i64) -> Result<Vec<(ActorId, SubscriptionId)>> {
        let timeout = self.gap_timeout_ms();
        let bucket = self
            .store
            .list_bucket(self.actor_id.as_str(), CALLBACK_STATE_BUCKET)
            .await?;

        Ok(bucket
            .into_values()
            .filter_map(|v| serde_json::from_value::<SubscriptionState>(v).ok())
            .filter(|s| s.gap_expired(now, timeout))
            .map(|s| (s.peer_id, s.subscription_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use trustwire_store::{MemoryStore, SqliteStore};

    type Log = Arc<Mutex<Vec<u64>>>;

    fn recorder() -> (Log, impl CallbackHandler) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let handler = move |event: CallbackEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.sequence);
                Ok::<(), anyhow::Error>(())
            }
        };
        (log, handler)
    }

    fn processor(config: ProcessorConfig) -> CallbackProcessor {
        CallbackProcessor::new(ActorId::from("alice"), Arc::new(MemoryStore::new()), config)
    }

    fn diff(sequence: u64) -> CallbackEvent {
        event("bob", "sub1", sequence, CallbackKind::Diff)
    }

    fn event(peer: &str, sub: &str, sequence: u64, kind: CallbackKind) -> CallbackEvent {
        CallbackEvent {
            peer_id: ActorId::from(peer),
            subscription_id: SubscriptionId::new(sub),
            sequence,
            kind,
            payload: json!({"seq": sequence}),
        }
    }

    fn bob() -> ActorId {
        ActorId::from("bob")
    }

    fn sub1() -> SubscriptionId {
        SubscriptionId::new("sub1")
    }

    #[tokio::test]
    async fn test_out_of_order_fill() {
        let p = processor(ProcessorConfig::default());
        let (log, handler) = recorder();
        p.reset_after_resync(&bob(), &sub1(), 4).await.unwrap();

        assert_eq!(
            p.process_callback(diff(5), &handler).await.unwrap(),
            ProcessResult::Processed { applied: vec![5] }
        );
        assert_eq!(
            p.process_callback(diff(7), &handler).await.unwrap(),
            ProcessResult::Pending
        );
        assert_eq!(
            p.process_callback(diff(6), &handler).await.unwrap(),
            ProcessResult::Processed { applied: vec![6, 7] }
        );
        assert_eq!(*log.lock().unwrap(), vec![5, 6, 7]);
        assert_eq!(p.expected_sequence(&bob(), &sub1()).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_duplicate_applied_once() {
        let p = processor(ProcessorConfig::default());
        let (log, handler) = recorder();

        assert!(matches!(
            p.process_callback(diff(1), &handler).await.unwrap(),
            ProcessResult::Processed { .. }
        ));
        for _ in 0..3 {
            assert_eq!(
                p.process_callback(diff(1), &handler).await.unwrap(),
                ProcessResult::Duplicate
            );
        }
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_pending_rejected_when_full() {
        let p = processor(ProcessorConfig {
            max_pending: 2,
            ..Default::default()
        });
        let (log, handler) = recorder();

        assert_eq!(p.process_callback(diff(3), &handler).await.unwrap(), ProcessResult::Pending);
        assert_eq!(p.process_callback(diff(4), &handler).await.unwrap(), ProcessResult::Pending);
        assert_eq!(
            p.process_callback(diff(5), &handler).await.unwrap(),
            ProcessResult::PendingRejected
        );
        // Redelivery of a buffered sequence does not grow the buffer.
        assert_eq!(p.process_callback(diff(3), &handler).await.unwrap(), ProcessResult::Pending);

        let state = p.state(&bob(), &sub1()).await.unwrap().unwrap();
        assert_eq!(state.pending_sequences(), vec![3, 4]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gap_timeout_triggers_resync() {
        let p = processor(ProcessorConfig::default());
        let (log, handler) = recorder();
        let t0 = 1_000_000;

        assert_eq!(
            p.process_callback_at(diff(3), &handler, t0).await.unwrap(),
            ProcessResult::Pending
        );
        // Inside the timeout the gap may still fill.
        assert_eq!(
            p.process_callback_at(diff(4), &handler, t0 + 30_000).await.unwrap(),
            ProcessResult::Pending
        );
        assert_eq!(
            p.stale_subscriptions_at(t0 + 31_000).await.unwrap(),
            vec![(bob(), sub1())]
        );
        assert_eq!(
            p.process_callback_at(diff(5), &handler, t0 + 31_000).await.unwrap(),
            ProcessResult::ResyncTriggered
        );

        let state = p.state(&bob(), &sub1()).await.unwrap().unwrap();
        assert!(state.pending_sequences().is_empty());
        assert_eq!(state.expected(1), 1);
        assert!(log.lock().unwrap().is_empty());
        assert!(p.stale_subscriptions_at(t0 + 31_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resync_callback_resets_ordering() {
        let p = processor(ProcessorConfig::default());
        let (log, handler) = recorder();

        p.process_callback(diff(5), &handler).await.unwrap();
        let resync = event("bob", "sub1", 10, CallbackKind::Resync);
        assert_eq!(
            p.process_callback(resync, &handler).await.unwrap(),
            ProcessResult::Processed { applied: vec![10] }
        );
        let state = p.state(&bob(), &sub1()).await.unwrap().unwrap();
        assert_eq!(state.expected(1), 11);
        assert!(state.pending_sequences().is_empty());

        let stale = event("bob", "sub1", 3, CallbackKind::Resync);
        assert_eq!(
            p.process_callback(stale, &handler).await.unwrap(),
            ProcessResult::Duplicate
        );
        assert_eq!(*log.lock().unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn test_handler_error_leaves_expected() {
        let p = processor(ProcessorConfig::default());
        let failing = |_event: CallbackEvent| async { Err::<(), _>(anyhow::anyhow!("disk full")) };

        let err = p.process_callback(diff(1), &failing).await.unwrap_err();
        assert!(matches!(err, SyncError::Handler(_)));
        assert_eq!(p.expected_sequence(&bob(), &sub1()).await.unwrap(), 1);

        let (log, handler) = recorder();
        p.process_callback(diff(1), &handler).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_entry_buffered() {
        let p = processor(ProcessorConfig::default());
        let (_, ok) = recorder();
        p.process_callback(diff(3), &ok).await.unwrap();

        let fail_on_three = |event: CallbackEvent| async move {
            if event.sequence == 3 {
                anyhow::bail!("cannot apply 3");
            }
            Ok::<(), anyhow::Error>(())
        };
        assert_eq!(
            p.process_callback(diff(1), &ok).await.unwrap(),
            ProcessResult::Processed { applied: vec![1] }
        );
        assert_eq!(
            p.process_callback(diff(2), &fail_on_three).await.unwrap(),
            ProcessResult::Processed { applied: vec![2] }
        );
        let state = p.state(&bob(), &sub1()).await.unwrap().unwrap();
        assert_eq!(state.expected(1), 3);
        assert_eq!(state.pending_sequences(), vec![3]);
    }

    #[tokio::test]
    async fn test_keys_are_independent_and_clearable() {
        let p = processor(ProcessorConfig::default());
        let (_, handler) = recorder();

        p.process_callback(event("bob", "a", 1, CallbackKind::Diff), &handler).await.unwrap();
        p.process_callback(event("bob", "b", 1, CallbackKind::Diff), &handler).await.unwrap();
        p.process_callback(event("bob:x", "c", 1, CallbackKind::Diff), &handler).await.unwrap();
        p.process_callback(event("carol", "a", 1, CallbackKind::Diff), &handler).await.unwrap();

        assert_eq!(p.clear_all_state_for_peer(&bob()).await.unwrap(), 2);
        assert!(p.state(&bob(), &SubscriptionId::new("a")).await.unwrap().is_none());
        assert!(p
            .state(&ActorId::from("bob:x"), &SubscriptionId::new("c"))
            .await
            .unwrap()
            .is_some());
        assert_eq!(p.locks.lock().unwrap().len(), 2);
        assert!(p
            .clear_state(&ActorId::from("carol"), &SubscriptionId::new("a"))
            .await
            .unwrap());
        // only bob:x's lock is left
        assert_eq!(p.locks.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_apply_in_order() {
        let p = Arc::new(processor(ProcessorConfig::default()));
        let (log, handler) = recorder();
        let handler = Arc::new(handler);

        let mut order: Vec<u64> = (1..=40).collect();
        order.reverse();
        order.rotate_left(7);

        let mut tasks = Vec::new();
        for seq in order {
            let p = p.clone();
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                p.process_callback(diff(seq), handler.as_ref()).await.unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), (1..=40).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_state_survives_restart_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let (log, handler) = recorder();

        {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let p = CallbackProcessor::new(ActorId::from("alice"), store, ProcessorConfig::default());
            p.process_callback(diff(1), &handler).await.unwrap();
            p.process_callback(diff(3), &handler).await.unwrap();
        }

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let p = CallbackProcessor::new(ActorId::from("alice"), store, ProcessorConfig::default());
        assert_eq!(
            p.process_callback(diff(2), &handler).await.unwrap(),
            ProcessResult::Processed { applied: vec![2, 3] }
        );
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    proptest! {
        #[test]
        fn prop_any_permutation_applies_each_once_in_order(
            order in (1u64..40).prop_flat_map(|n| Just((1..=n).collect::<Vec<u64>>()).prop_shuffle())
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let log = runtime.block_on(async {
                let p = processor(ProcessorConfig::default());
                let (log, handler) = recorder();
                for seq in order.iter().chain(order.iter()) {
                    p.process_callback(diff(*seq), &handler).await.unwrap();
                }
                log
            });

            let applied = log.lock().unwrap().clone();
            let expected: Vec<u64> = (1..=order.len() as u64).collect();
            prop_assert_eq!(applied, expected);
        }
    }
}
