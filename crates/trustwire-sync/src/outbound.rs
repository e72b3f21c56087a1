//! Publisher-side sequence numbers.
//!
//! One counter per `(actor, peer, subscription)`, advanced through the
//! store's compare-and-swap so concurrent publishers never hand out the same
//! number twice.

use std::sync::Arc;

use trustwire_core::{ActorId, SubscriptionId};
use trustwire_store::{AttrKey, AttributeStore, StoreExt};

use crate::error::Result;

/// Bucket holding outbound counters.
pub const OUTBOUND_SEQUENCE_BUCKET: &str = "_outbound_sequence";

/// Allocates outbound callback sequence numbers.
#[derive(Clone)]
pub struct OutboundSequencer {
    store: Arc<dyn AttributeStore>,
    first_sequence: u64,
}

impl OutboundSequencer {
    pub fn new(store: Arc<dyn AttributeStore>, first_sequence: u64) -> Self {
        Self {
            store,
            first_sequence,
        }
    }

    fn key(actor_id: &ActorId, peer_id: &ActorId, subscription_id: &SubscriptionId) -> AttrKey {
        AttrKey::new(
            actor_id.as_str(),
            OUTBOUND_SEQUENCE_BUCKET,
            format!("{}:{}", peer_id, subscription_id),
        )
    }

    /// Allocate the next sequence number.
    pub async fn next(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
    ) -> Result<u64> {
        let count = self
            .store
            .increment_counter(&Self::key(actor_id, peer_id, subscription_id))
            .await?;
        let sequence = self.first_sequence + count - 1;
        tracing::debug!(
            actor_id = %actor_id,
            peer_id = %peer_id,
            subscription_id = %subscription_id,
            sequence,
            "allocated outbound sequence"
        );
        Ok(sequence)
    }

    /// The most recently allocated sequence, if any.
    pub async fn current(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<u64>> {
        let count: Option<u64> = self
            .store
            .get_typed(&Self::key(actor_id, peer_id, subscription_id))
            .await?;
        Ok(count
            .filter(|c| *c > 0)
            .map(|c| self.first_sequence + c - 1))
    }

    /// Restart numbering at `first_sequence`.
    pub async fn reset(
        &self,
        actor_id: &ActorId,
        peer_id: &ActorId,
        subscription_id: &SubscriptionId,
    ) -> Result<bool> {
        Ok(self
            .store
            .delete_attr(&Self::key(actor_id, peer_id, subscription_id))
            .await?)
    }

    /// Drop every counter kept for `peer_id`. Returns how many were removed.
    pub async fn clear_peer(&self, actor_id: &ActorId, peer_id: &ActorId) -> Result<usize> {
        let prefix = format!("{}:", peer_id);
        let names: Vec<String> = self
            .store
            .list_bucket(actor_id.as_str(), OUTBOUND_SEQUENCE_BUCKET)
            .await?
            .into_keys()
            .filter(|name| name.starts_with(&prefix))
            .collect();

        let mut removed = 0;
        for name in names {
            let key = AttrKey::new(actor_id.as_str(), OUTBOUND_SEQUENCE_BUCKET, name);
            if self.store.delete_attr(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use trustwire_store::{MemoryStore, SqliteStore};

    fn ids() -> (ActorId, ActorId, SubscriptionId) {
        (
            ActorId::from("alice"),
            ActorId::from("bob"),
            SubscriptionId::new("sub1"),
        )
    }

    #[tokio::test]
    async fn test_sequence_starts_at_first() {
        let seq = OutboundSequencer::new(Arc::new(MemoryStore::new()), 1);
        let (a, b, s) = ids();

        assert_eq!(seq.current(&a, &b, &s).await.unwrap(), None);
        assert_eq!(seq.next(&a, &b, &s).await.unwrap(), 1);
        assert_eq!(seq.next(&a, &b, &s).await.unwrap(), 2);
        assert_eq!(seq.current(&a, &b, &s).await.unwrap(), Some(2));

        let other = SubscriptionId::new("sub2");
        assert_eq!(seq.next(&a, &b, &other).await.unwrap(), 1);

        assert!(seq.reset(&a, &b, &s).await.unwrap());
        assert_eq!(seq.next(&a, &b, &s).await.unwrap(), 1);

        let carol = ActorId::from("carol");
        seq.next(&a, &carol, &s).await.unwrap();
        assert_eq!(seq.clear_peer(&a, &b).await.unwrap(), 2);
        assert_eq!(seq.current(&a, &b, &other).await.unwrap(), None);
        assert_eq!(seq.current(&a, &carol, &s).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_custom_first_sequence() {
        let seq = OutboundSequencer::new(Arc::new(MemoryStore::new()), 0);
        let (a, b, s) = ids();
        assert_eq!(seq.next(&a, &b, &s).await.unwrap(), 0);
        assert_eq!(seq.next(&a, &b, &s).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocation_is_unique() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let seq = OutboundSequencer::new(store, 1);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let seq = seq.clone();
            tasks.push(tokio::spawn(async move {
                let (a, b, s) = ids();
                let mut got = Vec::new();
                for _ in 0..5 {
                    got.push(seq.next(&a, &b, &s).await.unwrap());
                }
                got
            }));
        }

        let mut all = HashSet::new();
        for t in tasks {
            for n in t.await.unwrap() {
                assert!(all.insert(n), "sequence {n} allocated twice");
            }
        }
        assert_eq!(all, (1..=20).collect::<HashSet<u64>>());
    }
}
