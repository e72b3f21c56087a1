//! Read-through cache that never lets a slow fill overwrite a newer write.
//!
//! Every key carries a generation that [`ReadCache::invalidate`] bumps. A
//! reader snapshots the generation before going to the store and
//! [`ReadCache::fill`] only inserts if it is unchanged, so a value loaded
//! before a concurrent write is dropped instead of cached.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

struct Slot<V> {
    generation: u64,
    value: Option<V>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            generation: 0,
            value: None,
        }
    }
}

pub(crate) struct ReadCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash, V: Clone> ReadCache<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Cached value, or the generation to pass to [`ReadCache::fill`].
    pub(crate) fn lookup(&self, key: K) -> Result<V, u64> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key).or_default();
        slot.value.clone().ok_or(slot.generation)
    }

    /// Cache a value loaded at `generation`. Returns whether it was kept.
    pub(crate) fn fill(&self, key: K, generation: u64, value: V) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key).or_default();
        if slot.generation != generation {
            return false;
        }
        slot.value = Some(value);
        true
    }

    /// Drop the value and bump the generation. The slot stays so in-flight
    /// fills can see the bump.
    pub(crate) fn invalidate(&self, key: K) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key).or_default();
        slot.generation += 1;
        slot.value = None;
    }
}
