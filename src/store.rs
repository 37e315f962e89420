//! Arena of mutable records keyed by opaque ids.
//!
//! Every key owns its own lock, so writers to different bundles or refills
//! never contend. The index lock is only held long enough to find or insert
//! a slot.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

pub struct KeyedStore<K, V> {
    slots: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> Default for KeyedStore<K, V> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

fn lock<V>(slot: &Mutex<V>) -> MutexGuard<'_, V> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).cloned()
    }

    fn slot_or_insert(&self, key: &K, init: impl FnOnce() -> V) -> Arc<Mutex<V>> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    /// Run `f` with exclusive access to the record under `key`, creating it
    /// with `init` first if it does not exist yet.
    pub fn with_entry<R>(
        &self,
        key: &K,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let slot = self.slot_or_insert(key, init);
        let mut guard = lock(&slot);
        f(&mut guard)
    }

    /// Exclusive access to an existing record; `None` when the key is unknown.
    pub fn with_existing<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let slot = self.slot(key)?;
        let mut guard = lock(&slot);
        Some(f(&mut guard))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slot(key).is_some()
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<K> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        self.with_existing(key, |value| value.clone())
    }

    /// Clone of every record. Each slot is locked one at a time.
    pub fn values(&self) -> Vec<V> {
        let slots: Vec<Arc<Mutex<V>>> = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots.values().cloned().collect()
        };
        slots.iter().map(|slot| lock(slot).clone()).collect()
    }
}
