//! Per-key single-flight locks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type KeyLock = Arc<AsyncMutex<()>>;
type Table<K> = Arc<Mutex<HashMap<K, KeyLock>>>;

/// Serializes work per key.
///
/// Callers holding a [`FlightGuard`] for the same key run one at a time;
/// different keys never block each other. Entries are removed once no caller
/// holds or waits on them. Guards own their share of the table, so they can
/// be moved into spawned tasks.
#[derive(Debug)]
pub struct FlightLocks<K> {
    inflight: Table<K>,
}

impl<K> Default for FlightLocks<K> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> FlightLocks<K> {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other caller holds `key`, then hold it.
    pub async fn acquire(&self, key: K) -> FlightGuard<K> {
        let lock = self.entry(&key);
        let guard = Arc::clone(&lock).lock_owned().await;
        self.guard(key, lock, guard)
    }

    /// Hold `key` if nobody else holds it, without waiting.
    ///
    /// Fails while a caller holds the key or is queued behind its holder.
    pub fn try_acquire(&self, key: K) -> Option<FlightGuard<K>> {
        let lock = self.entry(&key);
        match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => Some(self.guard(key, lock, guard)),
            Err(_) => {
                release_entry(&self.inflight, &key, &lock);
                None
            }
        }
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Whether no key is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<K, KeyLock>> {
        lock_table(&self.inflight)
    }

    fn entry(&self, key: &K) -> KeyLock {
        Arc::clone(
            self.table()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn guard(&self, key: K, lock: KeyLock, guard: OwnedMutexGuard<()>) -> FlightGuard<K> {
        FlightGuard {
            table: Arc::clone(&self.inflight),
            key,
            lock,
            guard: Some(guard),
        }
    }
}

fn lock_table<K>(table: &Mutex<HashMap<K, KeyLock>>) -> MutexGuard<'_, HashMap<K, KeyLock>> {
    // The table stays consistent even if a holder panicked.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop the table entry for `key` once only the table and `lock` reference it.
fn release_entry<K: Eq + Hash>(table: &Mutex<HashMap<K, KeyLock>>, key: &K, lock: &KeyLock) {
    let mut map = lock_table(table);
    // Two references left: the table's and the caller's.
    let idle = map
        .get(key)
        .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) <= 2);
    if idle {
        map.remove(key);
    }
}

/// Exclusive hold on one key, released on drop.
#[derive(Debug)]
pub struct FlightGuard<K: Eq + Hash + Clone> {
    table: Table<K>,
    key: K,
    lock: KeyLock,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> FlightGuard<K> {
    /// The held key.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_entry(&self.table, &self.key, &self.lock);
    }
}
