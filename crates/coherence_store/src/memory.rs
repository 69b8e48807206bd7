// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory store implementation using dashmap.

use std::{
    fmt,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tick::Clock;

use crate::{CacheStore, Error, FutureUpdate, StoredEntry, Timestamp};

/// How long tombstones are kept by [`InMemoryStore::with_tombstone_retention`] callers
/// that have no better figure. Matches the longest a database load may stay pending.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(120);

/// An in-memory store backed by a sharded concurrent map.
///
/// Each operation locks only the shard that owns the key, so the conditional writes
/// are atomic per key without any global lock. Clones share the same entries.
///
/// A tombstone only has to outlive the database loads that started before its commit.
/// A store built with [`with_tombstone_retention`][Self::with_tombstone_retention]
/// drops tombstones older than the retention period, sweeping at most once per period
/// from the write path. A store built with [`new`][Self::new] keeps them until
/// [`purge_tombstones`][Self::purge_tombstones] is called.
///
/// # Examples
///
/// ```
/// use coherence_store::{CacheStore, InMemoryStore, Timestamp};
/// # futures::executor::block_on(async {
///
/// let store = InMemoryStore::<String, i32>::new();
/// let key = "key".to_string();
///
/// assert!(store.put_for_external_read(&key, 42, Timestamp::from_millis(1)).await?);
/// assert!(!store.put_for_external_read(&key, 43, Timestamp::from_millis(2)).await?);
/// assert_eq!(store.get(&key).await?.and_then(|e| e.into_value()), Some(42));
/// # Ok::<(), coherence_store::Error>(())
/// # });
/// ```
pub struct InMemoryStore<K, V> {
    entries: Arc<DashMap<K, StoredEntry<V>>>,
    reaper: Option<Arc<TombstoneReaper>>,
}

#[derive(Debug)]
struct TombstoneReaper {
    clock: Clock,
    retention: Duration,
    next_sweep: AtomicU64,
}

impl TombstoneReaper {
    /// Returns the purge cutoff when a sweep is due and this caller won the race to run it.
    fn due(&self) -> Option<Timestamp> {
        let now = Timestamp::now(&self.clock);
        let deadline = self.next_sweep.load(Ordering::Acquire);
        if now.as_millis() < deadline {
            return None;
        }

        let next = now.saturating_add(self.retention).as_millis();
        self.next_sweep
            .compare_exchange(deadline, next, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| now.saturating_sub(self.retention))
    }
}

impl<K, V> fmt::Debug for InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("len", &self.entries.len())
            .field("tombstone_retention", &self.reaper.as_ref().map(|reaper| reaper.retention))
            .finish()
    }
}

impl<K, V> Clone for InMemoryStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            reaper: self.reaper.clone(),
        }
    }
}

impl<K, V> Default for InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    /// Creates an empty store that keeps tombstones until they are purged explicitly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            reaper: None,
        }
    }

    /// Creates an empty store that drops tombstones committed more than `retention` ago.
    ///
    /// # Examples
    ///
    /// ```
    /// use coherence_store::{DEFAULT_TOMBSTONE_RETENTION, InMemoryStore};
    /// use tick::Clock;
    ///
    /// let store = InMemoryStore::<String, i32>::with_tombstone_retention(
    ///     Clock::new_frozen(),
    ///     DEFAULT_TOMBSTONE_RETENTION,
    /// );
    /// ```
    #[must_use]
    pub fn with_tombstone_retention(clock: Clock, retention: Duration) -> Self {
        let first_sweep = Timestamp::now(&clock).saturating_add(retention).as_millis();
        Self {
            entries: Arc::new(DashMap::new()),
            reaper: Some(Arc::new(TombstoneReaper {
                clock,
                retention,
                next_sweep: AtomicU64::new(first_sweep),
            })),
        }
    }

    /// Removes tombstones committed before `committed_before` and returns how many went.
    ///
    /// Loaded values and updates that carry a value are never removed.
    pub fn purge_tombstones(&self, committed_before: Timestamp) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let expired = matches!(
                entry,
                StoredEntry::Update(update) if update.is_tombstone() && update.commit_timestamp() < committed_before
            );
            removed += usize::from(expired);
            !expired
        });
        removed
    }

    // Must not run while a shard guard is held.
    fn sweep_if_due(&self) {
        if let Some(cutoff) = self.reaper.as_ref().and_then(|reaper| reaper.due()) {
            let _ = self.purge_tombstones(cutoff);
        }
    }

    /// Returns true if the store holds an entry for `key`, tombstones included.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }
}

impl<K, V> CacheStore<K, V> for InMemoryStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Result<Option<StoredEntry<V>>, Error> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, key: &K, entry: StoredEntry<V>) -> Result<(), Error> {
        self.entries.insert(key.clone(), entry);
        Ok(())
    }

    async fn put_for_external_read(&self, key: &K, value: V, loaded_at: Timestamp) -> Result<bool, Error> {
        match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::loaded(value, loaded_at));
                Ok(true)
            }
            Entry::Occupied(mut occupied) if occupied.get().admits_load(loaded_at) => {
                occupied.insert(StoredEntry::loaded(value, loaded_at));
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn apply_update(&self, key: &K, update: FutureUpdate<V>) -> Result<bool, Error> {
        let applied = match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::Update(update));
                true
            }
            Entry::Occupied(mut occupied) if occupied.get().yields_to(&update) => {
                occupied.insert(StoredEntry::Update(update));
                true
            }
            Entry::Occupied(_) => false,
        };

        self.sweep_if_due();
        Ok(applied)
    }

    async fn remove(&self, key: &K) -> Result<(), Error> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.entries.clear();
        Ok(())
    }

    fn len(&self) -> Option<u64> {
        Some(self.entries.len() as u64)
    }
}
