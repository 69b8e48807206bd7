// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The core trait for node-local backing stores.

use std::{fmt::Debug, hash::Hash};

use crate::{Error, FutureUpdate, StoredEntry, Timestamp};

/// Bounds required of cache keys throughout the coherence layer.
///
/// Blanket-implemented for every type that satisfies them.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bounds required of cached values throughout the coherence layer.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Trait for node-local store implementations.
///
/// A store provides per-key linearizability on one node and nothing more; keeping
/// copies on different nodes coherent is the job of the layers above.
///
/// Every method except `len` and `is_empty` is required:
/// - `len`: Returns `None` (not all stores track size)
/// - `is_empty`: Delegates to `len`
pub trait CacheStore<K, V>: Send + Sync {
    /// Gets the entry for `key`, including tombstones.
    fn get(&self, key: &K) -> impl Future<Output = Result<Option<StoredEntry<V>>, Error>> + Send;

    /// Unconditionally writes `entry`.
    fn insert(&self, key: &K, entry: StoredEntry<V>) -> impl Future<Output = Result<(), Error>> + Send;

    /// Writes a value loaded from the database if the slot is free for it.
    ///
    /// Returns `false` without writing when the slot holds anything other than a
    /// tombstone committed before `loaded_at`. See [`StoredEntry::admits_load`].
    fn put_for_external_read(&self, key: &K, value: V, loaded_at: Timestamp) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Writes `update` unless the slot already holds a newer update.
    ///
    /// Returns `true` if the update was written. See [`StoredEntry::yields_to`].
    fn apply_update(&self, key: &K, update: FutureUpdate<V>) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Removes the entry for `key`. Removing an absent key is not an error.
    fn remove(&self, key: &K) -> impl Future<Output = Result<(), Error>> + Send;

    /// Removes every entry.
    fn clear(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Returns the number of entries, if supported.
    fn len(&self) -> Option<u64> {
        None
    }

    /// Returns `true` if the store contains no entries.
    ///
    /// Returns `None` for implementations that don't track size.
    fn is_empty(&self) -> Option<bool> {
        self.len().map(|len| len == 0)
    }
}
