// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock store implementation for testing.
//!
//! This module provides `MockStore`, an in-memory store that records all
//! operations and supports failure injection for testing error paths.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use parking_lot::Mutex;
use recoverable::RecoveryInfo;

use crate::{CacheStore, Error, FutureUpdate, StoredEntry, Timestamp};

/// Recorded store operation with full context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp<K, V> {
    /// A get operation was performed with the given key.
    Get(K),
    /// An unconditional insert was performed.
    Insert {
        /// The key that was written.
        key: K,
        /// The entry that was written.
        entry: StoredEntry<V>,
    },
    /// A conditional cache fill was attempted.
    PutForExternalRead {
        /// The key that was written.
        key: K,
        /// The loaded value.
        value: V,
        /// The load timestamp.
        loaded_at: Timestamp,
    },
    /// A future update was applied.
    ApplyUpdate {
        /// The key that was written.
        key: K,
        /// The update that was offered.
        update: FutureUpdate<V>,
    },
    /// A remove operation was performed with the given key.
    Remove(K),
    /// A clear operation was performed.
    Clear,
}

impl<K, V> StoreOp<K, V> {
    /// Returns the key this operation touched, if any.
    pub fn key(&self) -> Option<&K> {
        match self {
            Self::Get(key) | Self::Remove(key) => Some(key),
            Self::Insert { key, .. } | Self::PutForExternalRead { key, .. } | Self::ApplyUpdate { key, .. } => Some(key),
            Self::Clear => None,
        }
    }
}

type FailPredicate<K, V> = Box<dyn Fn(&StoreOp<K, V>) -> bool + Send + Sync>;

struct FailRule<K, V> {
    predicate: FailPredicate<K, V>,
    recovery: RecoveryInfo,
}

/// A configurable mock store for testing.
///
/// Stores entries in memory with the same conditional-write semantics as
/// [`InMemoryStore`][crate::InMemoryStore], records every operation for later
/// verification, and can be told to fail operations on demand. Clones share state.
///
/// # Failure Injection
///
/// ```
/// use coherence_store::{CacheStore, testing::{MockStore, StoreOp}};
///
/// # futures::executor::block_on(async {
/// let store = MockStore::<String, i32>::new();
///
/// // Fail removes for one key with a transient error
/// store.fail_when(|op| matches!(op, StoreOp::Remove(k) if k == "forbidden"));
/// assert!(store.remove(&"forbidden".to_string()).await.is_err());
/// assert!(store.remove(&"allowed".to_string()).await.is_ok());
/// # });
/// ```
pub struct MockStore<K, V> {
    data: Arc<Mutex<HashMap<K, StoredEntry<V>>>>,
    operations: Arc<Mutex<Vec<StoreOp<K, V>>>>,
    fail_rule: Arc<Mutex<Option<FailRule<K, V>>>>,
}

impl<K, V> std::fmt::Debug for MockStore<K, V>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStore")
            .field("data", &self.data)
            .field("operations", &self.operations)
            .field("fail_rule", &self.fail_rule.lock().is_some())
            .finish()
    }
}

impl<K, V> Clone for MockStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            operations: Arc::clone(&self.operations),
            fail_rule: Arc::clone(&self.fail_rule),
        }
    }
}

impl<K, V> Default for MockStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MockStore<K, V> {
    /// Creates a new empty mock store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            fail_rule: Arc::new(Mutex::new(None)),
        }
    }
}

impl<K, V> MockStore<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Returns the number of entries, tombstones included.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns a copy of the entry for `key` without recording an operation.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<StoredEntry<V>> {
        self.data.lock().get(key).cloned()
    }
}

impl<K, V> MockStore<K, V>
where
    K: Clone,
    V: Clone,
{
    /// Fails matching operations with a transient error.
    ///
    /// Replaces any previously configured rule.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp<K, V>) -> bool + Send + Sync + 'static,
    {
        self.set_rule(RecoveryInfo::retry(), predicate);
    }

    /// Fails matching operations with an error that must not be retried.
    ///
    /// Replaces any previously configured rule.
    pub fn fail_permanently_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp<K, V>) -> bool + Send + Sync + 'static,
    {
        self.set_rule(RecoveryInfo::never(), predicate);
    }

    /// Fails matching operations with an error classified as `recovery`.
    ///
    /// Replaces any previously configured rule.
    pub fn fail_with<F>(&self, recovery: RecoveryInfo, predicate: F)
    where
        F: Fn(&StoreOp<K, V>) -> bool + Send + Sync + 'static,
    {
        self.set_rule(recovery, predicate);
    }

    /// Clears the failure rule, allowing all operations to succeed.
    pub fn clear_failures(&self) {
        *self.fail_rule.lock() = None;
    }

    /// Returns a clone of all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp<K, V>> {
        self.operations.lock().clone()
    }

    /// Clears all recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().clear();
    }

    fn set_rule<F>(&self, recovery: RecoveryInfo, predicate: F)
    where
        F: Fn(&StoreOp<K, V>) -> bool + Send + Sync + 'static,
    {
        *self.fail_rule.lock() = Some(FailRule {
            predicate: Box::new(predicate),
            recovery,
        });
    }

    /// Records `op` and returns the injected error if the rule matches it.
    fn check(&self, op: StoreOp<K, V>, name: &'static str) -> Result<(), Error> {
        let failure = self
            .fail_rule
            .lock()
            .as_ref()
            .and_then(|rule| (rule.predicate)(&op).then(|| rule.recovery.clone()));
        self.operations.lock().push(op);
        match failure {
            Some(recovery) => Err(Error::with_recovery(recovery, format!("mock: {name} failed"))),
            None => Ok(()),
        }
    }
}

impl<K, V> CacheStore<K, V> for MockStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Result<Option<StoredEntry<V>>, Error> {
        self.check(StoreOp::Get(key.clone()), "get")?;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn insert(&self, key: &K, entry: StoredEntry<V>) -> Result<(), Error> {
        self.check(
            StoreOp::Insert {
                key: key.clone(),
                entry: entry.clone(),
            },
            "insert",
        )?;
        self.data.lock().insert(key.clone(), entry);
        Ok(())
    }

    async fn put_for_external_read(&self, key: &K, value: V, loaded_at: Timestamp) -> Result<bool, Error> {
        self.check(
            StoreOp::PutForExternalRead {
                key: key.clone(),
                value: value.clone(),
                loaded_at,
            },
            "put_for_external_read",
        )?;
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|entry| !entry.admits_load(loaded_at)) {
            return Ok(false);
        }
        data.insert(key.clone(), StoredEntry::loaded(value, loaded_at));
        Ok(true)
    }

    async fn apply_update(&self, key: &K, update: FutureUpdate<V>) -> Result<bool, Error> {
        self.check(
            StoreOp::ApplyUpdate {
                key: key.clone(),
                update: update.clone(),
            },
            "apply_update",
        )?;
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|entry| !entry.yields_to(&update)) {
            return Ok(false);
        }
        data.insert(key.clone(), StoredEntry::Update(update));
        Ok(true)
    }

    async fn remove(&self, key: &K) -> Result<(), Error> {
        self.check(StoreOp::Remove(key.clone()), "remove")?;
        self.data.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.check(StoreOp::Clear, "clear")?;
        self.data.lock().clear();
        Ok(())
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.lock().len() as u64)
    }
}
