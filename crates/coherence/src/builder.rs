// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for the access delegates.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use coherence_cluster::ClusterTransport;
use coherence_store::{CacheKey, CacheStore, CacheValue, Error};
use tokio::runtime::Handle;

use crate::runtime::Runtime;
use crate::{CacheAccessDelegate, RegionHandle, TransactionalAccessDelegate};

impl CacheAccessDelegate<(), (), (), ()> {
    /// Creates a builder for a delegate serving `region`.
    ///
    /// A store and a transport must be set before the delegate can be built.
    ///
    /// # Examples
    ///
    /// ```
    /// use coherence::{CacheAccessDelegate, CoherenceConfig, RegionRegistry};
    /// use coherence_cluster::LocalCluster;
    /// use coherence_store::InMemoryStore;
    /// use tick::Clock;
    ///
    /// let regions = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
    /// let cluster = LocalCluster::new();
    /// let cache = CacheAccessDelegate::builder::<String, i32>(regions.acquire("orders"))
    ///     .store(InMemoryStore::new())
    ///     .transport(cluster.join())
    ///     .build();
    /// assert_eq!(cache.region().name(), "orders");
    /// ```
    #[must_use]
    pub fn builder<K, V>(region: RegionHandle) -> AccessDelegateBuilder<K, V> {
        AccessDelegateBuilder::new(region)
    }
}

/// Builder for [`CacheAccessDelegate`] and [`TransactionalAccessDelegate`].
///
/// Created by [`CacheAccessDelegate::builder`]. Building attaches the delegate's
/// [`RemoteInvalidationHandler`](crate::RemoteInvalidationHandler) to the transport.
pub struct AccessDelegateBuilder<K, V, S = (), T = ()> {
    region: RegionHandle,
    store: S,
    transport: T,
    runtime: Option<Handle>,
    _phantom: PhantomData<fn() -> (K, V)>,
}

impl<K, V, S, T> fmt::Debug for AccessDelegateBuilder<K, V, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessDelegateBuilder")
            .field("region", &self.region.name())
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl<K, V> AccessDelegateBuilder<K, V> {
    fn new(region: RegionHandle) -> Self {
        Self {
            region,
            store: (),
            transport: (),
            runtime: None,
            _phantom: PhantomData,
        }
    }
}

impl<K, V, T> AccessDelegateBuilder<K, V, (), T> {
    /// Sets the node-local store the delegate reads and writes.
    pub fn store<S>(self, store: S) -> AccessDelegateBuilder<K, V, S, T>
    where
        S: CacheStore<K, V>,
    {
        AccessDelegateBuilder {
            region: self.region,
            store,
            transport: self.transport,
            runtime: self.runtime,
            _phantom: PhantomData,
        }
    }
}

impl<K, V, S> AccessDelegateBuilder<K, V, S, ()> {
    /// Sets the transport used to reach the region's peers.
    pub fn transport<T>(self, transport: T) -> AccessDelegateBuilder<K, V, S, T>
    where
        T: ClusterTransport<K>,
    {
        AccessDelegateBuilder {
            region: self.region,
            store: self.store,
            transport,
            runtime: self.runtime,
            _phantom: PhantomData,
        }
    }
}

impl<K, V, S, T> AccessDelegateBuilder<K, V, S, T> {
    /// Sets the Tokio runtime deferred commit writes are spawned on.
    ///
    /// Defaults to the runtime [`build_transactional`][Self::build_transactional] is
    /// called from.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

impl<K, V, S, T> AccessDelegateBuilder<K, V, S, T>
where
    K: CacheKey,
    V: CacheValue,
    S: CacheStore<K, V> + 'static,
    T: ClusterTransport<K>,
{
    /// Builds a non-transactional delegate.
    #[must_use]
    pub fn build(self) -> CacheAccessDelegate<K, V, S, T> {
        CacheAccessDelegate::new(self.region, Arc::new(self.store), Arc::new(self.transport))
    }

    /// Builds a transactional delegate.
    ///
    /// # Errors
    ///
    /// Fails if no runtime was set and this is not called from within a Tokio runtime.
    pub fn build_transactional(self) -> Result<TransactionalAccessDelegate<K, V, S, T>, Error> {
        let runtime = match self.runtime {
            Some(handle) => Runtime::new(handle),
            None => Runtime::current()?,
        };
        Ok(TransactionalAccessDelegate::new(
            self.region,
            Arc::new(self.store),
            Arc::new(self.transport),
            runtime,
        ))
    }
}

#[cfg(test)]
mod tests {
    use coherence_cluster::{ClusterMessage, DeliveryMode, LocalCluster};
    use coherence_store::{InMemoryStore, OwnerToken, StoredEntry, Timestamp};
    use tick::Clock;

    use super::*;
    use crate::{CoherenceConfig, RegionRegistry};

    fn registry() -> RegionRegistry {
        RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default())
    }

    #[test]
    fn transactional_build_needs_runtime() {
        let regions = registry();
        let result = CacheAccessDelegate::builder::<u32, u32>(regions.acquire("r"))
            .store(InMemoryStore::new())
            .transport(LocalCluster::new().join())
            .build_transactional();
        assert!(result.is_err());
    }

    #[test]
    fn explicit_runtime_is_used() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
        let regions = registry();
        let cache = CacheAccessDelegate::builder::<u32, u32>(regions.acquire("r"))
            .store(InMemoryStore::new())
            .transport(LocalCluster::new().join())
            .runtime(runtime.handle().clone())
            .build_transactional()
            .expect("explicit runtime");
        assert_eq!(cache.region().name(), "r");
    }

    #[test]
    fn build_attaches_remote_handler() {
        futures::executor::block_on(async {
            let regions = registry();
            let cluster = LocalCluster::new();
            let sender = cluster.join();
            let store = InMemoryStore::new();
            store
                .insert(&1_u32, StoredEntry::loaded(10_u32, Timestamp::from_millis(0)))
                .await
                .expect("seed");

            let cache = CacheAccessDelegate::builder::<u32, u32>(regions.acquire("r"))
                .store(store.clone())
                .transport(cluster.join())
                .build();

            sender
                .broadcast(ClusterMessage::Invalidate { keys: vec![1] }, DeliveryMode::Sync)
                .await
                .expect("broadcast");

            assert!(!store.contains_key(&1));
            assert_eq!(cache.get(&1, Timestamp::from_millis(0), OwnerToken::new()).await.expect("get"), None);
        });
    }
}
