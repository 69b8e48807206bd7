// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The read and write surface used by the persistence layer.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use coherence_cluster::{ClusterTransport, MessageHandler};
use coherence_store::{CacheKey, CacheStore, CacheValue, Error, OwnerToken, StoredEntry, Timestamp};

use crate::broadcast::{NonTxInvalidationBroadcaster, TxInvalidationBroadcaster};
use crate::deferred::{DeferredCommitWriter, PendingWrites};
use crate::pending::RegionInvalidation;
use crate::remote::RemoteInvalidationHandler;
use crate::runtime::Runtime;
use crate::telemetry::{Activity, Operation};
use crate::{CommandFlags, PendingPutRegistry, PutFromLoadWindowCoordinator, RegionHandle, TransactionContext, WriteCommand};

/// Non-transactional access to one cache region.
///
/// Reads that miss register a pending put so the later [`put_from_load`][Self::put_from_load]
/// can be validated against invalidations that happened in between. Writes invalidate
/// the key locally before touching the store, then tell every peer.
///
/// Created with [`CacheAccessDelegate::builder`]. The delegate owns the handler through
/// which its transport delivers peer messages; dropping the delegate detaches it.
///
/// # Examples
///
/// ```
/// use coherence::{CacheAccessDelegate, CoherenceConfig, RegionRegistry};
/// use coherence_cluster::LocalCluster;
/// use coherence_store::{InMemoryStore, OwnerToken};
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let regions = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
/// let cluster = LocalCluster::new();
/// let cache = CacheAccessDelegate::builder::<u32, String>(regions.acquire("users"))
///     .store(InMemoryStore::new())
///     .transport(cluster.join())
///     .build();
///
/// let reader = OwnerToken::new();
/// let as_of = cache.region().now();
/// assert_eq!(cache.get(&7, as_of, reader).await?, None);
/// assert!(cache.put_from_load(&7, "ada".to_string(), as_of, reader, false).await?);
/// assert_eq!(cache.get(&7, as_of, reader).await?, Some("ada".to_string()));
/// # Ok::<(), coherence_store::Error>(())
/// # });
/// ```
pub struct CacheAccessDelegate<K, V, S, T> {
    region: RegionHandle,
    pending: Arc<PendingPutRegistry<K>>,
    store: Arc<S>,
    broadcaster: NonTxInvalidationBroadcaster<S, T>,
    handler: Arc<dyn MessageHandler<K>>,
    _value: PhantomData<fn() -> V>,
}

impl<K, V, S, T> fmt::Debug for CacheAccessDelegate<K, V, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheAccessDelegate")
            .field("region", &self.region.name())
            .finish_non_exhaustive()
    }
}

impl<K, V, S, T> CacheAccessDelegate<K, V, S, T>
where
    K: CacheKey,
    V: CacheValue,
    S: CacheStore<K, V> + 'static,
    T: ClusterTransport<K>,
{
    pub(crate) fn new(region: RegionHandle, store: Arc<S>, transport: Arc<T>) -> Self {
        let pending = Arc::new(PendingPutRegistry::new(region.clone()));
        let handler: Arc<dyn MessageHandler<K>> = Arc::new(RemoteInvalidationHandler::new(Arc::clone(&pending), Arc::clone(&store)));
        transport.attach(&handler);
        Self {
            broadcaster: NonTxInvalidationBroadcaster::new(region.clone(), Arc::clone(&store), transport),
            region,
            pending,
            store,
            handler,
            _value: PhantomData,
        }
    }

    /// Reads `key` for `owner`, whose view of the database is as of `as_of`.
    ///
    /// Returns `None` on a miss. A miss registers a pending put for `owner`, except while
    /// the region is being invalidated, when the store is not consulted at all.
    ///
    /// # Errors
    ///
    /// Returns the store's error. A miss is not an error.
    pub async fn get(&self, key: &K, as_of: Timestamp, owner: OwnerToken) -> Result<Option<V>, Error> {
        let telemetry = self.region.telemetry();
        if !self.region.is_valid() {
            telemetry.record_key(Operation::Get, Activity::Skipped, key);
            return Ok(None);
        }

        if let Some(value) = self.store.get(key).await?.and_then(StoredEntry::into_value) {
            telemetry.record_key(Operation::Get, Activity::Hit, key);
            return Ok(Some(value));
        }

        telemetry.record_key(Operation::Get, Activity::Miss, key);
        let _ = self.pending.register_pending_put(owner, key, as_of);
        Ok(None)
    }

    /// Caches `value`, which `owner` loaded from the database as of `as_of`.
    ///
    /// Returns whether the value was stored. The write is skipped while the region is
    /// being invalidated, when the key was invalidated after `as_of`, or when another
    /// owner holds an invalidation window on it. With `minimal_put`, a key that already
    /// holds a readable value is left alone. The store itself never lets the fill replace
    /// a newer write.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn put_from_load(&self, key: &K, value: V, as_of: Timestamp, owner: OwnerToken, minimal_put: bool) -> Result<bool, Error> {
        let telemetry = self.region.telemetry();
        if !self.region.is_valid() {
            telemetry.record_key(Operation::PutFromLoad, Activity::Skipped, key);
            return Ok(false);
        }
        if minimal_put && self.store.get(key).await?.is_some_and(|entry| entry.value().is_some()) {
            telemetry.record_key(Operation::PutFromLoad, Activity::Skipped, key);
            return Ok(false);
        }

        let Some(lock) = self.pending.acquire_put_from_load_lock(owner, key, as_of).await else {
            return Ok(false);
        };
        let command = WriteCommand::Put {
            key: key.clone(),
            value,
            as_of,
            flags: CommandFlags::external_read(),
        };
        let stored = self.broadcaster.handle(command).await;
        self.pending.release_put_from_load_lock(lock);

        let stored = stored?;
        let activity = if stored { Activity::Stored } else { Activity::Skipped };
        telemetry.record_key(Operation::PutFromLoad, activity, key);
        Ok(stored)
    }

    /// Writes `value` for `key` and invalidates it on every peer.
    ///
    /// # Errors
    ///
    /// Returns the store's error; peers are not notified in that case.
    pub async fn update(&self, key: K, value: V) -> Result<(), Error> {
        let _ = self.pending.invalidate_key(&key).await;
        self.region.telemetry().record_key(Operation::Update, Activity::Invalidated, &key);
        let as_of = self.region.now();
        let _ = self.broadcaster.handle(WriteCommand::put(key, value, as_of)).await?;
        Ok(())
    }

    /// Removes `key` here and on every peer. An absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns the store's error; peers are not notified in that case.
    pub async fn remove(&self, key: K) -> Result<(), Error> {
        self.invalidate(Operation::Remove, key).await
    }

    /// Evicts `key` here and on every peer.
    ///
    /// # Errors
    ///
    /// Returns the store's error; peers are not notified in that case.
    pub async fn evict(&self, key: K) -> Result<(), Error> {
        self.invalidate(Operation::Evict, key).await
    }

    /// Clears the region here and on every peer.
    ///
    /// Cache fills are rejected from the moment this starts until it returns, and fills of
    /// loads older than that are rejected afterwards too.
    ///
    /// # Errors
    ///
    /// Returns the local store's error. The clear is broadcast regardless.
    pub async fn remove_all(&self) -> Result<(), Error> {
        self.clear(Operation::Clear).await
    }

    /// Evicts every entry of the region here and on every peer.
    ///
    /// # Errors
    ///
    /// Returns the local store's error. The eviction is broadcast regardless.
    pub async fn evict_all(&self) -> Result<(), Error> {
        self.clear(Operation::Evict).await
    }

    async fn invalidate(&self, operation: Operation, key: K) -> Result<(), Error> {
        let _ = self.pending.invalidate_key(&key).await;
        self.region.telemetry().record_key(operation, Activity::Invalidated, &key);
        let _ = self.broadcaster.handle(WriteCommand::<K, V>::remove(key)).await?;
        Ok(())
    }

    async fn clear(&self, operation: Operation) -> Result<(), Error> {
        let invalidation = RegionInvalidation::begin(&self.pending).await;
        let cleared = self.broadcaster.handle(WriteCommand::<K, V>::Clear).await;
        drop(invalidation);
        self.region.telemetry().record(operation, Activity::Invalidated);
        cleared.map(|_| ())
    }
}

impl<K, V, S, T> CacheAccessDelegate<K, V, S, T> {
    /// The region this delegate serves.
    #[must_use]
    pub fn region(&self) -> &RegionHandle {
        &self.region
    }

    /// The pending put registry of the region.
    #[must_use]
    pub fn pending_puts(&self) -> &PendingPutRegistry<K> {
        &self.pending
    }

    /// The handler the transport delivers peer messages to.
    ///
    /// Useful for transports that are wired up by hand instead of through
    /// [`ClusterTransport::attach`].
    #[must_use]
    pub fn message_handler(&self) -> &Arc<dyn MessageHandler<K>> {
        &self.handler
    }
}

/// Transactional access to one cache region.
///
/// Writes made inside a transaction open an invalidation window on the key and are
/// buffered on the [`TransactionContext`]. [`before_completion`][Self::before_completion]
/// opens the same windows on every peer; [`after_completion`][Self::after_completion]
/// closes them and hands the buffered writes to the [`DeferredCommitWriter`], which
/// stores the committed value or a tombstone.
///
/// Reads, cache fills and the administrative operations behave as on
/// [`CacheAccessDelegate`], scoped to the transaction's owner token and start time.
pub struct TransactionalAccessDelegate<K, V, S, T> {
    inner: CacheAccessDelegate<K, V, S, T>,
    broadcaster: TxInvalidationBroadcaster<S, T>,
    coordinator: PutFromLoadWindowCoordinator<K, S, T>,
    writer: DeferredCommitWriter<S>,
}

impl<K, V, S, T> fmt::Debug for TransactionalAccessDelegate<K, V, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalAccessDelegate")
            .field("region", &self.inner.region.name())
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

impl<K, V, S, T> TransactionalAccessDelegate<K, V, S, T>
where
    K: CacheKey,
    V: CacheValue,
    S: CacheStore<K, V> + 'static,
    T: ClusterTransport<K>,
{
    pub(crate) fn new(region: RegionHandle, store: Arc<S>, transport: Arc<T>, runtime: Runtime) -> Self {
        let inner = CacheAccessDelegate::new(region.clone(), Arc::clone(&store), Arc::clone(&transport));
        Self {
            broadcaster: TxInvalidationBroadcaster::new(region.clone(), Arc::clone(&store), Arc::clone(&transport)),
            coordinator: PutFromLoadWindowCoordinator::new(Arc::clone(&inner.pending), Arc::clone(&store), transport),
            writer: DeferredCommitWriter::new(region, store, runtime),
            inner,
        }
    }

    /// Starts a transaction with a fresh owner token, as of now.
    #[must_use]
    pub fn begin(&self) -> TransactionContext<K, V> {
        TransactionContext::new(OwnerToken::new(), self.inner.region.now())
    }

    /// Reads `key` within `tx`.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn get(&self, tx: &TransactionContext<K, V>, key: &K) -> Result<Option<V>, Error> {
        self.inner.get(key, tx.started_at(), tx.owner()).await
    }

    /// Caches `value` loaded within `tx`. See [`CacheAccessDelegate::put_from_load`].
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn put_from_load(&self, tx: &TransactionContext<K, V>, key: &K, value: V, minimal_put: bool) -> Result<bool, Error> {
        self.inner
            .put_from_load(key, value, tx.started_at(), tx.owner(), minimal_put)
            .await
    }

    /// Writes `value` for `key` within `tx`. The value reaches the store after commit.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn update(&self, tx: &TransactionContext<K, V>, key: K, value: V) -> Result<(), Error> {
        self.coordinator.on_write(tx, &key).await;
        let as_of = self.inner.region.now();
        self.broadcaster.visit(tx, WriteCommand::put(key, value, as_of)).await
    }

    /// Removes `key` within `tx`. The local entry goes right away.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn remove(&self, tx: &TransactionContext<K, V>, key: K) -> Result<(), Error> {
        self.coordinator.on_write(tx, &key).await;
        self.broadcaster.visit(tx, WriteCommand::remove(key)).await
    }

    /// Evicts `key` here and on every peer, outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn evict(&self, key: K) -> Result<(), Error> {
        self.inner.evict(key).await
    }

    /// Evicts every entry of the region here and on every peer.
    ///
    /// # Errors
    ///
    /// Returns the local store's error.
    pub async fn evict_all(&self) -> Result<(), Error> {
        self.inner.evict_all().await
    }

    /// Clears the region here and on every peer.
    ///
    /// # Errors
    ///
    /// Returns the local store's error.
    pub async fn remove_all(&self) -> Result<(), Error> {
        self.inner.remove_all().await
    }

    /// Prepares `tx`: drops the local entries of its keys and opens windows on every peer.
    ///
    /// # Errors
    ///
    /// Fails if a peer could not be reached. The transaction should then roll back;
    /// [`after_completion`][Self::after_completion] must still be called.
    pub async fn before_completion(&self, tx: &TransactionContext<K, V>) -> Result<(), Error> {
        self.coordinator.on_prepare(tx).await;
        self.broadcaster.prepare(tx).await
    }

    /// Completes `tx` with its database outcome.
    ///
    /// Closes every window the transaction holds and spawns one deferred write per
    /// buffered key: the value if `committed`, a tombstone otherwise. The writes run in
    /// the background whether or not the returned [`PendingWrites`] is awaited.
    pub async fn after_completion(&self, tx: &TransactionContext<K, V>, committed: bool) -> PendingWrites {
        self.coordinator.on_completion(tx).await;

        let mut writes = PendingWrites::default();
        for (key, value) in tx.take_writes() {
            writes.push(self.writer.spawn(key, value, committed, tx.started_at()));
        }
        writes
    }
}

impl<K, V, S, T> TransactionalAccessDelegate<K, V, S, T> {
    /// The region this delegate serves.
    #[must_use]
    pub fn region(&self) -> &RegionHandle {
        self.inner.region()
    }

    /// The pending put registry of the region.
    #[must_use]
    pub fn pending_puts(&self) -> &PendingPutRegistry<K> {
        self.inner.pending_puts()
    }

    /// The handler the transport delivers peer messages to.
    #[must_use]
    pub fn message_handler(&self) -> &Arc<dyn MessageHandler<K>> {
        self.inner.message_handler()
    }

    /// The writer that finalizes completed transactions.
    #[must_use]
    pub fn deferred_writer(&self) -> &DeferredCommitWriter<S> {
        &self.writer
    }
}
