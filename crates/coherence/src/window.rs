// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Invalidation windows held open for the lifetime of a transaction.

use std::fmt;
use std::sync::Arc;

use coherence_cluster::{ClusterMessage, ClusterTransport, DeliveryMode};
use coherence_store::{CacheKey, CacheStore, CacheValue};

use crate::telemetry::{Activity, Operation};
use crate::{PendingPutRegistry, TransactionContext, TxPhase};

/// Keeps an invalidation window open on every key a transaction writes, from the first
/// write until the transaction completes.
///
/// While a window is open, cache fills of the key by other owners are rejected, so a
/// reader cannot repopulate the cache with a value the transaction is about to replace.
/// Peers open their windows when the transactional broadcaster prepares; this coordinator
/// closes them again on completion.
pub struct PutFromLoadWindowCoordinator<K, S, T> {
    pending: Arc<PendingPutRegistry<K>>,
    store: Arc<S>,
    transport: Arc<T>,
}

impl<K: CacheKey, S, T> fmt::Debug for PutFromLoadWindowCoordinator<K, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutFromLoadWindowCoordinator")
            .field("region", &self.pending.region().name())
            .finish_non_exhaustive()
    }
}

impl<K: CacheKey, S, T> PutFromLoadWindowCoordinator<K, S, T> {
    /// Creates a coordinator tracking windows in `pending`.
    #[must_use]
    pub fn new(pending: Arc<PendingPutRegistry<K>>, store: Arc<S>, transport: Arc<T>) -> Self {
        Self { pending, store, transport }
    }

    /// Opens the local window of `tx` on `key` before the write is applied.
    ///
    /// A window that could not be opened in time is logged and the write proceeds.
    pub async fn on_write<V: Clone>(&self, tx: &TransactionContext<K, V>, key: &K) {
        let _ = self.pending.begin_invalidating_key(tx.owner(), key).await;
        tx.mark_affected(key.clone());
    }

    /// Drops the local entries of every key `tx` wrote and marks it prepared.
    pub async fn on_prepare<V>(&self, tx: &TransactionContext<K, V>)
    where
        V: CacheValue,
        S: CacheStore<K, V>,
    {
        for key in tx.affected_keys() {
            if let Err(error) = self.store.remove(&key).await {
                self.pending
                    .region()
                    .telemetry()
                    .record_error(Operation::Prepare, Activity::Degraded, Some(&key), &error);
            }
        }
        tx.set_phase(TxPhase::Prepared);
    }

    /// Closes the windows of `tx` on every node.
    ///
    /// Peers only hold windows if the transaction was prepared, so nothing is sent
    /// otherwise. The end notice is sent without waiting; a lost notice leaves the
    /// peer's window to be reclaimed once it expires.
    pub async fn on_completion<V>(&self, tx: &TransactionContext<K, V>)
    where
        V: Clone,
        T: ClusterTransport<K>,
    {
        let telemetry = self.pending.region().telemetry();
        if tx.phase() == TxPhase::Prepared {
            let (keys, _) = tx.broadcast_set();
            if !keys.is_empty() {
                let message = ClusterMessage::EndInvalidation { keys, owner: tx.owner() };
                match self.transport.broadcast(message, DeliveryMode::Async).await {
                    Ok(()) => telemetry.record(Operation::Completion, Activity::Sent),
                    Err(error) => telemetry.record_error(Operation::Completion, Activity::Degraded, None, &error),
                }
            }
        }

        for key in tx.affected_keys() {
            let _ = self.pending.end_invalidating_key(tx.owner(), &key).await;
        }
        tx.set_phase(TxPhase::Completed);
    }
}

#[cfg(test)]
mod tests {
    use coherence_cluster::{LocalCluster, MessageHandler, NodeId};
    use coherence_store::{InMemoryStore, OwnerToken, StoredEntry, Timestamp};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use tick::ClockControl;

    use super::*;
    use crate::{CoherenceConfig, RegionRegistry, WriteCommand};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ClusterMessage<&'static str>>>);

    impl MessageHandler<&'static str> for Recorder {
        fn deliver(&self, _origin: NodeId, message: ClusterMessage<&'static str>) -> BoxFuture<'_, ()> {
            Box::pin(async move { self.0.lock().push(message) })
        }
    }

    struct Fixture {
        control: ClockControl,
        _regions: RegionRegistry,
        cluster: LocalCluster<&'static str>,
        pending: Arc<PendingPutRegistry<&'static str>>,
        store: InMemoryStore<&'static str, String>,
        coordinator: PutFromLoadWindowCoordinator<&'static str, InMemoryStore<&'static str, String>, coherence_cluster::LocalTransport<&'static str>>,
        recorder: Arc<Recorder>,
        _handler: Arc<dyn MessageHandler<&'static str>>,
    }

    fn fixture() -> Fixture {
        let control = ClockControl::new_at(Timestamp::from_millis(1_000).to_system_time());
        let regions = RegionRegistry::new(control.to_clock(), CoherenceConfig::default());
        let pending = Arc::new(PendingPutRegistry::new(regions.acquire("r")));
        let cluster = LocalCluster::new();
        let local = cluster.join();
        let peer = cluster.join();
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn MessageHandler<&'static str>> = Arc::clone(&recorder) as Arc<dyn MessageHandler<&'static str>>;
        peer.attach(&handler);

        let store = InMemoryStore::new();
        let coordinator = PutFromLoadWindowCoordinator::new(Arc::clone(&pending), Arc::new(store.clone()), Arc::new(local));
        Fixture {
            control,
            _regions: regions,
            cluster,
            pending,
            store,
            coordinator,
            recorder,
            _handler: handler,
        }
    }

    #[tokio::test]
    async fn window_blocks_foreign_fills_until_completion() {
        let f = fixture();
        let tx = TransactionContext::<&'static str, String>::new(OwnerToken::new(), Timestamp::from_millis(1_000));
        let reader = OwnerToken::new();

        f.coordinator.on_write(&tx, &"k").await;
        assert_eq!(f.pending.open_windows(&"k").await, vec![tx.owner()]);
        assert!(!f.pending.register_pending_put(reader, &"k", Timestamp::from_millis(1_000)));
        assert!(f.pending.acquire_put_from_load_lock(reader, &"k", Timestamp::from_millis(1_000)).await.is_none());

        f.coordinator.on_completion(&tx).await;
        assert!(f.pending.open_windows(&"k").await.is_empty());
        assert_eq!(tx.phase(), TxPhase::Completed);
    }

    #[tokio::test]
    async fn prepare_drops_local_entries() {
        let f = fixture();
        let tx = TransactionContext::<&'static str, String>::new(OwnerToken::new(), Timestamp::from_millis(1_000));
        f.store
            .insert(&"k", StoredEntry::loaded("old".to_string(), Timestamp::from_millis(500)))
            .await
            .expect("seed");

        f.coordinator.on_write(&tx, &"k").await;
        f.coordinator.on_prepare(&tx).await;

        assert!(!f.store.contains_key(&"k"));
        assert_eq!(tx.phase(), TxPhase::Prepared);
    }

    #[tokio::test]
    async fn write_proceeds_when_window_times_out() {
        let f = fixture();
        let tx = TransactionContext::<&'static str, String>::new(OwnerToken::new(), Timestamp::from_millis(1_000));
        f.store
            .insert(&"k", StoredEntry::loaded("old".to_string(), Timestamp::from_millis(500)))
            .await
            .expect("seed");
        let held = f
            .pending
            .acquire_put_from_load_lock(OwnerToken::new(), &"k", Timestamp::from_millis(1_000))
            .await
            .expect("admitted");

        let ((), ()) = futures::join!(f.coordinator.on_write(&tx, &"k"), async {
            f.control.advance(CoherenceConfig::default().invalidation_lock_timeout());
        });
        assert_eq!(tx.affected_keys(), vec!["k"]);

        f.pending.release_put_from_load_lock(held);
        assert!(f.pending.open_windows(&"k").await.is_empty(), "no window was opened");

        f.coordinator.on_prepare(&tx).await;
        assert!(!f.store.contains_key(&"k"));
    }

    #[tokio::test]
    async fn end_notice_sent_only_after_prepare() {
        let f = fixture();

        let rolled_back = TransactionContext::<&'static str, String>::new(OwnerToken::new(), Timestamp::from_millis(1_000));
        f.coordinator.on_write(&rolled_back, &"a").await;
        rolled_back.record(WriteCommand::remove("a"));
        f.coordinator.on_completion(&rolled_back).await;
        assert_eq!(f.cluster.pending_count(), 0);

        let prepared = TransactionContext::<&'static str, String>::new(OwnerToken::new(), Timestamp::from_millis(1_000));
        f.coordinator.on_write(&prepared, &"b").await;
        prepared.record(WriteCommand::remove("b"));
        f.coordinator.on_prepare(&prepared).await;
        f.coordinator.on_completion(&prepared).await;

        assert_eq!(f.cluster.deliver_pending().await, 1);
        assert_eq!(
            *f.recorder.0.lock(),
            vec![ClusterMessage::EndInvalidation {
                keys: vec!["b"],
                owner: prepared.owner()
            }]
        );
    }
}
