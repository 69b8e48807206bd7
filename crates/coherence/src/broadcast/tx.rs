// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transactional invalidation broadcast.

use std::fmt;
use std::sync::Arc;

use coherence_cluster::{ClusterMessage, ClusterTransport, DeliveryMode};
use coherence_store::{CacheKey, CacheStore, CacheValue, Error};

use crate::telemetry::{Activity, Operation};
use crate::{RegionHandle, TransactionContext, WriteCommand};

/// Defers invalidation broadcasts of a transaction to its prepare phase.
///
/// During the transaction, [`visit`][Self::visit] only touches the local store and
/// buffers the values the deferred commit writer applies on completion. At
/// [`prepare`][Self::prepare] one synchronous invalidation batch is sent for every key
/// that was genuinely written, so peers open their windows before the transaction
/// releases its database locks.
pub struct TxInvalidationBroadcaster<S, T> {
    region: RegionHandle,
    store: Arc<S>,
    transport: Arc<T>,
}

impl<S, T> fmt::Debug for TxInvalidationBroadcaster<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxInvalidationBroadcaster")
            .field("region", &self.region.name())
            .finish_non_exhaustive()
    }
}

impl<S, T> TxInvalidationBroadcaster<S, T> {
    /// Creates a broadcaster writing to `store` and notifying peers through `transport`.
    #[must_use]
    pub fn new(region: RegionHandle, store: Arc<S>, transport: Arc<T>) -> Self {
        Self { region, store, transport }
    }

    /// Intercepts one write of `tx`.
    ///
    /// Cache fills go to the store right away. Puts are buffered on the transaction.
    /// Removes and clears take effect locally now; a remove also buffers a tombstone.
    ///
    /// # Errors
    ///
    /// Returns the local store's error.
    pub async fn visit<K, V>(&self, tx: &TransactionContext<K, V>, command: WriteCommand<K, V>) -> Result<(), Error>
    where
        K: CacheKey,
        V: CacheValue,
        S: CacheStore<K, V>,
    {
        match &command {
            WriteCommand::Put { key, value, as_of, flags } => {
                if flags.is_external_read() {
                    let _ = self.store.put_for_external_read(key, value.clone(), *as_of).await?;
                } else {
                    tx.buffer_write(key.clone(), Some(value.clone()));
                }
            }
            WriteCommand::BatchPut { entries, as_of, flags } => {
                for (key, value) in entries {
                    if flags.is_external_read() {
                        let _ = self.store.put_for_external_read(key, value.clone(), *as_of).await?;
                    } else {
                        tx.buffer_write(key.clone(), Some(value.clone()));
                    }
                }
            }
            WriteCommand::Remove { key, .. } => {
                self.store.remove(key).await?;
                tx.buffer_write(key.clone(), None);
            }
            WriteCommand::Clear => self.store.clear().await?,
        }

        tx.record(command);
        Ok(())
    }

    /// Sends the invalidation batch of `tx` to every peer and waits for all of them.
    ///
    /// A clear recorded on the transaction is broadcast first.
    ///
    /// # Errors
    ///
    /// Fails if any peer could not be reached; the transaction should then roll back.
    pub async fn prepare<K, V>(&self, tx: &TransactionContext<K, V>) -> Result<(), Error>
    where
        K: CacheKey,
        V: CacheValue,
        T: ClusterTransport<K>,
    {
        let (keys, clear) = tx.broadcast_set();
        if clear {
            self.send(ClusterMessage::Clear).await?;
        }
        if !keys.is_empty() {
            self.send(ClusterMessage::BeginInvalidation { keys, owner: tx.owner() }).await?;
        }
        Ok(())
    }

    async fn send<K>(&self, message: ClusterMessage<K>) -> Result<(), Error>
    where
        K: CacheKey,
        T: ClusterTransport<K>,
    {
        let kind = message.kind();
        match self.transport.broadcast(message, DeliveryMode::Sync).await {
            Ok(()) => {
                self.region.telemetry().record_key(Operation::Prepare, Activity::Sent, &kind);
                Ok(())
            }
            Err(error) => {
                self.region
                    .telemetry()
                    .record_error(Operation::Prepare, Activity::Error, Some(&kind), &error);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use coherence_cluster::{LocalCluster, MessageHandler, NodeId};
    use coherence_store::{InMemoryStore, OwnerToken, Timestamp};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use tick::Clock;

    use super::*;
    use crate::{CommandFlags, CoherenceConfig, RegionRegistry};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ClusterMessage<u32>>>);

    impl MessageHandler<u32> for Recorder {
        fn deliver(&self, _origin: NodeId, message: ClusterMessage<u32>) -> BoxFuture<'_, ()> {
            Box::pin(async move { self.0.lock().push(message) })
        }
    }

    #[test]
    fn visit_buffers_puts_and_applies_removes() {
        futures::executor::block_on(async {
            let registry = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
            let cluster = LocalCluster::<u32>::new();
            let store = InMemoryStore::new();
            let broadcaster = TxInvalidationBroadcaster::new(registry.acquire("r"), Arc::new(store.clone()), Arc::new(cluster.join()));
            let tx = TransactionContext::new(OwnerToken::new(), Timestamp::from_millis(1));

            store
                .insert(&2, coherence_store::StoredEntry::loaded("old".to_string(), Timestamp::from_millis(0)))
                .await
                .expect("seed");

            broadcaster
                .visit(&tx, WriteCommand::put(1, "new".to_string(), Timestamp::from_millis(1)))
                .await
                .expect("put");
            broadcaster.visit(&tx, WriteCommand::remove(2)).await.expect("remove");

            assert!(!store.contains_key(&1), "puts are deferred");
            assert!(!store.contains_key(&2), "removes are immediate");
            assert_eq!(tx.take_writes(), vec![(1, Some("new".to_string())), (2, None)]);
            assert_eq!(tx.modification_count(), 2);
        });
    }

    #[test]
    fn prepare_sends_one_begin_batch() {
        futures::executor::block_on(async {
            let registry = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
            let cluster = LocalCluster::new();
            let local = cluster.join();
            let peer = cluster.join();
            let recorder = Arc::new(Recorder::default());
            let handler: Arc<dyn MessageHandler<u32>> = Arc::clone(&recorder) as Arc<dyn MessageHandler<u32>>;
            peer.attach(&handler);

            let broadcaster = TxInvalidationBroadcaster::new(registry.acquire("r"), Arc::new(InMemoryStore::<u32, u32>::new()), Arc::new(local));
            let tx = TransactionContext::new(OwnerToken::new(), Timestamp::from_millis(1));
            let at = Timestamp::from_millis(1);

            broadcaster.visit(&tx, WriteCommand::put(1, 10, at)).await.expect("put");
            broadcaster
                .visit(
                    &tx,
                    WriteCommand::Put {
                        key: 2,
                        value: 20,
                        as_of: at,
                        flags: CommandFlags::external_read(),
                    },
                )
                .await
                .expect("fill");
            broadcaster.visit(&tx, WriteCommand::remove(3)).await.expect("remove");
            assert!(recorder.0.lock().is_empty(), "nothing is sent before prepare");

            broadcaster.prepare(&tx).await.expect("prepare");
            assert_eq!(
                *recorder.0.lock(),
                vec![ClusterMessage::BeginInvalidation {
                    keys: vec![1, 3],
                    owner: tx.owner()
                }]
            );
        });
    }

    #[test]
    fn prepare_fails_when_peer_unreachable() {
        futures::executor::block_on(async {
            let registry = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
            let cluster = LocalCluster::new();
            let local = cluster.join();
            let peer = cluster.join();
            cluster.set_unreachable(peer.local_node(), true);

            let broadcaster = TxInvalidationBroadcaster::new(registry.acquire("r"), Arc::new(InMemoryStore::<u32, u32>::new()), Arc::new(local));
            let tx = TransactionContext::new(OwnerToken::new(), Timestamp::from_millis(1));
            broadcaster.visit(&tx, WriteCommand::remove(1)).await.expect("remove");

            assert!(broadcaster.prepare(&tx).await.is_err());
        });
    }

    #[test]
    fn prepare_without_writes_sends_nothing() {
        futures::executor::block_on(async {
            let registry = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
            let cluster = LocalCluster::new();
            let local = cluster.join();
            let peer = cluster.join();
            cluster.set_unreachable(peer.local_node(), true);

            let broadcaster = TxInvalidationBroadcaster::new(registry.acquire("r"), Arc::new(InMemoryStore::<u32, u32>::new()), Arc::new(local));
            let tx = TransactionContext::<u32, u32>::new(OwnerToken::new(), Timestamp::from_millis(1));
            broadcaster.prepare(&tx).await.expect("nothing to send");
        });
    }
}
