// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Non-transactional invalidation broadcast.

use std::fmt;
use std::sync::Arc;

use coherence_cluster::{ClusterMessage, ClusterTransport};
use coherence_store::{CacheKey, CacheStore, CacheValue, Error, StoredEntry};

use crate::telemetry::{Activity, Operation};
use crate::{RegionHandle, WriteCommand};

/// Applies writes to the local store and invalidates the written keys on every peer.
///
/// Peers are only told about writes that succeeded locally. Cache fills and local-only
/// writes are never broadcast. A clear is broadcast whatever its local outcome, since its
/// intent is cluster-wide. Broadcast failures are logged and do not fail the write.
pub struct NonTxInvalidationBroadcaster<S, T> {
    region: RegionHandle,
    store: Arc<S>,
    transport: Arc<T>,
}

impl<S, T> fmt::Debug for NonTxInvalidationBroadcaster<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonTxInvalidationBroadcaster")
            .field("region", &self.region.name())
            .finish_non_exhaustive()
    }
}

impl<S, T> NonTxInvalidationBroadcaster<S, T> {
    /// Creates a broadcaster writing to `store` and notifying peers through `transport`.
    #[must_use]
    pub fn new(region: RegionHandle, store: Arc<S>, transport: Arc<T>) -> Self {
        Self { region, store, transport }
    }

    /// Applies `command`.
    ///
    /// Returns whether the local store accepted the write. Only a cache fill can be turned
    /// down; the other commands return `true` or an error.
    ///
    /// # Errors
    ///
    /// Returns the local store's error. Nothing is broadcast for a failed put or remove.
    pub async fn handle<K, V>(&self, command: WriteCommand<K, V>) -> Result<bool, Error>
    where
        K: CacheKey,
        V: CacheValue,
        S: CacheStore<K, V>,
        T: ClusterTransport<K>,
    {
        match command {
            WriteCommand::Put { key, value, as_of, flags } => {
                if flags.is_external_read() {
                    return self.store.put_for_external_read(&key, value, as_of).await;
                }
                self.store.insert(&key, StoredEntry::loaded(value, as_of)).await?;
                if flags.is_broadcast() {
                    self.send(ClusterMessage::Invalidate { keys: vec![key] }).await;
                }
                Ok(true)
            }
            WriteCommand::Remove { key, flags } => {
                self.store.remove(&key).await?;
                if flags.is_broadcast() {
                    self.send(ClusterMessage::Invalidate { keys: vec![key] }).await;
                }
                Ok(true)
            }
            WriteCommand::BatchPut { entries, as_of, flags } => {
                if flags.is_external_read() {
                    let mut stored = false;
                    for (key, value) in entries {
                        stored |= self.store.put_for_external_read(&key, value, as_of).await?;
                    }
                    return Ok(stored);
                }
                let mut keys = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    self.store.insert(&key, StoredEntry::loaded(value, as_of)).await?;
                    keys.push(key);
                }
                if flags.is_broadcast() && !keys.is_empty() {
                    self.send(ClusterMessage::Invalidate { keys }).await;
                }
                Ok(true)
            }
            WriteCommand::Clear => {
                let cleared = self.store.clear().await;
                self.send(ClusterMessage::Clear).await;
                cleared.map(|()| true)
            }
        }
    }

    async fn send<K>(&self, message: ClusterMessage<K>)
    where
        K: CacheKey,
        T: ClusterTransport<K>,
    {
        let kind = message.kind();
        match self.transport.broadcast(message, self.region.config().delivery_mode()).await {
            Ok(()) => self.region.telemetry().record_key(Operation::Broadcast, Activity::Sent, &kind),
            Err(error) => self
                .region
                .telemetry()
                .record_error(Operation::Broadcast, Activity::Degraded, Some(&kind), &error),
        }
    }
}

#[cfg(test)]
mod tests {
    use coherence_cluster::{DeliveryMode, LocalCluster, LocalTransport};
    use coherence_store::testing::{MockStore, StoreOp};
    use coherence_store::Timestamp;
    use tick::Clock;

    use super::*;
    use crate::{CommandFlags, CoherenceConfig, RegionRegistry};

    struct Fixture {
        cluster: LocalCluster<String>,
        _peer: LocalTransport<String>,
        store: MockStore<String, String>,
        broadcaster: NonTxInvalidationBroadcaster<MockStore<String, String>, LocalTransport<String>>,
    }

    fn fixture() -> Fixture {
        let registry = RegionRegistry::new(
            Clock::new_frozen(),
            CoherenceConfig::default().with_delivery_mode(DeliveryMode::Async),
        );
        let cluster = LocalCluster::new();
        let local = cluster.join();
        let peer = cluster.join();
        let store = MockStore::new();
        let broadcaster = NonTxInvalidationBroadcaster::new(registry.acquire("r"), Arc::new(store.clone()), Arc::new(local));
        Fixture {
            cluster,
            _peer: peer,
            store,
            broadcaster,
        }
    }

    fn queued(cluster: &LocalCluster<String>) -> Vec<ClusterMessage<String>> {
        cluster.take_pending().into_iter().map(|envelope| envelope.message).collect()
    }

    #[test]
    fn remove_is_broadcast_after_local_success() {
        futures::executor::block_on(async {
            let f = fixture();
            assert!(f.broadcaster.handle(WriteCommand::<_, String>::remove("k".to_string())).await.expect("remove"));
            assert_eq!(
                queued(&f.cluster),
                vec![ClusterMessage::Invalidate { keys: vec!["k".to_string()] }]
            );
        });
    }

    #[test]
    fn failed_remove_is_not_broadcast() {
        futures::executor::block_on(async {
            let f = fixture();
            f.store.fail_when(|op| matches!(op, StoreOp::Remove(_)));
            let result = f.broadcaster.handle(WriteCommand::<_, String>::remove("k".to_string())).await;
            assert!(result.is_err());
            assert!(queued(&f.cluster).is_empty());
        });
    }

    #[test]
    fn cache_fill_is_never_broadcast() {
        futures::executor::block_on(async {
            let f = fixture();
            let fill = WriteCommand::Put {
                key: "k".to_string(),
                value: "v".to_string(),
                as_of: Timestamp::from_millis(5),
                flags: CommandFlags::external_read(),
            };
            assert!(f.broadcaster.handle(fill.clone()).await.expect("fill"));
            assert!(!f.broadcaster.handle(fill).await.expect("second fill"), "slot is taken");
            assert!(queued(&f.cluster).is_empty());
        });
    }

    #[test]
    fn local_only_put_stays_local() {
        futures::executor::block_on(async {
            let f = fixture();
            let put = WriteCommand::Put {
                key: "k".to_string(),
                value: "v".to_string(),
                as_of: Timestamp::from_millis(5),
                flags: CommandFlags::local_only(),
            };
            assert!(f.broadcaster.handle(put).await.expect("put"));
            assert_eq!(f.store.entry_count(), 1);
            assert!(queued(&f.cluster).is_empty());
        });
    }

    #[test]
    fn batch_put_sends_one_message() {
        futures::executor::block_on(async {
            let f = fixture();
            let batch = WriteCommand::BatchPut {
                entries: vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())],
                as_of: Timestamp::from_millis(5),
                flags: CommandFlags::default(),
            };
            assert!(f.broadcaster.handle(batch).await.expect("batch"));
            assert_eq!(
                queued(&f.cluster),
                vec![ClusterMessage::Invalidate {
                    keys: vec!["a".to_string(), "b".to_string()]
                }]
            );
        });
    }

    #[test]
    fn clear_is_broadcast_even_when_local_clear_fails() {
        futures::executor::block_on(async {
            let f = fixture();
            f.store.fail_when(|op| matches!(op, StoreOp::Clear));
            let result = f.broadcaster.handle(WriteCommand::<String, String>::Clear).await;
            assert!(result.is_err());
            assert_eq!(queued(&f.cluster), vec![ClusterMessage::Clear]);
        });
    }
}
