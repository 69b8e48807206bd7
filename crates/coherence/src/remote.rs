// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Applies invalidation messages received from peers.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use coherence_cluster::{ClusterMessage, MessageHandler, NodeId};
use coherence_store::{CacheKey, CacheStore, CacheValue};
use futures::future::BoxFuture;

use crate::PendingPutRegistry;
use crate::pending::RegionInvalidation;
use crate::telemetry::{Activity, Operation};

/// Applies invalidations broadcast by peers to the local node.
///
/// Every message first updates the pending put registry, so a fill racing with the
/// message is rejected, and only then drops the local entries. Messages may arrive
/// duplicated or out of order; an end notice without a matching window is logged and
/// otherwise ignored. Store failures are logged, never returned to the sender.
pub struct RemoteInvalidationHandler<K, V, S> {
    pending: Arc<PendingPutRegistry<K>>,
    store: Arc<S>,
    _value: PhantomData<fn() -> V>,
}

impl<K: CacheKey, V, S> fmt::Debug for RemoteInvalidationHandler<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteInvalidationHandler")
            .field("region", &self.pending.region().name())
            .finish_non_exhaustive()
    }
}

impl<K, V, S> RemoteInvalidationHandler<K, V, S>
where
    K: CacheKey,
    V: CacheValue,
    S: CacheStore<K, V>,
{
    /// Creates a handler for the region `pending` belongs to.
    #[must_use]
    pub fn new(pending: Arc<PendingPutRegistry<K>>, store: Arc<S>) -> Self {
        Self {
            pending,
            store,
            _value: PhantomData,
        }
    }

    /// Applies one message from `origin`.
    pub async fn apply(&self, origin: NodeId, message: ClusterMessage<K>) {
        tracing::debug!(cache.region = self.pending.region().name(), cache.origin = %origin, cache.message = message.kind(), "cache.remote_message");
        match message {
            ClusterMessage::Invalidate { keys } => {
                for key in keys {
                    let _ = self.pending.invalidate_key(&key).await;
                    self.remove(&key).await;
                }
            }
            ClusterMessage::BeginInvalidation { keys, owner } => {
                for key in keys {
                    let _ = self.pending.begin_invalidating_key(owner, &key).await;
                    self.remove(&key).await;
                }
            }
            ClusterMessage::EndInvalidation { keys, owner } => {
                for key in keys {
                    if !self.pending.end_invalidating_key(owner, &key).await {
                        self.pending
                            .region()
                            .telemetry()
                            .record_key(Operation::Remote, Activity::ProtocolViolation, &key);
                    }
                }
            }
            ClusterMessage::Clear => {
                let invalidation = RegionInvalidation::begin(&self.pending).await;
                if let Err(error) = self.store.clear().await {
                    self.pending
                        .region()
                        .telemetry()
                        .record_error(Operation::Remote, Activity::Error, None, &error);
                }
                drop(invalidation);
            }
        }
    }

    async fn remove(&self, key: &K) {
        if let Err(error) = self.store.remove(key).await {
            self.pending
                .region()
                .telemetry()
                .record_error(Operation::Remote, Activity::Error, Some(key), &error);
        }
    }
}

impl<K, V, S> MessageHandler<K> for RemoteInvalidationHandler<K, V, S>
where
    K: CacheKey,
    V: CacheValue,
    S: CacheStore<K, V>,
{
    fn deliver(&self, origin: NodeId, message: ClusterMessage<K>) -> BoxFuture<'_, ()> {
        Box::pin(self.apply(origin, message))
    }
}
