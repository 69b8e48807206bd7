// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process cluster with deterministic delivery.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::{Arc, Weak},
};

use coherence_store::Error;
use parking_lot::Mutex;

use crate::{ClusterMessage, ClusterTransport, DeliveryMode, MessageHandler, NodeId};

/// A message in transit between two nodes of a [`LocalCluster`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope<K> {
    /// The sending node.
    pub origin: NodeId,
    /// The receiving node.
    pub target: NodeId,
    /// The payload.
    pub message: ClusterMessage<K>,
}

struct Member<K> {
    handler: Option<Weak<dyn MessageHandler<K>>>,
}

struct ClusterState<K> {
    next_id: u64,
    members: BTreeMap<NodeId, Member<K>>,
    unreachable: BTreeSet<NodeId>,
    in_flight: VecDeque<Envelope<K>>,
}

impl<K> ClusterState<K> {
    fn handler(&self, node: NodeId) -> Option<Arc<dyn MessageHandler<K>>> {
        self.members.get(&node)?.handler.as_ref()?.upgrade()
    }
}

/// A cluster whose members all live in the current process.
///
/// Clones refer to the same cluster. Nodes join with [`LocalCluster::join`] and receive
/// messages through the handler attached to their [`LocalTransport`].
pub struct LocalCluster<K> {
    state: Arc<Mutex<ClusterState<K>>>,
}

impl<K> fmt::Debug for LocalCluster<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalCluster")
            .field("members", &state.members.keys().collect::<Vec<_>>())
            .field("unreachable", &state.unreachable)
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl<K> Clone for LocalCluster<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K> Default for LocalCluster<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LocalCluster<K> {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                next_id: 1,
                members: BTreeMap::new(),
                unreachable: BTreeSet::new(),
                in_flight: VecDeque::new(),
            })),
        }
    }

    /// Adds a node and returns its transport.
    #[must_use]
    pub fn join(&self) -> LocalTransport<K> {
        let mut state = self.state.lock();
        let node = NodeId::new(state.next_id);
        state.next_id += 1;
        state.members.insert(node, Member { handler: None });
        LocalTransport {
            node,
            cluster: self.clone(),
        }
    }

    /// Removes a node from the membership view.
    pub fn leave(&self, node: NodeId) {
        let _ = self.state.lock().members.remove(&node);
    }

    /// Marks `node` as unreachable (or reachable again).
    ///
    /// Synchronous broadcasts that include an unreachable peer fail, asynchronous
    /// messages addressed to it are dropped.
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(node);
        } else {
            state.unreachable.remove(&node);
        }
    }

    /// Number of queued asynchronous messages.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Drains the asynchronous queue without delivering anything.
    ///
    /// Pass the envelopes to [`LocalCluster::deliver`] in any order to simulate
    /// reordering, or drop them to simulate loss.
    #[must_use]
    pub fn take_pending(&self) -> Vec<Envelope<K>> {
        self.state.lock().in_flight.drain(..).collect()
    }

    /// Delivers one envelope to its target.
    ///
    /// Returns `false` if the target is unreachable, has left, or has no live handler.
    pub async fn deliver(&self, envelope: Envelope<K>) -> bool {
        let handler = {
            let state = self.state.lock();
            if state.unreachable.contains(&envelope.target) {
                None
            } else {
                state.handler(envelope.target)
            }
        };

        match handler {
            Some(handler) => {
                handler.deliver(envelope.origin, envelope.message).await;
                true
            }
            None => {
                tracing::debug!(target_node = %envelope.target, "cluster.message_dropped");
                false
            }
        }
    }

    /// Delivers queued asynchronous messages in FIFO order until the queue is empty.
    ///
    /// Messages queued by handlers during delivery are delivered as well. Returns the
    /// number of messages that reached a handler.
    pub async fn deliver_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.state.lock().in_flight.pop_front();
            let Some(envelope) = next else {
                return delivered;
            };
            if self.deliver(envelope).await {
                delivered += 1;
            }
        }
    }
}

/// One node's view of a [`LocalCluster`].
pub struct LocalTransport<K> {
    node: NodeId,
    cluster: LocalCluster<K>,
}

impl<K> fmt::Debug for LocalTransport<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport").field("node", &self.node).finish_non_exhaustive()
    }
}

impl<K> LocalTransport<K> {
    /// The cluster this transport belongs to.
    #[must_use]
    pub fn cluster(&self) -> &LocalCluster<K> {
        &self.cluster
    }
}

impl<K> ClusterTransport<K> for LocalTransport<K>
where
    K: Clone + Send + Sync,
{
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn members(&self) -> Vec<NodeId> {
        self.cluster.state.lock().members.keys().copied().collect()
    }

    fn attach(&self, handler: &Arc<dyn MessageHandler<K>>) {
        if let Some(member) = self.cluster.state.lock().members.get_mut(&self.node) {
            member.handler = Some(Arc::downgrade(handler));
        }
    }

    async fn broadcast(&self, message: ClusterMessage<K>, mode: DeliveryMode) -> Result<(), Error> {
        match mode {
            DeliveryMode::Sync => {
                let (handlers, unreachable) = {
                    let state = self.cluster.state.lock();
                    let mut handlers = Vec::new();
                    let mut unreachable = Vec::new();
                    for &peer in state.members.keys().filter(|&&peer| peer != self.node) {
                        if state.unreachable.contains(&peer) {
                            unreachable.push(peer);
                        } else if let Some(handler) = state.handler(peer) {
                            handlers.push(handler);
                        }
                    }
                    (handlers, unreachable)
                };

                for handler in handlers {
                    handler.deliver(self.node, message.clone()).await;
                }

                if unreachable.is_empty() {
                    Ok(())
                } else {
                    let peers = unreachable.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                    Err(Error::transient(format!("{} not acknowledged by {peers}", message.kind())))
                }
            }
            DeliveryMode::Async => {
                let mut state = self.cluster.state.lock();
                let targets = state
                    .members
                    .keys()
                    .copied()
                    .filter(|&peer| peer != self.node && !state.unreachable.contains(&peer))
                    .collect::<Vec<_>>();
                for target in targets {
                    state.in_flight.push_back(Envelope {
                        origin: self.node,
                        target,
                        message: message.clone(),
                    });
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::BoxFuture;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(NodeId, ClusterMessage<u32>)>>,
    }

    impl MessageHandler<u32> for Recorder {
        fn deliver(&self, origin: NodeId, message: ClusterMessage<u32>) -> BoxFuture<'_, ()> {
            Box::pin(async move { self.received.lock().push((origin, message)) })
        }
    }

    fn recorder(transport: &LocalTransport<u32>) -> (Arc<Recorder>, Arc<dyn MessageHandler<u32>>) {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn MessageHandler<u32>> = Arc::clone(&recorder) as Arc<dyn MessageHandler<u32>>;
        transport.attach(&handler);
        (recorder, handler)
    }

    #[test]
    fn join_assigns_distinct_nodes() {
        let cluster = LocalCluster::<u32>::new();
        let a = cluster.join();
        let b = cluster.join();
        assert_ne!(a.local_node(), b.local_node());
        assert_eq!(a.members(), vec![a.local_node(), b.local_node()]);

        cluster.leave(b.local_node());
        assert_eq!(a.members(), vec![a.local_node()]);
    }

    #[test]
    fn sync_broadcast_skips_sender() {
        futures::executor::block_on(async {
            let cluster = LocalCluster::new();
            let a = cluster.join();
            let b = cluster.join();
            let (seen_a, _ha) = recorder(&a);
            let (seen_b, _hb) = recorder(&b);

            a.broadcast(ClusterMessage::Invalidate { keys: vec![1] }, DeliveryMode::Sync)
                .await
                .expect("broadcast should succeed");

            assert!(seen_a.received.lock().is_empty());
            assert_eq!(
                *seen_b.received.lock(),
                vec![(a.local_node(), ClusterMessage::Invalidate { keys: vec![1] })]
            );
        });
    }

    #[test]
    fn sync_broadcast_fails_for_unreachable_peer_but_reaches_others() {
        futures::executor::block_on(async {
            let cluster = LocalCluster::new();
            let a = cluster.join();
            let b = cluster.join();
            let c = cluster.join();
            let (seen_b, _hb) = recorder(&b);
            let (seen_c, _hc) = recorder(&c);
            cluster.set_unreachable(c.local_node(), true);

            let err = a
                .broadcast(ClusterMessage::Clear, DeliveryMode::Sync)
                .await
                .expect_err("unreachable peer should fail the broadcast");
            assert!(err.to_string().contains("node-3"));
            assert_eq!(seen_b.received.lock().len(), 1);
            assert!(seen_c.received.lock().is_empty());
        });
    }

    #[test]
    fn async_broadcast_queues_until_delivered() {
        futures::executor::block_on(async {
            let cluster = LocalCluster::new();
            let a = cluster.join();
            let b = cluster.join();
            let (seen_b, _hb) = recorder(&b);

            a.broadcast(ClusterMessage::Clear, DeliveryMode::Async)
                .await
                .expect("async broadcast never fails");
            assert!(seen_b.received.lock().is_empty());
            assert_eq!(cluster.pending_count(), 1);

            assert_eq!(cluster.deliver_pending().await, 1);
            assert_eq!(seen_b.received.lock().len(), 1);
        });
    }

    #[test]
    fn async_messages_to_unreachable_peers_are_dropped() {
        futures::executor::block_on(async {
            let cluster = LocalCluster::<u32>::new();
            let a = cluster.join();
            let b = cluster.join();
            cluster.set_unreachable(b.local_node(), true);

            a.broadcast(ClusterMessage::Clear, DeliveryMode::Async).await.expect("queued");
            assert_eq!(cluster.pending_count(), 0);
        });
    }

    #[test]
    fn dropped_handler_is_not_called() {
        struct Counter(Arc<AtomicUsize>);

        impl MessageHandler<u32> for Counter {
            fn deliver(&self, _origin: NodeId, _message: ClusterMessage<u32>) -> BoxFuture<'_, ()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }
        }

        futures::executor::block_on(async {
            let cluster = LocalCluster::<u32>::new();
            let a = cluster.join();
            let b = cluster.join();
            let calls = Arc::new(AtomicUsize::new(0));
            let handler: Arc<dyn MessageHandler<u32>> = Arc::new(Counter(Arc::clone(&calls)));
            b.attach(&handler);
            drop(handler);

            a.broadcast(ClusterMessage::Clear, DeliveryMode::Async).await.expect("queued");
            assert_eq!(cluster.deliver_pending().await, 0);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn take_pending_allows_reordering() {
        futures::executor::block_on(async {
            let cluster = LocalCluster::new();
            let a = cluster.join();
            let b = cluster.join();
            let (seen_b, _hb) = recorder(&b);

            a.broadcast(ClusterMessage::Invalidate { keys: vec![1] }, DeliveryMode::Async)
                .await
                .expect("queued");
            a.broadcast(ClusterMessage::Invalidate { keys: vec![2] }, DeliveryMode::Async)
                .await
                .expect("queued");

            let mut pending = cluster.take_pending();
            pending.reverse();
            for envelope in pending {
                assert!(cluster.deliver(envelope).await);
            }

            let keys = seen_b
                .received
                .lock()
                .iter()
                .map(|(_, message)| message.keys().to_vec())
                .collect::<Vec<_>>();
            assert_eq!(keys, vec![vec![2], vec![1]]);
        });
    }
}
