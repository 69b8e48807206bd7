// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The transport seam between the coherence layer and cluster membership.

use std::{fmt, sync::Arc};

use coherence_store::Error;
use futures::future::BoxFuture;

use crate::ClusterMessage;

/// Identifies one member of the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a node identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// How a broadcast waits for its peers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeliveryMode {
    /// Wait until every peer has handled the message. Fails if any peer cannot be reached.
    #[default]
    Sync,
    /// Return as soon as the message is handed to the transport.
    Async,
}

/// The transport a region uses to talk to its peers.
pub trait ClusterTransport<K>: Send + Sync {
    /// The node this transport belongs to.
    fn local_node(&self) -> NodeId;

    /// Current membership, including the local node.
    fn members(&self) -> Vec<NodeId>;

    /// Sends `message` to every member except the local node.
    ///
    /// In [`DeliveryMode::Sync`] the returned future completes after every reachable
    /// peer has handled the message, and fails if any peer was unreachable. In
    /// [`DeliveryMode::Async`] it completes once the message is queued; loss is silent.
    fn broadcast(&self, message: ClusterMessage<K>, mode: DeliveryMode) -> impl Future<Output = Result<(), Error>> + Send;

    /// Routes messages addressed to the local node to `handler`.
    ///
    /// Transports keep only a weak reference; the caller owns the handler, and
    /// messages arriving after it is dropped are discarded.
    fn attach(&self, handler: &Arc<dyn MessageHandler<K>>);
}

/// Receives messages broadcast by other nodes.
///
/// Delivery may be duplicated or reordered; implementations must tolerate both.
pub trait MessageHandler<K>: Send + Sync {
    /// Handles one message from `origin`.
    fn deliver(&self, origin: NodeId, message: ClusterMessage<K>) -> BoxFuture<'_, ()>;
}
