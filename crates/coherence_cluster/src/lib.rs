// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Cluster transport abstractions for cache coherence.
//!
//! The coherence layer needs three things from the cluster: a membership view, a way to
//! [`broadcast`][ClusterTransport::broadcast] a [`ClusterMessage`] to every peer in either
//! [`DeliveryMode::Sync`] or [`DeliveryMode::Async`] mode, and a [`MessageHandler`] callback
//! through which incoming messages are delivered locally.
//!
//! Delivery is assumed to be at-least-once and unordered per peer. Handlers must tolerate
//! duplicates and out-of-order arrival.
//!
//! A transport instance is scoped to one cache region; messages carry keys but no region
//! name.
//!
//! # In-process cluster
//!
//! [`LocalCluster`] connects any number of nodes inside one process. Synchronous
//! broadcasts are delivered before `broadcast` returns. Asynchronous broadcasts are queued
//! until the owner of the cluster calls [`LocalCluster::deliver_pending`], or drains them
//! with [`LocalCluster::take_pending`] to deliver them in any order, or not at all.
//!
//! ```
//! use std::sync::Arc;
//!
//! use coherence_cluster::{ClusterMessage, ClusterTransport, DeliveryMode, LocalCluster, MessageHandler, NodeId};
//! use futures::future::BoxFuture;
//!
//! struct Printer;
//!
//! impl MessageHandler<u32> for Printer {
//!     fn deliver(&self, origin: NodeId, message: ClusterMessage<u32>) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { println!("{origin}: {message:?}") })
//!     }
//! }
//!
//! # futures::executor::block_on(async {
//! let cluster = LocalCluster::new();
//! let a = cluster.join();
//! let b = cluster.join();
//!
//! let printer: Arc<dyn MessageHandler<u32>> = Arc::new(Printer);
//! b.attach(&printer);
//!
//! a.broadcast(ClusterMessage::Invalidate { keys: vec![7] }, DeliveryMode::Sync).await?;
//! # Ok::<(), coherence_store::Error>(())
//! # });
//! ```

mod local;
mod message;
mod transport;

#[doc(inline)]
pub use local::{Envelope, LocalCluster, LocalTransport};
#[doc(inline)]
pub use message::ClusterMessage;
#[doc(inline)]
pub use transport::{ClusterTransport, DeliveryMode, MessageHandler, NodeId};
