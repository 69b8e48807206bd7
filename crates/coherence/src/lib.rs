// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Consistency core of a clustered, write-through second-level cache.
//!
//! Every node keeps its own copy of a region's entries in a [`CacheStore`](coherence_store::CacheStore).
//! This crate decides when a node may write a value loaded from the database into that
//! copy, and tells the other nodes to drop entries that a write made stale:
//!
//! - [`PendingPutRegistry`] records in-flight loads and admits or rejects their cache
//!   fills against per-key invalidations and invalidation windows.
//! - [`RegionInvalidationTracker`] rejects every fill while the whole region is being
//!   cleared, and fills of loads that started before the last clear.
//! - [`CacheAccessDelegate`] and [`TransactionalAccessDelegate`] are the read and write
//!   surface used by the persistence layer.
//! - [`NonTxInvalidationBroadcaster`] and [`TxInvalidationBroadcaster`] fan writes out to
//!   the cluster; [`RemoteInvalidationHandler`] applies them on the receiving side.
//! - [`PutFromLoadWindowCoordinator`] keeps invalidation windows open for the lifetime of
//!   a transaction, and [`DeferredCommitWriter`] stores its outcome once it is known.
//!
//! The protocol is eventually consistent: a value may be dropped when it did not have to
//! be, but a fill never overwrites a newer committed write.
//!
//! # Examples
//!
//! ## Reads and fills
//!
//! ```
//! use coherence::{CacheAccessDelegate, CoherenceConfig, RegionRegistry};
//! use coherence_cluster::LocalCluster;
//! use coherence_store::{InMemoryStore, OwnerToken};
//! use tick::Clock;
//! # futures::executor::block_on(async {
//!
//! let regions = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
//! let cluster = LocalCluster::new();
//! let cache = CacheAccessDelegate::builder::<String, i32>(regions.acquire("orders"))
//!     .store(InMemoryStore::new())
//!     .transport(cluster.join())
//!     .build();
//!
//! let session = OwnerToken::new();
//! let key = "order-1".to_string();
//! let as_of = cache.region().now();
//!
//! // A miss registers the session's load.
//! assert_eq!(cache.get(&key, as_of, session).await?, None);
//! assert!(cache.put_from_load(&key, 42, as_of, session, false).await?);
//!
//! // Removing invalidates the key here and on every other node.
//! cache.remove(key.clone()).await?;
//! assert_eq!(cache.get(&key, as_of, session).await?, None);
//! # Ok::<(), coherence_store::Error>(())
//! # });
//! ```
//!
//! ## Transactions
//!
//! ```
//! use coherence::{CacheAccessDelegate, CoherenceConfig, RegionRegistry, WriteOutcome};
//! use coherence_cluster::LocalCluster;
//! use coherence_store::InMemoryStore;
//! use tick::Clock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), coherence_store::Error> {
//! let regions = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
//! let cluster = LocalCluster::new();
//! let cache = CacheAccessDelegate::builder::<String, i32>(regions.acquire("orders"))
//!     .store(InMemoryStore::new())
//!     .transport(cluster.join())
//!     .build_transactional()?;
//!
//! let tx = cache.begin();
//! cache.update(&tx, "order-1".to_string(), 7).await?;
//! cache.before_completion(&tx).await?;
//!
//! let outcomes = cache.after_completion(&tx, true).await.wait().await;
//! assert_eq!(outcomes, vec![WriteOutcome::Value]);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Timeouts, retry back-off and the delivery mode of non-transactional broadcasts are
//! set per region through [`CoherenceConfig`], passed to [`RegionRegistry`].
//!
//! # Time
//!
//! Regions read wall-clock time and run every timed wait on the [`tick::Clock`] given to
//! [`RegionRegistry::new`]. Under Tokio use `Clock::new_tokio()` from tick's `tokio`
//! feature; lock timeouts and retry delays then need no Tokio timer of their own. Tests
//! drive time with a `tick::ClockControl`.
//!
//! # Features
//!
//! - `metrics`: counts every coherence event with an OpenTelemetry counter; see
//!   [`RegionRegistry::with_metrics`].
//! - `serde`: serialization of [`CoherenceConfig`] and the cluster message types.
//! - `test-util`: the mock store of `coherence_store` and tick's `ClockControl`.

mod access;
mod backoff;
mod broadcast;
mod builder;
mod command;
mod config;
mod deferred;
mod pending;
mod region;
mod remote;
mod runtime;
mod telemetry;
mod transaction;
mod window;

#[doc(inline)]
pub use access::{CacheAccessDelegate, TransactionalAccessDelegate};
#[doc(inline)]
pub use backoff::RetryPolicy;
#[doc(inline)]
pub use broadcast::{NonTxInvalidationBroadcaster, TxInvalidationBroadcaster};
#[doc(inline)]
pub use builder::AccessDelegateBuilder;
#[doc(inline)]
pub use command::{CommandFlags, WriteCommand};
#[doc(inline)]
pub use config::CoherenceConfig;
#[doc(inline)]
pub use deferred::{DeferredCommitWriter, PendingWrites, WriteOutcome};
#[doc(inline)]
pub use pending::{PendingPutRegistry, PutFromLoadLock};
#[doc(inline)]
pub use region::{Region, RegionHandle, RegionInvalidationTracker, RegionRegistry};
#[doc(inline)]
pub use remote::RemoteInvalidationHandler;
#[doc(inline)]
pub use transaction::{TransactionContext, TxPhase};
#[doc(inline)]
pub use window::PutFromLoadWindowCoordinator;
