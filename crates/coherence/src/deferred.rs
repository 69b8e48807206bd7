// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Writes the outcome of completed transactions into the store.

use std::fmt;
use std::sync::Arc;

use coherence_store::{CacheKey, CacheStore, CacheValue, FutureUpdate, Timestamp, WriterToken};
use futures::future::join_all;
use recoverable::{Recovery, RecoveryKind};
use tokio::task::JoinHandle;

use crate::RegionHandle;
use crate::runtime::Runtime;
use crate::telemetry::{Activity, Operation};

/// What a deferred write left in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriteOutcome {
    /// The committed value was written.
    Value,
    /// A tombstone was written: the transaction failed, or it raced a region invalidation.
    Tombstone,
    /// The store already held a newer update for the key; nothing was written.
    Superseded,
    /// The write was given up. The store may still hold an older value.
    Abandoned,
}

/// Finalizes cache state after a transaction completes.
///
/// Every write is a [`FutureUpdate`] with a fresh [`WriterToken`] and a commit timestamp
/// from [`Region::next_timestamp`](crate::Region::next_timestamp), so the store keeps
/// whichever write is newest regardless of arrival order. A transaction that failed, or
/// that started before the region's last full invalidation, writes a tombstone so any
/// stale value already present is cleared.
///
/// Store failures are retried with the region's [`RetryPolicy`](crate::RetryPolicy),
/// sleeping on the region clock between attempts. Failures classified
/// [`RecoveryKind::Never`] are not retried, and a delay the error asks for is honored
/// when it is longer than the policy's.
pub struct DeferredCommitWriter<S> {
    region: RegionHandle,
    store: Arc<S>,
    runtime: Runtime,
}

impl<S> Clone for DeferredCommitWriter<S> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            store: Arc::clone(&self.store),
            runtime: self.runtime.clone(),
        }
    }
}

impl<S> fmt::Debug for DeferredCommitWriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCommitWriter")
            .field("region", &self.region.name())
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl<S> DeferredCommitWriter<S> {
    pub(crate) fn new(region: RegionHandle, store: Arc<S>, runtime: Runtime) -> Self {
        Self { region, store, runtime }
    }

    /// Writes the outcome for `key` and waits until it lands or is abandoned.
    ///
    /// `candidate` is the value the transaction wrote; `None` for a removal.
    pub async fn write<K, V>(&self, key: K, candidate: Option<V>, committed: bool, tx_started_at: Timestamp) -> WriteOutcome
    where
        K: CacheKey,
        V: CacheValue,
        S: CacheStore<K, V>,
    {
        let tracker = self.region.tracker();
        let stale = tracker.is_invalidating() || tx_started_at < tracker.epoch();
        let value = if committed && !stale { candidate } else { None };
        let update = FutureUpdate::new(WriterToken::new(), self.region.next_timestamp(), value);
        let telemetry = self.region.telemetry();

        let mut delays = self.region.config().retry().delays();
        loop {
            match self.store.apply_update(&key, update.clone()).await {
                Ok(true) if update.is_tombstone() => {
                    telemetry.record_key(Operation::DeferredWrite, Activity::Tombstoned, &key);
                    return WriteOutcome::Tombstone;
                }
                Ok(true) => {
                    telemetry.record_key(Operation::DeferredWrite, Activity::Stored, &key);
                    return WriteOutcome::Value;
                }
                Ok(false) => {
                    telemetry.record_key(Operation::DeferredWrite, Activity::Superseded, &key);
                    return WriteOutcome::Superseded;
                }
                Err(error) => {
                    let recovery = error.recovery();
                    let delay = match recovery.kind() {
                        RecoveryKind::Never => None,
                        _ => delays.next(),
                    };
                    let Some(delay) = delay else {
                        telemetry.record_error(Operation::DeferredWrite, Activity::Abandoned, Some(&key), &error);
                        return WriteOutcome::Abandoned;
                    };
                    telemetry.record_error(Operation::DeferredWrite, Activity::Retried, Some(&key), &error);
                    let delay = recovery.get_delay().map_or(delay, |requested| requested.max(delay));
                    self.region.clock().delay(delay).await;
                }
            }
        }
    }

    /// Runs [`write`][Self::write] as a background task.
    pub fn spawn<K, V>(&self, key: K, candidate: Option<V>, committed: bool, tx_started_at: Timestamp) -> JoinHandle<WriteOutcome>
    where
        K: CacheKey,
        V: CacheValue,
        S: CacheStore<K, V> + 'static,
    {
        let writer = self.clone();
        self.runtime
            .spawn(async move { writer.write(key, candidate, committed, tx_started_at).await })
    }
}

/// Deferred writes spawned for one completed transaction.
///
/// The writes run whether or not this value is awaited.
#[derive(Debug, Default)]
pub struct PendingWrites {
    handles: Vec<JoinHandle<WriteOutcome>>,
}

impl PendingWrites {
    pub(crate) fn push(&mut self, handle: JoinHandle<WriteOutcome>) {
        self.handles.push(handle);
    }

    /// Number of spawned writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the transaction wrote nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every write, in spawn order. A task that panicked or was cancelled
    /// counts as [`WriteOutcome::Abandoned`].
    pub async fn wait(self) -> Vec<WriteOutcome> {
        join_all(self.handles)
            .await
            .into_iter()
            .map(|outcome| outcome.unwrap_or(WriteOutcome::Abandoned))
            .collect()
    }
}
