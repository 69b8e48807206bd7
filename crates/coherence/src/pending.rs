// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key bookkeeping of in-flight loads and invalidation windows.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use coherence_store::{CacheKey, OwnerToken, Timestamp};
use dashmap::DashMap;
use tick::FutureExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::telemetry::{Activity, Operation};
use crate::{CoherenceConfig, RegionHandle};

#[derive(Debug, Clone, Copy)]
struct PendingPut {
    as_of: Timestamp,
    recorded_at: Timestamp,
    invalidated: bool,
}

#[derive(Debug, Clone, Copy)]
struct InvalidationWindow {
    owner: OwnerToken,
    opened_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    RegionInvalid,
    WindowOpen,
    StaleLoad,
    PendingInvalidated,
    NakedTooSoon,
}

impl Rejection {
    fn as_str(self) -> &'static str {
        match self {
            Self::RegionInvalid => "region invalidated",
            Self::WindowOpen => "invalidation window held by another owner",
            Self::StaleLoad => "load predates last invalidation",
            Self::PendingInvalidated => "pending put was invalidated",
            Self::NakedTooSoon => "unregistered put within invalidation period",
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    pending: HashMap<OwnerToken, PendingPut>,
    windows: Vec<InvalidationWindow>,
    last_invalidation: Option<Timestamp>,
}

impl KeyState {
    /// Drops pending puts and windows that outlived their limits. Returns how many were dropped.
    fn expire(&mut self, now: Timestamp, config: &CoherenceConfig) -> usize {
        let pending_before = self.pending.len();
        let max_age = config.pending_put_max_age();
        self.pending
            .retain(|_, put| now.saturating_duration_since(put.recorded_at) <= max_age);

        let windows_before = self.windows.len();
        let timeout = config.invalidation_window_timeout();
        self.windows
            .retain(|window| now.saturating_duration_since(window.opened_at) <= timeout);

        (pending_before - self.pending.len()) + (windows_before - self.windows.len())
    }

    fn is_idle(&self, now: Timestamp, config: &CoherenceConfig) -> bool {
        let retention = retention(config);
        self.pending.is_empty()
            && self.windows.is_empty()
            && self
                .last_invalidation
                .is_none_or(|at| now.saturating_duration_since(at) > retention)
    }

    fn invalidate(&mut self, now: Timestamp) {
        for put in self.pending.values_mut() {
            put.invalidated = true;
        }
        self.last_invalidation = Some(self.last_invalidation.map_or(now, |at| at.max(now)));
    }

    fn has_foreign_window(&self, owner: OwnerToken) -> bool {
        self.windows.iter().any(|window| window.owner != owner)
    }

    fn predates_invalidation(&self, as_of: Timestamp) -> bool {
        self.last_invalidation.is_some_and(|at| as_of <= at)
    }

    fn admit(&mut self, owner: OwnerToken, as_of: Timestamp, now: Timestamp, region_epoch: Timestamp, period: Duration) -> Result<(), Rejection> {
        // Every decision consumes the registration.
        let registration = self.pending.remove(&owner);
        let loaded_at = registration.map_or(as_of, |put| put.as_of.min(as_of));
        if self.has_foreign_window(owner) {
            return Err(Rejection::WindowOpen);
        }
        if self.predates_invalidation(loaded_at) {
            return Err(Rejection::StaleLoad);
        }

        match registration {
            Some(put) if put.invalidated => Err(Rejection::PendingInvalidated),
            Some(_) => Ok(()),
            None => {
                let recently = |at: Timestamp| now <= at.saturating_add(period);
                let key_recent = self.last_invalidation.is_some_and(recently);
                let region_recent = region_epoch != Timestamp::ZERO && recently(region_epoch);
                if key_recent || region_recent {
                    Err(Rejection::NakedTooSoon)
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// How long an invalidation keeps influencing admission decisions for its key.
fn retention(config: &CoherenceConfig) -> Duration {
    config.naked_put_invalidation_period().max(config.pending_put_max_age())
}

type KeyCell = Arc<Mutex<KeyState>>;

/// Permission to write one loaded value into the store.
///
/// While held, invalidations of the same key wait, so an admitted value cannot land after
/// an invalidation that started later. Hand it back with
/// [`PendingPutRegistry::release_put_from_load_lock`].
#[must_use = "the lock blocks invalidations of its key until released"]
pub struct PutFromLoadLock<K> {
    key: K,
    owner: OwnerToken,
    guard: OwnedMutexGuard<KeyState>,
}

impl<K: fmt::Debug> fmt::Debug for PutFromLoadLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutFromLoadLock")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .finish()
    }
}

impl<K> PutFromLoadLock<K> {
    /// The key this lock admits a write for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The owner the lock was granted to.
    pub fn owner(&self) -> OwnerToken {
        self.owner
    }
}

/// Tracks pending puts and invalidation windows for every key of one region.
///
/// State is sharded by key; operations on different keys never contend. Each key's
/// state is guarded by an async mutex that an admitted put holds while it writes and
/// that invalidations take before they return. All waits are bounded by the region's
/// [`CoherenceConfig`] timeouts and measured on the region's [`tick::Clock`], so they work on
/// any executor whose clock is driven.
///
/// Per-key state that carries no information is removed again, so memory stays
/// proportional to the keys currently in flux. Keys abandoned mid-load are reclaimed by
/// a sweep that admission runs at most once per retention period.
pub struct PendingPutRegistry<K> {
    region: RegionHandle,
    keys: DashMap<K, KeyCell>,
    next_sweep: AtomicU64,
}

impl<K: CacheKey> fmt::Debug for PendingPutRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPutRegistry")
            .field("region", &self.region.name())
            .field("tracked_keys", &self.keys.len())
            .finish()
    }
}

impl<K: CacheKey> PendingPutRegistry<K> {
    /// Creates an empty registry for `region`.
    #[must_use]
    pub fn new(region: RegionHandle) -> Self {
        let first_sweep = region.now().saturating_add(retention(region.config()));
        Self {
            region,
            keys: DashMap::new(),
            next_sweep: AtomicU64::new(first_sweep.as_millis()),
        }
    }

    /// The region this registry belongs to.
    #[must_use]
    pub fn region(&self) -> &RegionHandle {
        &self.region
    }

    fn config(&self) -> &CoherenceConfig {
        self.region.config()
    }

    fn cell(&self, key: &K) -> KeyCell {
        if let Some(cell) = self.keys.get(key) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.keys.entry(key.clone()).or_default().value())
    }

    fn existing_cell(&self, key: &K) -> Option<KeyCell> {
        self.keys.get(key).map(|cell| Arc::clone(cell.value()))
    }

    async fn lock_within(&self, cell: &KeyCell, limit: Duration) -> Option<OwnedMutexGuard<KeyState>> {
        if let Ok(guard) = Arc::clone(cell).try_lock_owned() {
            return Some(guard);
        }
        Arc::clone(cell)
            .lock_owned()
            .timeout(self.region.clock(), limit)
            .await
            .ok()
    }

    fn purge_if_due(&self) {
        let now = self.region.now();
        let deadline = self.next_sweep.load(Ordering::Acquire);
        if now.as_millis() < deadline {
            return;
        }

        let next = now.saturating_add(retention(self.config())).as_millis();
        if self
            .next_sweep
            .compare_exchange(deadline, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.purge_expired();
        }
    }

    fn release_if_idle(&self, key: &K) {
        let now = self.region.now();
        let config = self.config();
        let _ = self.keys.remove_if(key, |_, cell| {
            Arc::strong_count(cell) == 1 && cell.try_lock().is_ok_and(|state| state.is_idle(now, config))
        });
    }

    /// Records that `owner` is loading `key` as of `as_of`.
    ///
    /// Never blocks. Returns `false` without recording anything when the key is busy, is
    /// being invalidated by another owner, or was invalidated after `as_of`; the later put
    /// is then treated as unregistered. Registering the same `(owner, key)` twice keeps
    /// the first registration.
    pub fn register_pending_put(&self, owner: OwnerToken, key: &K, as_of: Timestamp) -> bool {
        self.purge_if_due();
        let registered = {
            let cell = self.cell(key);
            match cell.try_lock() {
                Ok(mut state) => {
                    let now = self.region.now();
                    state.expire(now, self.config());
                    if state.has_foreign_window(owner) || state.predates_invalidation(as_of) {
                        false
                    } else {
                        // An invalidated registration belongs to an earlier load; replace it.
                        if state.pending.get(&owner).is_none_or(|put| put.invalidated) {
                            let _ = state.pending.insert(
                                owner,
                                PendingPut {
                                    as_of,
                                    recorded_at: now,
                                    invalidated: false,
                                },
                            );
                        }
                        true
                    }
                }
                Err(_) => false,
            }
        };

        let activity = if registered { Activity::Registered } else { Activity::Skipped };
        self.region.telemetry().record_key(Operation::RegisterPendingPut, activity, key);
        if !registered {
            self.release_if_idle(key);
        }
        registered
    }

    /// Decides whether `owner` may cache the value of `key` it loaded as of `as_of`.
    ///
    /// Returns `None` when the put must be skipped:
    /// - the region is being invalidated, or was invalidated after `as_of`;
    /// - another owner holds an invalidation window for `key`;
    /// - `key` was invalidated at or after `as_of`, or while the load was pending;
    /// - the put was never registered and `key` or the region was invalidated within the
    ///   naked-put invalidation period;
    /// - the per-key lock could not be taken within the configured timeout.
    ///
    /// An admitted put consumes the owner's pending registration.
    pub async fn acquire_put_from_load_lock(&self, owner: OwnerToken, key: &K, as_of: Timestamp) -> Option<PutFromLoadLock<K>> {
        self.purge_if_due();
        let tracker = self.region.tracker();
        if !tracker.admits(as_of) {
            self.reject(key, Rejection::RegionInvalid);
            return None;
        }

        let guard = {
            let cell = self.cell(key);
            self.lock_within(&cell, self.config().put_from_load_lock_timeout()).await
        };
        let Some(mut state) = guard else {
            self.region
                .telemetry()
                .record_key(Operation::PutFromLoad, Activity::Rejected, key);
            self.release_if_idle(key);
            return None;
        };

        let now = self.region.now();
        let _ = state.expire(now, self.config());
        let decision = if tracker.admits(as_of) {
            state.admit(owner, as_of, now, tracker.epoch(), self.config().naked_put_invalidation_period())
        } else {
            Err(Rejection::RegionInvalid)
        };

        match decision {
            Ok(()) => {
                self.region
                    .telemetry()
                    .record_key(Operation::PutFromLoad, Activity::Admitted, key);
                Some(PutFromLoadLock {
                    key: key.clone(),
                    owner,
                    guard: state,
                })
            }
            Err(rejection) => {
                drop(state);
                self.reject(key, rejection);
                self.release_if_idle(key);
                None
            }
        }
    }

    fn reject(&self, key: &K, rejection: Rejection) {
        self.region
            .telemetry()
            .record_key(Operation::PutFromLoad, Activity::Rejected, &(key, rejection.as_str()));
    }

    /// Releases a lock returned by [`acquire_put_from_load_lock`][Self::acquire_put_from_load_lock].
    ///
    /// Call it after the store write, whatever its outcome.
    pub fn release_put_from_load_lock(&self, lock: PutFromLoadLock<K>) {
        let PutFromLoadLock { key, guard, .. } = lock;
        drop(guard);
        self.release_if_idle(&key);
    }

    /// Opens an invalidation window for `key` held by `owner`.
    ///
    /// Pending puts for `key` are invalidated and, once this returns, no admitted put for
    /// `key` is still writing. Returns `false` if the per-key lock could not be taken
    /// within the invalidation timeout; callers proceed anyway.
    pub async fn begin_invalidating_key(&self, owner: OwnerToken, key: &K) -> bool {
        let guard = {
            let cell = self.cell(key);
            self.lock_within(&cell, self.config().invalidation_lock_timeout()).await
        };
        let Some(mut state) = guard else {
            self.region
                .telemetry()
                .record_key(Operation::BeginInvalidatingKey, Activity::Degraded, key);
            return false;
        };

        let now = self.region.now();
        let _ = state.expire(now, self.config());
        state.invalidate(now);
        if !state.windows.iter().any(|window| window.owner == owner) {
            state.windows.push(InvalidationWindow { owner, opened_at: now });
        }
        drop(state);

        self.region
            .telemetry()
            .record_key(Operation::BeginInvalidatingKey, Activity::WindowOpened, key);
        true
    }

    /// Closes the invalidation window `owner` holds for `key`.
    ///
    /// Idempotent. Returns `false` if there was no such window, which happens when
    /// messages arrive out of order or the window was already reclaimed.
    pub async fn end_invalidating_key(&self, owner: OwnerToken, key: &K) -> bool {
        let Some(cell) = self.existing_cell(key) else {
            return false;
        };
        let guard = self.lock_within(&cell, self.config().invalidation_lock_timeout()).await;
        drop(cell);
        let Some(mut state) = guard else {
            self.region
                .telemetry()
                .record_key(Operation::EndInvalidatingKey, Activity::Degraded, key);
            return false;
        };

        let now = self.region.now();
        let before = state.windows.len();
        state.windows.retain(|window| window.owner != owner);
        let closed = state.windows.len() < before;
        if closed {
            state.invalidate(now);
        }
        drop(state);

        if closed {
            self.region
                .telemetry()
                .record_key(Operation::EndInvalidatingKey, Activity::WindowClosed, key);
        }
        self.release_if_idle(key);
        closed
    }

    /// Invalidates `key` without opening a window.
    ///
    /// Used for writes that are not scoped to a transaction. Returns `false` if the
    /// per-key lock could not be taken in time.
    pub async fn invalidate_key(&self, key: &K) -> bool {
        let guard = {
            let cell = self.cell(key);
            self.lock_within(&cell, self.config().invalidation_lock_timeout()).await
        };
        let Some(mut state) = guard else {
            self.region
                .telemetry()
                .record_key(Operation::InvalidateKey, Activity::Degraded, key);
            return false;
        };

        let now = self.region.now();
        let _ = state.expire(now, self.config());
        state.invalidate(now);
        drop(state);

        self.region
            .telemetry()
            .record_key(Operation::InvalidateKey, Activity::Invalidated, key);
        true
    }

    /// Marks the whole region as being invalidated.
    ///
    /// Every admission check fails until [`end_invalidating_region`][Self::end_invalidating_region]
    /// is called as many times as this was. Pending puts of every tracked key are
    /// invalidated; returns `false` if some key could not be locked in time.
    pub async fn begin_invalidating_region(&self) -> bool {
        self.region.tracker().begin(self.region.now());

        let cells: Vec<KeyCell> = self.keys.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut complete = true;
        for cell in cells {
            match self.lock_within(&cell, self.config().invalidation_lock_timeout()).await {
                Some(mut state) => state.invalidate(self.region.now()),
                None => complete = false,
            }
        }

        let activity = if complete { Activity::Invalidated } else { Activity::Degraded };
        self.region.telemetry().record(Operation::InvalidateRegion, activity);
        complete
    }

    /// Ends one region invalidation. Returns `false` if none was in progress.
    pub fn end_invalidating_region(&self) -> bool {
        self.region.tracker().end(self.region.now())
    }

    /// Reclaims expired pending puts and windows of every key and forgets keys left
    /// idle. Returns how many puts and windows were reclaimed.
    ///
    /// Admission calls this on its own once per retention period.
    pub fn purge_expired(&self) -> usize {
        let now = self.region.now();
        let config = self.config();
        let mut reclaimed = 0;
        self.keys.retain(|_, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            match cell.try_lock() {
                Ok(mut state) => {
                    reclaimed += state.expire(now, config);
                    !state.is_idle(now, config)
                }
                Err(_) => true,
            }
        });

        if reclaimed > 0 {
            self.region.telemetry().record(Operation::Purge, Activity::Reclaimed);
        }
        reclaimed
    }

    /// Whether `owner` has a live pending put for `key`.
    pub async fn has_pending_put(&self, owner: OwnerToken, key: &K) -> bool {
        let Some(cell) = self.existing_cell(key) else {
            return false;
        };
        let state = cell.lock().await;
        state.pending.contains_key(&owner)
    }

    /// Owners of the invalidation windows currently open for `key`.
    pub async fn open_windows(&self, key: &K) -> Vec<OwnerToken> {
        let Some(cell) = self.existing_cell(key) else {
            return Vec::new();
        };
        let state = cell.lock().await;
        state.windows.iter().map(|window| window.owner).collect()
    }

    /// Number of keys with tracked state.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }
}

/// Keeps a region invalidation open until dropped.
///
/// Ending the invalidation on drop means it also ends when the surrounding future is
/// cancelled or a step in between fails.
pub(crate) struct RegionInvalidation<'a, K: CacheKey> {
    registry: &'a PendingPutRegistry<K>,
}

impl<'a, K: CacheKey> RegionInvalidation<'a, K> {
    pub(crate) async fn begin(registry: &'a PendingPutRegistry<K>) -> Self {
        let invalidation = Self { registry };
        let _ = registry.begin_invalidating_region().await;
        invalidation
    }
}

impl<K: CacheKey> Drop for RegionInvalidation<'_, K> {
    fn drop(&mut self) {
        let _ = self.registry.end_invalidating_region();
    }
}
