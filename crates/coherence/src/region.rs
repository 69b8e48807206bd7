// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache regions, their invalidation epoch, and the registry that owns them.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use coherence_store::Timestamp;
#[cfg(any(feature = "metrics", test))]
use opentelemetry::metrics::{Meter, MeterProvider};
use parking_lot::Mutex;
use tick::Clock;

use crate::CoherenceConfig;
use crate::telemetry::Telemetry;

/// Tracks full-region invalidations.
///
/// The epoch is the time of the most recent region invalidation and never moves
/// backwards. While at least one invalidation is in progress the region admits nothing.
/// Overlapping invalidations nest: the region reopens when the last one ends.
#[derive(Debug, Default)]
pub struct RegionInvalidationTracker {
    epoch: AtomicU64,
    in_progress: AtomicUsize,
}

impl RegionInvalidationTracker {
    /// Creates a tracker for a region that has never been invalidated.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an invalidation and advances the epoch to `now`.
    pub fn begin(&self, now: Timestamp) {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_max(now.as_millis(), Ordering::SeqCst);
    }

    /// Ends an invalidation and advances the epoch to `now`.
    ///
    /// Returns `false` if no invalidation was in progress.
    pub fn end(&self, now: Timestamp) -> bool {
        let ended = self
            .in_progress
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
            .is_ok();
        if ended {
            self.epoch.fetch_max(now.as_millis(), Ordering::SeqCst);
        }
        ended
    }

    /// Time of the latest invalidation, or [`Timestamp::ZERO`] if there was none.
    #[must_use]
    pub fn epoch(&self) -> Timestamp {
        Timestamp::from_millis(self.epoch.load(Ordering::SeqCst))
    }

    /// Whether an invalidation is in progress.
    #[must_use]
    pub fn is_invalidating(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst) > 0
    }

    /// Whether a value loaded as of `as_of` may be cached.
    #[must_use]
    pub fn admits(&self, as_of: Timestamp) -> bool {
        !self.is_invalidating() && as_of >= self.epoch()
    }
}

/// A named partition of the cache, invalidated as a unit.
pub struct Region {
    name: Arc<str>,
    clock: Clock,
    config: CoherenceConfig,
    tracker: RegionInvalidationTracker,
    last_timestamp: AtomicU64,
    telemetry: Telemetry,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl Region {
    fn new(name: Arc<str>, clock: Clock, config: CoherenceConfig, telemetry: Telemetry) -> Self {
        Self {
            name,
            clock,
            config,
            tracker: RegionInvalidationTracker::new(),
            last_timestamp: AtomicU64::new(0),
            telemetry,
        }
    }

    /// The region name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The region configuration.
    #[must_use]
    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    /// The clock the region reads time from.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp::now(&self.clock)
    }

    /// A timestamp strictly greater than every timestamp previously returned for this region.
    ///
    /// Follows the wall clock, bumping by one millisecond when the clock has not moved.
    #[must_use]
    pub fn next_timestamp(&self) -> Timestamp {
        let now = self.now().as_millis();
        let (Ok(previous) | Err(previous)) = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last.saturating_add(1))));
        Timestamp::from_millis(now.max(previous.saturating_add(1)))
    }

    /// The full-region invalidation tracker.
    #[must_use]
    pub fn tracker(&self) -> &RegionInvalidationTracker {
        &self.tracker
    }

    /// `false` while a full-region invalidation is in progress.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.tracker.is_invalidating()
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }
}

struct Slot {
    region: Arc<Region>,
    refs: usize,
}

struct RegistryInner {
    clock: Clock,
    defaults: CoherenceConfig,
    #[cfg(any(feature = "metrics", test))]
    meter: Option<Meter>,
    regions: Mutex<HashMap<Arc<str>, Slot>>,
}

/// Owns every live region of a process.
///
/// The registry is created once at startup and passed by handle to the components that
/// need regions. [`acquire`][Self::acquire] returns a [`RegionHandle`]; each handle (and
/// each clone of one) counts as a reference, and the region is torn down when the last
/// reference is dropped.
///
/// # Examples
///
/// ```
/// use coherence::{CoherenceConfig, RegionRegistry};
/// use tick::Clock;
///
/// let registry = RegionRegistry::new(Clock::new_frozen(), CoherenceConfig::default());
///
/// let users = registry.acquire("users");
/// let again = registry.acquire("users");
/// assert_eq!(registry.ref_count("users"), 2);
///
/// drop(users);
/// drop(again);
/// assert!(registry.regions().is_empty());
/// ```
#[derive(Clone)]
pub struct RegionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for RegionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionRegistry")
            .field("regions", &self.regions())
            .finish_non_exhaustive()
    }
}

impl RegionRegistry {
    /// Creates a registry whose regions read time from `clock` and use `defaults`.
    #[must_use]
    pub fn new(clock: Clock, defaults: CoherenceConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clock,
                defaults,
                #[cfg(any(feature = "metrics", test))]
                meter: None,
                regions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a registry whose regions also report event counts to `meter_provider`.
    #[cfg(any(feature = "metrics", test))]
    #[must_use]
    pub fn with_metrics(clock: Clock, defaults: CoherenceConfig, meter_provider: &dyn MeterProvider) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clock,
                defaults,
                meter: Some(crate::telemetry::metrics::create_meter(meter_provider)),
                regions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a handle to the region `name`, creating it with the default configuration.
    #[must_use]
    pub fn acquire(&self, name: &str) -> RegionHandle {
        self.acquire_with(name, self.inner.defaults.clone())
    }

    /// Returns a handle to the region `name`, creating it with `config`.
    ///
    /// If the region is already live, the existing region is returned and `config` is
    /// ignored.
    #[must_use]
    pub fn acquire_with(&self, name: &str, config: CoherenceConfig) -> RegionHandle {
        let mut regions = self.inner.regions.lock();
        let slot = regions.entry(Arc::from(name)).or_insert_with_key(|name| {
            tracing::debug!(cache.region = &**name, "cache.region_created");
            Slot {
                region: Arc::new(self.create(Arc::clone(name), config)),
                refs: 0,
            }
        });
        slot.refs += 1;

        RegionHandle {
            region: Arc::clone(&slot.region),
            registry: self.clone(),
        }
    }

    /// Names of all live regions, sorted.
    #[must_use]
    pub fn regions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.regions.lock().keys().map(ToString::to_string).collect();
        names.sort_unstable();
        names
    }

    /// Number of live handles to `name`; zero if the region does not exist.
    #[must_use]
    pub fn ref_count(&self, name: &str) -> usize {
        self.inner.regions.lock().get(name).map_or(0, |slot| slot.refs)
    }

    fn create(&self, name: Arc<str>, config: CoherenceConfig) -> Region {
        let telemetry = Telemetry::new(Arc::clone(&name), config.logs_enabled());
        #[cfg(any(feature = "metrics", test))]
        let telemetry = telemetry.with_meter(self.inner.meter.as_ref());
        Region::new(name, self.inner.clock.clone(), config, telemetry)
    }

    fn release(&self, name: &str) {
        let mut regions = self.inner.regions.lock();
        let Some(slot) = regions.get_mut(name) else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            regions.remove(name);
            tracing::debug!(cache.region = name, "cache.region_released");
        }
    }
}

/// A counted reference to a live [`Region`].
///
/// Dereferences to the region. Cloning adds a reference; dropping the last one removes
/// the region from its registry.
pub struct RegionHandle {
    region: Arc<Region>,
    registry: RegionRegistry,
}

impl fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegionHandle").field(&self.region.name).finish()
    }
}

impl Deref for RegionHandle {
    type Target = Region;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}

impl Clone for RegionHandle {
    fn clone(&self) -> Self {
        if let Some(slot) = self.registry.inner.regions.lock().get_mut(self.region.name()) {
            slot.refs += 1;
        }
        Self {
            region: Arc::clone(&self.region),
            registry: self.registry.clone(),
        }
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        self.registry.release(self.region.name());
    }
}
