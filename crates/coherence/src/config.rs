// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-region configuration.

use std::time::Duration;

use coherence_cluster::DeliveryMode;

use crate::RetryPolicy;

const PENDING_PUT_MAX_AGE: Duration = Duration::from_secs(120);
const NAKED_PUT_INVALIDATION_PERIOD: Duration = Duration::from_secs(20);
const PUT_FROM_LOAD_LOCK_TIMEOUT: Duration = Duration::from_millis(100);
const INVALIDATION_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const INVALIDATION_WINDOW_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning knobs for one cache region.
///
/// Every field has a default, so partial configuration documents are accepted when the
/// `serde` feature is enabled.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use coherence::CoherenceConfig;
/// use coherence_cluster::DeliveryMode;
///
/// let config = CoherenceConfig::default()
///     .with_naked_put_invalidation_period(Duration::from_secs(5))
///     .with_delivery_mode(DeliveryMode::Async);
///
/// assert_eq!(config.pending_put_max_age(), Duration::from_secs(120));
/// assert_eq!(config.delivery_mode(), DeliveryMode::Async);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CoherenceConfig {
    pending_put_max_age: Duration,
    naked_put_invalidation_period: Duration,
    put_from_load_lock_timeout: Duration,
    invalidation_lock_timeout: Duration,
    invalidation_window_timeout: Duration,
    delivery_mode: DeliveryMode,
    logs_enabled: bool,
    retry: RetryPolicy,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            pending_put_max_age: PENDING_PUT_MAX_AGE,
            naked_put_invalidation_period: NAKED_PUT_INVALIDATION_PERIOD,
            put_from_load_lock_timeout: PUT_FROM_LOAD_LOCK_TIMEOUT,
            invalidation_lock_timeout: INVALIDATION_LOCK_TIMEOUT,
            invalidation_window_timeout: INVALIDATION_WINDOW_TIMEOUT,
            delivery_mode: DeliveryMode::default(),
            logs_enabled: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl CoherenceConfig {
    /// How long a registered pending put stays valid before it is reclaimed.
    #[must_use]
    pub fn pending_put_max_age(&self) -> Duration {
        self.pending_put_max_age
    }

    /// Sets [`pending_put_max_age`][Self::pending_put_max_age].
    #[must_use]
    pub fn with_pending_put_max_age(mut self, age: Duration) -> Self {
        self.pending_put_max_age = age;
        self
    }

    /// How long puts without a registered pending put are rejected after an invalidation.
    #[must_use]
    pub fn naked_put_invalidation_period(&self) -> Duration {
        self.naked_put_invalidation_period
    }

    /// Sets [`naked_put_invalidation_period`][Self::naked_put_invalidation_period].
    #[must_use]
    pub fn with_naked_put_invalidation_period(mut self, period: Duration) -> Self {
        self.naked_put_invalidation_period = period;
        self
    }

    /// Bounded wait for the per-key lock during admission. Timing out rejects the put.
    #[must_use]
    pub fn put_from_load_lock_timeout(&self) -> Duration {
        self.put_from_load_lock_timeout
    }

    /// Sets [`put_from_load_lock_timeout`][Self::put_from_load_lock_timeout].
    #[must_use]
    pub fn with_put_from_load_lock_timeout(mut self, timeout: Duration) -> Self {
        self.put_from_load_lock_timeout = timeout;
        self
    }

    /// Bounded wait for the per-key lock when invalidating.
    #[must_use]
    pub fn invalidation_lock_timeout(&self) -> Duration {
        self.invalidation_lock_timeout
    }

    /// Sets [`invalidation_lock_timeout`][Self::invalidation_lock_timeout].
    #[must_use]
    pub fn with_invalidation_lock_timeout(mut self, timeout: Duration) -> Self {
        self.invalidation_lock_timeout = timeout;
        self
    }

    /// Age after which an invalidation window that was never closed is reclaimed.
    #[must_use]
    pub fn invalidation_window_timeout(&self) -> Duration {
        self.invalidation_window_timeout
    }

    /// Sets [`invalidation_window_timeout`][Self::invalidation_window_timeout].
    #[must_use]
    pub fn with_invalidation_window_timeout(mut self, timeout: Duration) -> Self {
        self.invalidation_window_timeout = timeout;
        self
    }

    /// Delivery mode for non-transactional invalidation broadcasts.
    #[must_use]
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Sets [`delivery_mode`][Self::delivery_mode].
    #[must_use]
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Whether routine per-operation events are logged. Warnings and errors always are.
    #[must_use]
    pub fn logs_enabled(&self) -> bool {
        self.logs_enabled
    }

    /// Sets [`logs_enabled`][Self::logs_enabled].
    #[must_use]
    pub fn with_logs_enabled(mut self, enabled: bool) -> Self {
        self.logs_enabled = enabled;
        self
    }

    /// Retry policy of the deferred commit writer.
    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Sets [`retry`][Self::retry].
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
