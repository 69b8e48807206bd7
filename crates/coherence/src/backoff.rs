// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Retry delays for deferred commit writes.

use std::cmp::min;
use std::time::Duration;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Capped exponential back-off for deferred commit writes.
///
/// The delay before retry `n` (zero-based) is `base_delay * 2^n`, clamped to `max_delay`.
/// With `max_attempts` unset the writer keeps retrying until the write lands; a set value
/// bounds the total number of attempts, including the first.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use coherence::RetryPolicy;
///
/// let policy = RetryPolicy::default()
///     .with_base_delay(Duration::from_millis(10))
///     .with_max_delay(Duration::from_millis(30))
///     .with_max_attempts(4);
///
/// let delays: Vec<_> = policy.delays().collect();
/// assert_eq!(
///     delays,
///     [Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(30)]
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the first retry.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Upper bound for any single delay.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Sets the upper bound for any single delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Total attempts allowed, or `None` to retry until the write lands.
    #[must_use]
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Bounds the total number of attempts. Values below one are treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Removes the attempt bound.
    #[must_use]
    pub fn retry_forever(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// The delays to wait between consecutive attempts.
    ///
    /// Yields `max_attempts - 1` items, or never ends when attempts are unbounded.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        let base = self.base_delay;
        let max = self.max_delay;
        let retries = self.max_attempts.map(|attempts| attempts.saturating_sub(1));

        (0_u32..)
            .take_while(move |&retry| retries.is_none_or(|limit| retry < limit))
            .map(move |retry| clamp_to_max(duration_mul_pow2(base, retry), max))
    }
}

fn clamp_to_max(delay: Duration, max: Duration) -> Duration {
    min(delay, max)
}

fn duration_mul_pow2(base: Duration, exponent: u32) -> Duration {
    1_u32
        .checked_shl(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}
