// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Millisecond wall-clock timestamps.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tick::Clock;

/// A wall-clock instant with millisecond resolution.
///
/// Timestamps are only loosely synchronized across nodes; the coherence protocol
/// uses them to order a database load against a concurrent invalidation on the same
/// node, and to order [`FutureUpdate`][crate::FutureUpdate]s written for one key.
///
/// # Examples
///
/// ```
/// use coherence_store::Timestamp;
/// use std::time::Duration;
///
/// let t = Timestamp::from_millis(100);
/// assert_eq!(t.saturating_add(Duration::from_millis(5)).as_millis(), 105);
/// assert!(Timestamp::from_millis(99) < t);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp(u64);

impl Timestamp {
    /// The UNIX epoch.
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Converts a [`SystemTime`], clamping times before the epoch to [`Timestamp::ZERO`].
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        time.duration_since(UNIX_EPOCH)
            .map_or(Self::ZERO, |since| Self(u64::try_from(since.as_millis()).unwrap_or(u64::MAX)))
    }

    /// Reads the current time from `clock`.
    ///
    /// # Examples
    ///
    /// ```
    /// use coherence_store::Timestamp;
    /// use std::time::{Duration, SystemTime};
    /// use tick::Clock;
    ///
    /// let clock = Clock::new_frozen_at(SystemTime::UNIX_EPOCH + Duration::from_millis(250));
    /// assert_eq!(Timestamp::now(&clock), Timestamp::from_millis(250));
    /// ```
    #[must_use]
    pub fn now(clock: &Clock) -> Self {
        Self::from_system_time(clock.system_time())
    }

    /// Converts back to a [`SystemTime`], saturating where the platform cannot represent it.
    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH
            .checked_add(Duration::from_millis(self.0))
            .unwrap_or(UNIX_EPOCH + Duration::from_secs(u64::from(u32::MAX)))
    }

    /// Milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns `self + duration`, saturating at the maximum representable value.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// Returns `self - duration`, saturating at the epoch.
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// The smallest timestamp strictly later than `self`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.to_system_time()
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_system_time_before_epoch_clamps_to_zero() {
        let before = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(Timestamp::from_system_time(before), Timestamp::ZERO);
    }

    #[test]
    fn from_system_time_truncates_to_millis() {
        let time = UNIX_EPOCH + Duration::from_micros(1_999);
        assert_eq!(Timestamp::from_system_time(time).as_millis(), 1);
    }

    #[test]
    fn arithmetic_saturates() {
        let max = Timestamp::from_millis(u64::MAX);
        assert_eq!(max.saturating_add(Duration::from_secs(1)), max);
        assert_eq!(max.next(), max);
        assert_eq!(Timestamp::ZERO.saturating_sub(Duration::from_secs(1)), Timestamp::ZERO);
        assert_eq!(
            Timestamp::from_millis(10).saturating_duration_since(Timestamp::from_millis(20)),
            Duration::ZERO
        );
    }

    #[test]
    fn display_shows_millis() {
        assert_eq!(Timestamp::from_millis(42).to_string(), "42ms");
    }

    #[test]
    fn system_time_conversion_is_lossless_at_millis() {
        let t = Timestamp::from_millis(1_234);
        assert_eq!(Timestamp::from_system_time(t.to_system_time()), t);
        assert_eq!(SystemTime::from(t), UNIX_EPOCH + Duration::from_millis(1_234));
    }

    #[test]
    fn now_follows_controlled_clock() {
        let control = tick::ClockControl::new_at(Timestamp::from_millis(1_000).to_system_time());
        let clock = control.to_clock();

        control.advance_millis(250);
        assert_eq!(Timestamp::now(&clock), Timestamp::from_millis(1_250));

        control.set_time(Timestamp::from_millis(10));
        assert_eq!(Timestamp::now(&clock), Timestamp::from_millis(10));
    }

    #[test]
    fn frozen_clock_reads_epoch() {
        assert_eq!(Timestamp::now(&Clock::new_frozen()), Timestamp::ZERO);
    }
}
