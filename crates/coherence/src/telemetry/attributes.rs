// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attribute names attached to coherence telemetry.

#[cfg(any(feature = "metrics", test))]
pub(crate) const CACHE_REGION_NAME: &str = "cache.region";

#[cfg(any(feature = "metrics", test))]
pub(crate) const CACHE_OPERATION_NAME: &str = "cache.operation";

#[cfg(any(feature = "metrics", test))]
pub(crate) const CACHE_ACTIVITY_NAME: &str = "cache.activity";

#[cfg(test)]
pub(crate) const CACHE_KEY_NAME: &str = "cache.key";

#[cfg(test)]
pub(crate) const CACHE_EVENT_NAME: &str = "cache.coherence";
