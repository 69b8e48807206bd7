// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Opaque owner and writer identities.

use std::fmt;

use uuid::Uuid;

macro_rules! define_token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a fresh, globally unique token.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing identifier.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying identifier.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

define_token! {
    /// Identifies the transaction or session that owns a pending put or an
    /// invalidation window.
    ///
    /// Two operations with the same owner never conflict with each other: a
    /// transaction may load a key it is itself invalidating.
    OwnerToken
}

define_token! {
    /// Identifies one deferred write attempt.
    ///
    /// Breaks ties between [`FutureUpdate`][crate::FutureUpdate]s that carry the same
    /// commit timestamp, so every pair of updates for a key is totally ordered.
    WriterToken
}
