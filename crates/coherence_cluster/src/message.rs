// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Messages exchanged between region peers.

use coherence_store::OwnerToken;

/// A message exchanged between the peers of one cache region.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum ClusterMessage<K> {
    /// Drop the cached entries for `keys`.
    Invalidate {
        /// The invalidated keys.
        keys: Vec<K>,
    },
    /// `owner` is about to modify `keys`; open an invalidation window for each.
    BeginInvalidation {
        /// The keys being modified.
        keys: Vec<K>,
        /// The transaction modifying them.
        owner: OwnerToken,
    },
    /// `owner` has completed; close its windows for `keys`.
    EndInvalidation {
        /// The keys that were modified.
        keys: Vec<K>,
        /// The transaction that modified them.
        owner: OwnerToken,
    },
    /// Drop every cached entry in the region.
    Clear,
}

impl<K> ClusterMessage<K> {
    /// A short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invalidate { .. } => "invalidate",
            Self::BeginInvalidation { .. } => "begin_invalidation",
            Self::EndInvalidation { .. } => "end_invalidation",
            Self::Clear => "clear",
        }
    }

    /// The keys carried by the message; empty for [`ClusterMessage::Clear`].
    #[must_use]
    pub fn keys(&self) -> &[K] {
        match self {
            Self::Invalidate { keys } | Self::BeginInvalidation { keys, .. } | Self::EndInvalidation { keys, .. } => keys,
            Self::Clear => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_keys() {
        let owner = OwnerToken::new();
        let begin = ClusterMessage::BeginInvalidation { keys: vec![1, 2], owner };
        assert_eq!(begin.kind(), "begin_invalidation");
        assert_eq!(begin.keys(), &[1, 2]);

        let clear = ClusterMessage::<u32>::Clear;
        assert_eq!(clear.kind(), "clear");
        assert!(clear.keys().is_empty());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_uses_tagged_representation() {
        let json = serde_json::to_value(ClusterMessage::Invalidate { keys: vec!["a"] }).expect("serialize");
        assert_eq!(json["type"], "invalidate");
        assert_eq!(json["keys"][0], "a");
    }
}
