// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Write commands and their propagation flags.

use coherence_store::Timestamp;

/// Flags that change how a write is propagated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CommandFlags {
    external_read: bool,
    local_only: bool,
}

impl CommandFlags {
    /// A cache fill with a value loaded from the database. Never overwrites a newer
    /// value and is never broadcast.
    #[must_use]
    pub fn external_read() -> Self {
        Self {
            external_read: true,
            local_only: false,
        }
    }

    /// A write that only affects the local node.
    #[must_use]
    pub fn local_only() -> Self {
        Self {
            external_read: false,
            local_only: true,
        }
    }

    /// Whether this is a cache fill.
    #[must_use]
    pub fn is_external_read(self) -> bool {
        self.external_read
    }

    /// Whether peers are left alone.
    #[must_use]
    pub fn is_local_only(self) -> bool {
        self.local_only
    }

    /// Whether a write with these flags must invalidate peers.
    #[must_use]
    pub fn is_broadcast(self) -> bool {
        !self.external_read && !self.local_only
    }
}

/// A mutating operation on the local store.
///
/// The broadcasters match on this type exhaustively; every variant states how it reaches
/// the store and the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteCommand<K, V> {
    /// Write one value.
    Put {
        /// The key.
        key: K,
        /// The value.
        value: V,
        /// When the value was read from the database or produced.
        as_of: Timestamp,
        /// Propagation flags.
        flags: CommandFlags,
    },
    /// Remove one key.
    Remove {
        /// The key.
        key: K,
        /// Propagation flags.
        flags: CommandFlags,
    },
    /// Remove every entry of the region.
    Clear,
    /// Write several values at once.
    BatchPut {
        /// The entries.
        entries: Vec<(K, V)>,
        /// When the values were read or produced.
        as_of: Timestamp,
        /// Propagation flags.
        flags: CommandFlags,
    },
}

impl<K, V> WriteCommand<K, V> {
    /// A plain put.
    pub fn put(key: K, value: V, as_of: Timestamp) -> Self {
        Self::Put {
            key,
            value,
            as_of,
            flags: CommandFlags::default(),
        }
    }

    /// A plain remove.
    pub fn remove(key: K) -> Self {
        Self::Remove {
            key,
            flags: CommandFlags::default(),
        }
    }

    /// The command's flags; [`WriteCommand::Clear`] has none.
    #[must_use]
    pub fn flags(&self) -> CommandFlags {
        match self {
            Self::Put { flags, .. } | Self::Remove { flags, .. } | Self::BatchPut { flags, .. } => *flags,
            Self::Clear => CommandFlags::default(),
        }
    }

    /// The keys the command writes. Empty for [`WriteCommand::Clear`].
    pub fn keys(&self) -> Vec<&K> {
        match self {
            Self::Put { key, .. } | Self::Remove { key, .. } => vec![key],
            Self::BatchPut { entries, .. } => entries.iter().map(|(key, _)| key).collect(),
            Self::Clear => Vec::new(),
        }
    }
}
