// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Entries the coherence layer writes into a store.

use crate::{Timestamp, WriterToken};

/// The final outcome of a transaction for one key, written after completion.
///
/// A `FutureUpdate` carrying `None` is a tombstone: it positively marks the key as
/// having no valid cached value, so that a stale value written earlier is cleared
/// rather than left in place.
///
/// Updates are ordered by `(commit_timestamp, writer)`. The store keeps only the
/// greatest update for a key, regardless of the order in which they arrive.
///
/// # Examples
///
/// ```
/// use coherence_store::{FutureUpdate, Timestamp, WriterToken};
///
/// let committed = FutureUpdate::new(WriterToken::new(), Timestamp::from_millis(10), Some("X"));
/// let rolled_back = FutureUpdate::<&str>::tombstone(WriterToken::new(), Timestamp::from_millis(11));
///
/// assert!(rolled_back.supersedes(&committed));
/// assert!(rolled_back.is_tombstone());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FutureUpdate<V> {
    writer: WriterToken,
    commit_timestamp: Timestamp,
    value: Option<V>,
}

impl<V> FutureUpdate<V> {
    /// Creates an update; `None` makes it a tombstone.
    pub fn new(writer: WriterToken, commit_timestamp: Timestamp, value: Option<V>) -> Self {
        Self {
            writer,
            commit_timestamp,
            value,
        }
    }

    /// Creates a tombstone update.
    pub fn tombstone(writer: WriterToken, commit_timestamp: Timestamp) -> Self {
        Self::new(writer, commit_timestamp, None)
    }

    /// The token of the write attempt that produced this update.
    pub fn writer(&self) -> WriterToken {
        self.writer
    }

    /// The timestamp assigned when the update was created.
    pub fn commit_timestamp(&self) -> Timestamp {
        self.commit_timestamp
    }

    /// The committed value, or `None` for a tombstone.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Consumes the update, returning the committed value.
    pub fn into_value(self) -> Option<V> {
        self.value
    }

    /// Returns `true` if this update carries no value.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Returns `true` if this update is strictly newer than `other`.
    pub fn supersedes(&self, other: &Self) -> bool {
        (self.commit_timestamp, self.writer) > (other.commit_timestamp, other.writer)
    }
}

/// What the coherence layer keeps in a store slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredEntry<V> {
    /// A value read from the database as of `loaded_at`.
    Loaded {
        /// The loaded value.
        value: V,
        /// The load timestamp the value was admitted with.
        loaded_at: Timestamp,
    },
    /// The outcome of a completed transaction.
    Update(FutureUpdate<V>),
}

impl<V> StoredEntry<V> {
    /// Creates a [`StoredEntry::Loaded`] entry.
    pub fn loaded(value: V, loaded_at: Timestamp) -> Self {
        Self::Loaded { value, loaded_at }
    }

    /// The value readers should observe, or `None` for a tombstone.
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Loaded { value, .. } => Some(value),
            Self::Update(update) => update.value(),
        }
    }

    /// Consumes the entry, returning the value readers should observe.
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Loaded { value, .. } => Some(value),
            Self::Update(update) => update.into_value(),
        }
    }

    /// Returns `true` if the entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Update(update) if update.is_tombstone())
    }

    /// Returns `true` if a value loaded as of `loaded_at` may replace this entry.
    ///
    /// Only a tombstone committed strictly before the load frees the slot; any
    /// value, loaded or committed, is left alone.
    pub fn admits_load(&self, loaded_at: Timestamp) -> bool {
        match self {
            Self::Loaded { .. } => false,
            Self::Update(update) => update.is_tombstone() && update.commit_timestamp() < loaded_at,
        }
    }

    /// Returns `true` if `update` should replace this entry.
    pub fn yields_to(&self, update: &FutureUpdate<V>) -> bool {
        match self {
            Self::Loaded { .. } => true,
            Self::Update(current) => update.supersedes(current),
        }
    }
}
