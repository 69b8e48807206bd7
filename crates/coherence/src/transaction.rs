// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transaction lifecycle state shared with the write path.

use std::fmt;

use coherence_store::{OwnerToken, Timestamp};
use parking_lot::Mutex;

use crate::WriteCommand;

/// Where a transaction is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxPhase {
    /// Writes are being intercepted.
    Active,
    /// Prepare ran; peers may hold invalidation windows for the transaction.
    Prepared,
    /// Completion hooks ran.
    Completed,
}

struct TxState<K, V> {
    phase: TxPhase,
    modifications: Vec<WriteCommand<K, V>>,
    affected: Vec<K>,
    writes: Vec<(K, Option<V>)>,
}

/// Per-transaction state shared by the transactional components.
///
/// Records the owner token and start timestamp used for admission, the intercepted
/// modifications, the keys with open invalidation windows, and the writes handed to the
/// deferred commit writer on completion.
pub struct TransactionContext<K, V> {
    owner: OwnerToken,
    started_at: Timestamp,
    state: Mutex<TxState<K, V>>,
}

impl<K: fmt::Debug, V> fmt::Debug for TransactionContext<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionContext")
            .field("owner", &self.owner)
            .field("started_at", &self.started_at)
            .field("phase", &state.phase)
            .field("affected", &state.affected)
            .finish_non_exhaustive()
    }
}

impl<K, V> TransactionContext<K, V> {
    /// Creates the context of a transaction that started at `started_at`.
    #[must_use]
    pub fn new(owner: OwnerToken, started_at: Timestamp) -> Self {
        Self {
            owner,
            started_at,
            state: Mutex::new(TxState {
                phase: TxPhase::Active,
                modifications: Vec::new(),
                affected: Vec::new(),
                writes: Vec::new(),
            }),
        }
    }

    /// The transaction's owner token.
    #[must_use]
    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    /// When the transaction started.
    #[must_use]
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> TxPhase {
        self.state.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: TxPhase) {
        self.state.lock().phase = phase;
    }

    /// Number of intercepted modifications.
    #[must_use]
    pub fn modification_count(&self) -> usize {
        self.state.lock().modifications.len()
    }

    pub(crate) fn record(&self, command: WriteCommand<K, V>) {
        self.state.lock().modifications.push(command);
    }
}

impl<K: Clone + PartialEq, V: Clone> TransactionContext<K, V> {
    /// Keys with an invalidation window opened by this transaction, in first-touch order.
    #[must_use]
    pub fn affected_keys(&self) -> Vec<K> {
        self.state.lock().affected.clone()
    }

    pub(crate) fn mark_affected(&self, key: K) {
        let mut state = self.state.lock();
        if !state.affected.contains(&key) {
            state.affected.push(key);
        }
    }

    /// Buffers the final value of `key`; `None` stands for a removal. The last write wins.
    pub(crate) fn buffer_write(&self, key: K, value: Option<V>) {
        let mut state = self.state.lock();
        match state.writes.iter_mut().find(|(buffered, _)| *buffered == key) {
            Some((_, slot)) => *slot = value,
            None => state.writes.push((key, value)),
        }
    }

    pub(crate) fn take_writes(&self) -> Vec<(K, Option<V>)> {
        std::mem::take(&mut self.state.lock().writes)
    }

    /// Keys peers must invalidate, and whether a clear must be broadcast.
    ///
    /// Cache fills and local-only writes are left out.
    pub(crate) fn broadcast_set(&self) -> (Vec<K>, bool) {
        let state = self.state.lock();
        let mut keys: Vec<K> = Vec::new();
        let mut clear = false;
        for command in &state.modifications {
            if matches!(command, WriteCommand::Clear) {
                clear = true;
            } else if command.flags().is_broadcast() {
                for key in command.keys() {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
            }
        }
        (keys, clear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandFlags;

    fn context() -> TransactionContext<&'static str, i32> {
        TransactionContext::new(OwnerToken::new(), Timestamp::from_millis(10))
    }

    #[test]
    fn starts_active() {
        let tx = context();
        assert_eq!(tx.phase(), TxPhase::Active);
        assert_eq!(tx.started_at(), Timestamp::from_millis(10));
        assert_eq!(tx.modification_count(), 0);
    }

    #[test]
    fn affected_keys_are_deduplicated() {
        let tx = context();
        tx.mark_affected("a");
        tx.mark_affected("b");
        tx.mark_affected("a");
        assert_eq!(tx.affected_keys(), vec!["a", "b"]);
    }

    #[test]
    fn last_buffered_write_wins() {
        let tx = context();
        tx.buffer_write("a", Some(1));
        tx.buffer_write("b", Some(2));
        tx.buffer_write("a", None);
        assert_eq!(tx.take_writes(), vec![("a", None), ("b", Some(2))]);
        assert!(tx.take_writes().is_empty());
    }

    #[test]
    fn broadcast_set_filters_fills_and_local_writes() {
        let tx = context();
        let at = Timestamp::from_millis(10);
        tx.record(WriteCommand::put("a", 1, at));
        tx.record(WriteCommand::Put {
            key: "fill",
            value: 2,
            as_of: at,
            flags: CommandFlags::external_read(),
        });
        tx.record(WriteCommand::Remove {
            key: "local",
            flags: CommandFlags::local_only(),
        });
        tx.record(WriteCommand::BatchPut {
            entries: vec![("a", 3), ("c", 4)],
            as_of: at,
            flags: CommandFlags::default(),
        });

        assert_eq!(tx.broadcast_set(), (vec!["a", "c"], false));

        tx.record(WriteCommand::Clear);
        assert!(tx.broadcast_set().1);
    }
}
