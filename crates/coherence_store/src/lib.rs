// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Store tier abstractions for a clustered, write-through cache.
//!
//! This crate defines the [`CacheStore`] trait that the node-local backing store must
//! satisfy, the entry types the coherence layer writes into it, and the small vocabulary
//! shared by every other crate in the family: [`Timestamp`], [`OwnerToken`],
//! [`WriterToken`] and [`Error`]. Time is read from a [`tick::Clock`] and failures carry
//! a [`recoverable::RecoveryInfo`] classification.
//!
//! # Overview
//!
//! The store is assumed to be linearizable per key on one node and to know nothing about
//! the cluster. Two operations carry the semantics the coherence layer depends on:
//!
//! - [`CacheStore::put_for_external_read`] writes a value that was just loaded from the
//!   database, but only if the slot is free. It never clobbers a newer value.
//! - [`CacheStore::apply_update`] writes a [`FutureUpdate`] and keeps whichever update for
//!   the key has the greatest `(commit_timestamp, writer)` pair.
//!
//! # Implementing a Store
//!
//! ```
//! use coherence_store::{CacheStore, Error, FutureUpdate, StoredEntry, Timestamp};
//! use std::collections::HashMap;
//! use std::sync::Mutex;
//!
//! struct SimpleStore<K, V>(Mutex<HashMap<K, StoredEntry<V>>>);
//!
//! impl<K, V> CacheStore<K, V> for SimpleStore<K, V>
//! where
//!     K: Clone + Eq + std::hash::Hash + Send + Sync,
//!     V: Clone + Send + Sync,
//! {
//!     async fn get(&self, key: &K) -> Result<Option<StoredEntry<V>>, Error> {
//!         Ok(self.0.lock().unwrap().get(key).cloned())
//!     }
//!
//!     async fn insert(&self, key: &K, entry: StoredEntry<V>) -> Result<(), Error> {
//!         self.0.lock().unwrap().insert(key.clone(), entry);
//!         Ok(())
//!     }
//!
//!     async fn put_for_external_read(&self, key: &K, value: V, loaded_at: Timestamp) -> Result<bool, Error> {
//!         let mut map = self.0.lock().unwrap();
//!         if map.get(key).is_some_and(|entry| !entry.admits_load(loaded_at)) {
//!             return Ok(false);
//!         }
//!         map.insert(key.clone(), StoredEntry::loaded(value, loaded_at));
//!         Ok(true)
//!     }
//!
//!     async fn apply_update(&self, key: &K, update: FutureUpdate<V>) -> Result<bool, Error> {
//!         let mut map = self.0.lock().unwrap();
//!         if map.get(key).is_some_and(|entry| !entry.yields_to(&update)) {
//!             return Ok(false);
//!         }
//!         map.insert(key.clone(), StoredEntry::Update(update));
//!         Ok(true)
//!     }
//!
//!     async fn remove(&self, key: &K) -> Result<(), Error> {
//!         self.0.lock().unwrap().remove(key);
//!         Ok(())
//!     }
//!
//!     async fn clear(&self) -> Result<(), Error> {
//!         self.0.lock().unwrap().clear();
//!         Ok(())
//!     }
//! }
//! ```

mod entry;
pub mod error;
mod memory;
mod store;
#[cfg(any(feature = "test-util", test))]
pub mod testing;
mod timestamp;
mod token;

#[doc(inline)]
pub use entry::{FutureUpdate, StoredEntry};
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use memory::{DEFAULT_TOMBSTONE_RETENTION, InMemoryStore};
#[doc(inline)]
pub use store::{CacheKey, CacheStore, CacheValue};
#[doc(inline)]
pub use timestamp::Timestamp;
#[doc(inline)]
pub use token::{OwnerToken, WriterToken};
