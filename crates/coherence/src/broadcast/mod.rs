// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fan-out of local writes to cluster peers.
//!
//! [`NonTxInvalidationBroadcaster`] applies each write to the local store and then tells
//! peers to drop the affected keys. [`TxInvalidationBroadcaster`] applies writes locally
//! during the transaction and sends one invalidation batch at prepare.

mod non_tx;
mod tx;

pub use non_tx::NonTxInvalidationBroadcaster;
pub use tx::TxInvalidationBroadcaster;
