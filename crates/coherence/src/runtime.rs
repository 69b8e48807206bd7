// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runtime abstraction for background writes.

use coherence_store::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub(crate) struct Runtime {
    handle: Handle,
}

impl Runtime {
    pub(crate) fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the Tokio runtime the caller is running on.
    pub(crate) fn current() -> Result<Self, Error> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|error| Error::permanent(format!("deferred commit writes need a Tokio runtime: {error}")))
    }

    pub(crate) fn spawn<F>(&self, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(work)
    }
}
