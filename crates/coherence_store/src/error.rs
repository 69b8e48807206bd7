// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for store and cluster operations.

use recoverable::{Recovery, RecoveryInfo};

/// An error from a cache store or cluster transport.
///
/// This is an opaque error type that wraps the underlying cause together with its
/// [`RecoveryInfo`], which tells callers whether repeating the operation could help.
/// Use [`std::error::Error::source()`] to access the underlying cause. Cache misses and
/// admission rejections are never reported through this type.
///
/// # Example
///
/// ```
/// use coherence_store::Error;
/// use recoverable::{Recovery, RecoveryKind};
///
/// let error = Error::transient("connection reset");
/// assert_eq!(error.recovery().kind(), RecoveryKind::Retry);
/// ```
#[ohno::error]
pub struct Error {
    recovery: RecoveryInfo,
}

impl Error {
    /// Creates an error whose recoverability is unknown.
    ///
    /// # Examples
    ///
    /// ```
    /// use coherence_store::Error;
    ///
    /// let error = Error::from_message("operation failed");
    /// ```
    pub fn from_message(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(RecoveryInfo::unknown(), cause)
    }

    /// Creates an error for a failure that may go away on retry.
    pub fn transient(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(RecoveryInfo::retry(), cause)
    }

    /// Creates an error for a failure that retrying will not fix.
    pub fn permanent(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(RecoveryInfo::never(), cause)
    }

    /// Creates an error with an explicit recovery classification.
    pub fn with_recovery(recovery: RecoveryInfo, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(recovery, cause)
    }
}

impl Recovery for Error {
    fn recovery(&self) -> RecoveryInfo {
        self.recovery.clone()
    }
}

/// A specialized [`Result`] type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
