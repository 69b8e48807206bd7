// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured events for coherence decisions.
//!
//! Every admission decision, invalidation and deferred write is recorded as an
//! `(operation, activity)` pair. Events are emitted through `tracing`; with the `metrics`
//! feature they also increment an OpenTelemetry counter.

use opentelemetry::logs::Severity;

pub(crate) mod attributes;
#[cfg(any(feature = "metrics", test))]
pub(crate) mod metrics;
mod recorder;
#[cfg(test)]
pub(crate) mod testing;

pub(crate) use recorder::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Get,
    PutFromLoad,
    RegisterPendingPut,
    Update,
    Remove,
    Evict,
    Clear,
    InvalidateKey,
    BeginInvalidatingKey,
    EndInvalidatingKey,
    InvalidateRegion,
    Broadcast,
    Prepare,
    Completion,
    DeferredWrite,
    Remote,
    Purge,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "cache.get",
            Self::PutFromLoad => "cache.put_from_load",
            Self::RegisterPendingPut => "cache.register_pending_put",
            Self::Update => "cache.update",
            Self::Remove => "cache.remove",
            Self::Evict => "cache.evict",
            Self::Clear => "cache.clear",
            Self::InvalidateKey => "cache.invalidate_key",
            Self::BeginInvalidatingKey => "cache.begin_invalidating_key",
            Self::EndInvalidatingKey => "cache.end_invalidating_key",
            Self::InvalidateRegion => "cache.invalidate_region",
            Self::Broadcast => "cache.broadcast",
            Self::Prepare => "cache.prepare",
            Self::Completion => "cache.completion",
            Self::DeferredWrite => "cache.deferred_write",
            Self::Remote => "cache.remote",
            Self::Purge => "cache.purge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activity {
    Hit,
    Miss,
    Registered,
    Admitted,
    Rejected,
    Stored,
    Skipped,
    Sent,
    Invalidated,
    WindowOpened,
    WindowClosed,
    Tombstoned,
    Superseded,
    Retried,
    Reclaimed,
    Degraded,
    ProtocolViolation,
    Abandoned,
    Error,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "cache.hit",
            Self::Miss => "cache.miss",
            Self::Registered => "cache.registered",
            Self::Admitted => "cache.admitted",
            Self::Rejected => "cache.rejected",
            Self::Stored => "cache.stored",
            Self::Skipped => "cache.skipped",
            Self::Sent => "cache.sent",
            Self::Invalidated => "cache.invalidated",
            Self::WindowOpened => "cache.window_opened",
            Self::WindowClosed => "cache.window_closed",
            Self::Tombstoned => "cache.tombstoned",
            Self::Superseded => "cache.superseded",
            Self::Retried => "cache.retried",
            Self::Reclaimed => "cache.reclaimed",
            Self::Degraded => "cache.degraded",
            Self::ProtocolViolation => "cache.protocol_violation",
            Self::Abandoned => "cache.abandoned",
            Self::Error => "cache.error",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Hit | Self::Miss | Self::Registered | Self::Admitted | Self::Rejected | Self::Stored | Self::Skipped | Self::Sent => {
                Severity::Debug
            }
            Self::Invalidated
            | Self::WindowOpened
            | Self::WindowClosed
            | Self::Tombstoned
            | Self::Superseded
            | Self::Retried
            | Self::Reclaimed => Severity::Info,
            Self::Degraded | Self::ProtocolViolation => Severity::Warn,
            Self::Abandoned | Self::Error => Severity::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_as_str() {
        assert_eq!(Operation::Get.as_str(), "cache.get");
        assert_eq!(Operation::PutFromLoad.as_str(), "cache.put_from_load");
        assert_eq!(Operation::EndInvalidatingKey.as_str(), "cache.end_invalidating_key");
        assert_eq!(Operation::DeferredWrite.as_str(), "cache.deferred_write");
    }

    #[test]
    fn activity_as_str() {
        assert_eq!(Activity::Admitted.as_str(), "cache.admitted");
        assert_eq!(Activity::ProtocolViolation.as_str(), "cache.protocol_violation");
        assert_eq!(Activity::Abandoned.as_str(), "cache.abandoned");
    }

    #[test]
    fn activity_severity() {
        assert_eq!(Activity::Hit.severity(), Severity::Debug);
        assert_eq!(Activity::Rejected.severity(), Severity::Debug);
        assert_eq!(Activity::WindowOpened.severity(), Severity::Info);
        assert_eq!(Activity::Tombstoned.severity(), Severity::Info);
        assert_eq!(Activity::Degraded.severity(), Severity::Warn);
        assert_eq!(Activity::ProtocolViolation.severity(), Severity::Warn);
        assert_eq!(Activity::Abandoned.severity(), Severity::Error);
        assert_eq!(Activity::Error.severity(), Severity::Error);
    }
}
