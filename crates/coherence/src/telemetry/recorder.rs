// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured event recording for log records and counters.

use std::fmt::{Debug, Display};
use std::sync::Arc;

#[cfg(any(feature = "metrics", test))]
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};
use opentelemetry::logs::Severity;

#[cfg(any(feature = "metrics", test))]
use super::{attributes, metrics::create_event_counter};
use super::{Activity, Operation};

/// Records coherence events for one region.
#[derive(Clone, Debug)]
pub(crate) struct Telemetry {
    region: Arc<str>,
    logs_enabled: bool,
    #[cfg(any(feature = "metrics", test))]
    event_counter: Option<Counter<u64>>,
}

impl Telemetry {
    pub(crate) fn new(region: Arc<str>, logs_enabled: bool) -> Self {
        Self {
            region,
            logs_enabled,
            #[cfg(any(feature = "metrics", test))]
            event_counter: None,
        }
    }

    #[cfg(any(feature = "metrics", test))]
    pub(crate) fn with_meter(mut self, meter: Option<&Meter>) -> Self {
        self.event_counter = meter.map(create_event_counter);
        self
    }

    #[inline]
    pub(crate) fn record(&self, operation: Operation, activity: Activity) {
        self.observe(operation, activity, None, None);
    }

    #[inline]
    pub(crate) fn record_key(&self, operation: Operation, activity: Activity, key: &dyn Debug) {
        self.observe(operation, activity, Some(key), None);
    }

    #[inline]
    pub(crate) fn record_error(&self, operation: Operation, activity: Activity, key: Option<&dyn Debug>, error: &dyn Display) {
        self.observe(operation, activity, key, Some(error));
    }

    fn observe(&self, operation: Operation, activity: Activity, key: Option<&dyn Debug>, error: Option<&dyn Display>) {
        #[cfg(any(feature = "metrics", test))]
        if let Some(counter) = &self.event_counter {
            counter.add(
                1,
                &[
                    KeyValue::new(attributes::CACHE_REGION_NAME, self.region.to_string()),
                    KeyValue::new(attributes::CACHE_OPERATION_NAME, operation.as_str()),
                    KeyValue::new(attributes::CACHE_ACTIVITY_NAME, activity.as_str()),
                ],
            );
        }

        // Degraded paths are always reported.
        if self.logs_enabled || matches!(activity.severity(), Severity::Warn | Severity::Error) {
            Self::emit(&self.region, operation, activity, key, error);
        }
    }

    fn emit(region: &str, operation: Operation, activity: Activity, key: Option<&dyn Debug>, error: Option<&dyn Display>) {
        let op = operation.as_str();
        let ev = activity.as_str();
        let key = key.map(tracing::field::debug);
        let error = error.map(tracing::field::display);

        // Tracing level must be constant, so a macro selects it.
        macro_rules! emit_event {
            ($level:ident) => {
                tracing::$level!(
                    cache.region = region,
                    cache.operation = op,
                    cache.activity = ev,
                    cache.key = key,
                    error = error,
                    "cache.coherence"
                )
            };
        }

        match activity.severity() {
            Severity::Error => emit_event!(error),
            Severity::Warn => emit_event!(warn),
            Severity::Info => emit_event!(info),
            Severity::Debug => emit_event!(debug),
            _ => {}
        }
    }
}
