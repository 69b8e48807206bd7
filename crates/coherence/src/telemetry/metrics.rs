// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! OpenTelemetry meter setup.

use opentelemetry::{
    InstrumentationScope,
    metrics::{Counter, Meter, MeterProvider},
};

const METER_NAME: &str = "coherence";
const VERSION: &str = "v0.1.0";
const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.47.0";
const COHERENCE_EVENT_COUNT_NAME: &str = "cache.coherence.event.count";

pub(crate) fn create_meter(meter_provider: &dyn MeterProvider) -> Meter {
    meter_provider.meter_with_scope(
        InstrumentationScope::builder(METER_NAME)
            .with_version(VERSION)
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
}

pub(crate) fn create_event_counter(meter: &Meter) -> Counter<u64> {
    meter
        .u64_counter(COHERENCE_EVENT_COUNT_NAME)
        .with_description("Cache coherence events")
        .with_unit("{event}")
        .build()
}
