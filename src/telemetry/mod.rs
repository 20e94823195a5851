// SPDX-License-Identifier: Apache-2.0

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Meter;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait Counter<T> {
    fn add(&self, value: T, attributes: &[KeyValue]);
}

#[derive(Clone)]
pub enum LoggateCounter<T> {
    OTELCounter(opentelemetry::metrics::Counter<T>),
    NoOpCounter,
}

impl<T> Counter<T> for LoggateCounter<T> {
    fn add(&self, value: T, attributes: &[KeyValue]) {
        match self {
            LoggateCounter::OTELCounter(c) => c.add(value, attributes),
            LoggateCounter::NoOpCounter => {}
        }
    }
}

pub fn get_meter() -> Meter {
    global::meter("loggate")
}

// In-process count mirrored to an OTel counter.
struct StatCounter {
    value: AtomicU64,
    otel: LoggateCounter<u64>,
}

impl StatCounter {
    fn noop() -> Self {
        Self {
            value: AtomicU64::new(0),
            otel: LoggateCounter::NoOpCounter,
        }
    }

    fn otel(meter: &Meter, name: &'static str, description: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            otel: LoggateCounter::OTELCounter(
                meter
                    .u64_counter(name)
                    .with_description(description)
                    .with_unit("records")
                    .build(),
            ),
        }
    }

    fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
        self.otel.add(n, &[]);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Record counts for one collector and its sink.
pub struct PipelineStats {
    accepted: StatCounter,
    dropped_queue_full: StatCounter,
    dropped_on_close: StatCounter,
    delivered: StatCounter,
    delivery_failed: StatCounter,
    encode_failed: StatCounter,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub dropped_queue_full: u64,
    pub dropped_on_close: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub encode_failed: u64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            accepted: StatCounter::noop(),
            dropped_queue_full: StatCounter::noop(),
            dropped_on_close: StatCounter::noop(),
            delivered: StatCounter::noop(),
            delivery_failed: StatCounter::noop(),
            encode_failed: StatCounter::noop(),
        }
    }
}

impl PipelineStats {
    /// Stats that also report through the global OpenTelemetry meter.
    pub fn with_meter() -> Self {
        let meter = get_meter();
        Self {
            accepted: StatCounter::otel(
                &meter,
                "loggate_collector_accepted_records",
                "Number of access log records queued for delivery",
            ),
            dropped_queue_full: StatCounter::otel(
                &meter,
                "loggate_collector_dropped_records",
                "Number of access log records dropped because the queue was full",
            ),
            dropped_on_close: StatCounter::otel(
                &meter,
                "loggate_collector_discarded_on_close_records",
                "Number of queued records discarded when the final flush timed out",
            ),
            delivered: StatCounter::otel(
                &meter,
                "loggate_sink_delivered_records",
                "Number of access log records handed to the backend",
            ),
            delivery_failed: StatCounter::otel(
                &meter,
                "loggate_sink_failed_records",
                "Number of access log records the backend refused or that timed out",
            ),
            encode_failed: StatCounter::otel(
                &meter,
                "loggate_sink_encode_failed_records",
                "Number of access log records dropped during serialization or compression",
            ),
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.add(1);
    }

    pub fn record_queue_full(&self) {
        self.dropped_queue_full.add(1);
    }

    pub fn record_dropped_on_close(&self, n: u64) {
        self.dropped_on_close.add(n);
    }

    pub fn record_delivered(&self) {
        self.delivered.add(1);
    }

    pub fn record_delivery_failed(&self, n: u64) {
        self.delivery_failed.add(n);
    }

    pub fn record_encode_failed(&self) {
        self.encode_failed.add(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.get(),
            dropped_queue_full: self.dropped_queue_full.get(),
            dropped_on_close: self.dropped_on_close.get(),
            delivered: self.delivered.get(),
            delivery_failed: self.delivery_failed.get(),
            encode_failed: self.encode_failed.get(),
        }
    }
}
