// SPDX-License-Identifier: Apache-2.0

//! Sinks that deliver batches of access log records to a backend.

pub mod blackhole;
pub mod broker;
#[cfg(feature = "rdkafka")]
pub mod kafka;
pub mod request_builder;

use crate::compression::CompressionError;
use crate::config::{ConfigHandle, SinkKind};
use crate::record::AccessLogRecord;
use crate::telemetry::PipelineStats;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Flat backend connection properties (topic, broker addresses, credentials).
pub type ConnectionProps = HashMap<String, String>;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("invalid sink configuration: {0}")]
    Configuration(String),

    #[error("failed to compress record: {0}")]
    Compression(#[from] CompressionError),

    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Delivery target driven by the collector's dispatch loop.
///
/// `consume` never fails: delivery problems are logged and counted by the
/// sink itself so they can never reach the request path.
#[async_trait]
pub trait LogSink: Send {
    fn name(&self) -> &'static str;

    async fn init(&mut self, props: &ConnectionProps) -> Result<()>;

    async fn consume(&mut self, batch: Vec<AccessLogRecord>);

    /// Releases backend resources. Safe to call more than once.
    async fn close(&mut self);
}

/// Shared state handed to a sink when the collector builds it.
#[derive(Clone)]
pub struct SinkContext {
    pub config: Arc<ConfigHandle>,
    pub stats: Arc<PipelineStats>,
}

/// Builds a fresh sink on every collector start.
pub type SinkFactory = Arc<dyn Fn(SinkContext) -> Box<dyn LogSink> + Send + Sync>;

/// Factory selecting the sink from the configured [`SinkKind`].
pub fn default_sink_factory() -> SinkFactory {
    Arc::new(|ctx: SinkContext| build_sink(ctx.config.snapshot().sink, ctx))
}

pub fn build_sink(kind: SinkKind, ctx: SinkContext) -> Box<dyn LogSink> {
    match kind {
        #[cfg(feature = "rdkafka")]
        SinkKind::Kafka => Box::new(broker::BrokerSink::new(
            "kafka",
            kafka::KafkaConnector::default(),
            ctx,
        )),
        #[cfg(not(feature = "rdkafka"))]
        SinkKind::Kafka => {
            tracing::error!("Kafka sink requested but loggate was built without rdkafka, records will be discarded");
            Box::new(blackhole::BlackholeSink::new(ctx.stats))
        }
        SinkKind::Blackhole => Box::new(blackhole::BlackholeSink::new(ctx.stats)),
    }
}
