// SPDX-License-Identifier: Apache-2.0

//! Reference sink for message brokers.
//!
//! [`BrokerSink`] owns the parts every broker backend shares: destination
//! routing per record, serialization and optional compression, per-record
//! failure isolation, and teardown on unrecoverable faults. The wire client
//! itself sits behind the [`Transport`] trait.
//!
//! Records of a batch are sent concurrently, at most
//! [`MAX_CONCURRENT_SENDS`] at a time, and are handed to the transport in
//! batch order.

use crate::compression::Compression;
use crate::config::{LogCollectConfig, TOPIC_PROPERTY};
use crate::exporters::request_builder::RecordRequestBuilder;
use crate::exporters::{ConnectionProps, LogSink, Result, SinkContext, SinkError};
use crate::record::AccessLogRecord;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const MAX_CONCURRENT_SENDS: usize = 256;

type EncodeFn = fn(Compression, &AccessLogRecord) -> Result<Bytes>;

fn encode_record(compression: Compression, record: &AccessLogRecord) -> Result<Bytes> {
    RecordRequestBuilder::new(compression).build_message(record)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is doomed (fenced, out of order, not authorized).
    #[error("fatal transport error: {0}")]
    Fatal(String),

    /// The send failed but the connection may still be used.
    #[error("transient transport error: {0}")]
    Transient(String),
}

/// A connected broker client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, topic: &str, payload: Bytes) -> std::result::Result<(), TransportError>;

    /// Flush and release the connection, waiting at most `timeout`.
    async fn close(&self, timeout: Duration);
}

/// Creates a [`Transport`] from connection properties.
pub trait Connect: Send + Sync {
    type Transport: Transport + 'static;

    fn connect(&self, props: &ConnectionProps) -> Result<Self::Transport>;
}

pub struct BrokerSink<C: Connect> {
    name: &'static str,
    connector: C,
    transport: Option<C::Transport>,
    default_topic: String,
    ctx: SinkContext,
    encode: EncodeFn,
}

impl<C: Connect> BrokerSink<C> {
    pub fn new(name: &'static str, connector: C, ctx: SinkContext) -> Self {
        Self {
            name,
            connector,
            transport: None,
            default_topic: String::new(),
            ctx,
            encode: encode_record,
        }
    }

    #[cfg(test)]
    fn with_encoder(mut self, encode: EncodeFn) -> Self {
        self.encode = encode;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    /// Sends every record of `batch`, returning the first fatal error. After
    /// a fatal error no further sends are started; records never sent are
    /// counted as failed.
    async fn send_batch(
        &self,
        config: &LogCollectConfig,
        batch: &[AccessLogRecord],
    ) -> Option<String> {
        let transport = self.transport.as_ref()?;
        let mut records = batch.iter();
        let mut in_flight = FuturesUnordered::new();
        let mut fatal = None;

        loop {
            while fatal.is_none() && in_flight.len() < MAX_CONCURRENT_SENDS {
                let Some(record) = records.next() else {
                    break;
                };
                let payload = match (self.encode)(config.compress_alg, record) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(sink = self.name, path = %record.path, error = %e, "Dropping record that could not be encoded");
                        self.ctx.stats.record_encode_failed();
                        continue;
                    }
                };
                let topic = config
                    .topic_for(&record.path)
                    .unwrap_or(&self.default_topic);
                in_flight.push(async move { (topic, transport.send(topic, payload).await) });
            }

            let Some((topic, result)) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(()) => self.ctx.stats.record_delivered(),
                Err(TransportError::Transient(e)) => {
                    error!(sink = self.name, topic, error = %e, "Failed to push access log record");
                    self.ctx.stats.record_delivery_failed(1);
                }
                Err(TransportError::Fatal(e)) => {
                    self.ctx.stats.record_delivery_failed(1);
                    fatal.get_or_insert(e);
                }
            }
        }

        let unsent = records.len() as u64;
        if unsent > 0 {
            self.ctx.stats.record_delivery_failed(unsent);
        }
        fatal
    }

    async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport
                .close(self.ctx.config.snapshot().flush_timeout())
                .await;
        }
    }
}

#[async_trait]
impl<C: Connect> LogSink for BrokerSink<C> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn init(&mut self, props: &ConnectionProps) -> Result<()> {
        if props.is_empty() {
            return Err(SinkError::Configuration(format!(
                "{} connection properties are empty",
                self.name
            )));
        }
        if self.transport.is_some() {
            self.teardown().await;
        }

        let topic = props
            .get(TOPIC_PROPERTY)
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                SinkError::Configuration(format!("{} sink requires a topic", self.name))
            })?;

        let transport = self.connector.connect(props)?;
        self.default_topic = topic.to_string();
        self.transport = Some(transport);
        info!(sink = self.name, topic = %self.default_topic, "Sink initialized");
        Ok(())
    }

    async fn consume(&mut self, batch: Vec<AccessLogRecord>) {
        if batch.is_empty() {
            return;
        }
        if self.transport.is_none() {
            debug!(
                sink = self.name,
                batch_size = batch.len(),
                "Sink is not connected, dropping batch"
            );
            self.ctx.stats.record_delivery_failed(batch.len() as u64);
            return;
        }

        let config = self.ctx.config.snapshot();
        let fatal = self.send_batch(&config, &batch).await;

        if let Some(e) = fatal {
            error!(
                sink = self.name,
                error = %e,
                "Unrecoverable backend error, closing connection until the next start"
            );
            self.teardown().await;
        }
    }

    async fn close(&mut self) {
        if self.transport.is_some() {
            debug!(sink = self.name, "Closing sink connection");
            self.teardown().await;
        }
    }
}
