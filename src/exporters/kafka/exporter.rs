// SPDX-License-Identifier: Apache-2.0

use crate::exporters::ConnectionProps;
use crate::exporters::broker::{Connect, Transport, TransportError};
use crate::exporters::kafka::config::KafkaSinkConfig;
use crate::exporters::kafka::errors::{KafkaSinkError, classify};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Creates rdkafka producers from connection properties.
#[derive(Clone, Debug, Default)]
pub struct KafkaConnector;

impl Connect for KafkaConnector {
    type Transport = KafkaTransport;

    fn connect(&self, props: &ConnectionProps) -> crate::exporters::Result<KafkaTransport> {
        let config = KafkaSinkConfig::from_props(props)?;
        Ok(KafkaTransport::new(config)?)
    }
}

pub struct KafkaTransport {
    config: KafkaSinkConfig,
    producer: FutureProducer,
}

impl Debug for KafkaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KafkaTransport {
    pub fn new(config: KafkaSinkConfig) -> Result<Self, KafkaSinkError> {
        let producer: FutureProducer = config.build_client_config().create()?;
        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            "Created Kafka producer"
        );
        Ok(Self { config, producer })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let record = FutureRecord::<(), _>::to(topic).payload(payload.as_ref());
        match self
            .producer
            .send(record, Timeout::After(self.config.request_timeout()))
            .await
        {
            Ok(d) => {
                debug!(
                    topic,
                    partition = d.partition,
                    offset = d.offset,
                    "Access log record delivered"
                );
                Ok(())
            }
            Err((e, _)) => Err(classify(&e)),
        }
    }

    async fn close(&self, timeout: Duration) {
        debug!("Flushing Kafka producer");
        let producer = self.producer.clone();
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await;
        match flushed {
            Ok(Ok(())) => info!("Kafka producer closed"),
            Ok(Err(e)) => warn!(error = %e, "Kafka producer flush did not complete"),
            Err(e) => warn!(error = %e, "Kafka producer flush task failed"),
        }
    }
}
