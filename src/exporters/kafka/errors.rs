// SPDX-License-Identifier: Apache-2.0

use crate::exporters::SinkError;
use crate::exporters::broker::TransportError;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Errors that can occur in the Kafka sink
#[derive(Error, Debug)]
pub enum KafkaSinkError {
    #[error("Kafka producer error: {0}")]
    ProducerError(#[from] KafkaError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl From<KafkaSinkError> for SinkError {
    fn from(e: KafkaSinkError) -> Self {
        match e {
            KafkaSinkError::Configuration(msg) => SinkError::Configuration(msg),
            KafkaSinkError::ProducerError(e) => {
                SinkError::Configuration(format!("failed to create producer: {}", e))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, KafkaSinkError>;

/// Error codes after which the producer can no longer be used.
fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Fatal
            | RDKafkaErrorCode::Fenced
            | RDKafkaErrorCode::ProducerFenced
            | RDKafkaErrorCode::InvalidProducerEpoch
            | RDKafkaErrorCode::OutOfOrderSequenceNumber
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
    )
}

/// Sort a delivery error into fatal or transient.
pub fn classify(error: &KafkaError) -> TransportError {
    match error.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => TransportError::Fatal(error.to_string()),
        _ => TransportError::Transient(error.to_string()),
    }
}
