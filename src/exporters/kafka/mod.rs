// SPDX-License-Identifier: Apache-2.0

//! Kafka transport for the broker sink.
//!
//! Records are produced one message per record with rdkafka's
//! `FutureProducer`. Delivery errors are classified as fatal or transient
//! so the broker sink can tear the producer down when it is no longer
//! usable.

pub mod config;
pub mod errors;
pub mod exporter;


pub use config::KafkaSinkConfig;
pub use exporter::{KafkaConnector, KafkaTransport};
