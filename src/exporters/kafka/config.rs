// SPDX-License-Identifier: Apache-2.0

use crate::config::TOPIC_PROPERTY;
use crate::exporters::ConnectionProps;
use crate::exporters::kafka::errors::{KafkaSinkError, Result};
use rdkafka::ClientConfig;
use std::collections::HashMap;
use std::time::Duration;

pub const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";

/// Property keys carried in the connection map that are not librdkafka
/// settings and must not reach the client config.
const NON_CLIENT_PROPERTIES: [&str; 4] = [
    TOPIC_PROPERTY,
    "namesrvAddr",
    "key.serializer",
    "value.serializer",
];

/// Kafka acknowledgement configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcknowledgementMode {
    /// acks=0
    None,
    /// acks=1
    #[default]
    One,
    /// acks=all
    All,
}

impl AcknowledgementMode {
    pub fn to_kafka_value(&self) -> &'static str {
        match self {
            AcknowledgementMode::None => "0",
            AcknowledgementMode::One => "1",
            AcknowledgementMode::All => "all",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(AcknowledgementMode::None),
            "1" | "one" => Ok(AcknowledgementMode::One),
            "all" | "-1" => Ok(AcknowledgementMode::All),
            other => Err(KafkaSinkError::Configuration(format!(
                "unsupported acks value: {}",
                other
            ))),
        }
    }
}

/// Producer settings for the Kafka sink, read from flat connection properties.
#[derive(Clone, Debug)]
pub struct KafkaSinkConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Default destination topic
    pub topic: String,

    pub acks: AcknowledgementMode,

    pub client_id: String,

    /// Linger time in milliseconds (queue.buffering.max.ms)
    pub linger_ms: u32,

    /// Message timeout in milliseconds
    pub message_timeout_ms: u32,

    /// Time to wait for a single delivery report
    pub request_timeout_ms: u32,

    /// Remaining librdkafka settings, applied last
    pub producer_config: HashMap<String, String>,
}

impl Default for KafkaSinkConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: crate::config::DEFAULT_TOPIC.to_string(),
            acks: AcknowledgementMode::default(),
            client_id: "loggate".to_string(),
            linger_ms: 5,
            message_timeout_ms: 30000,
            request_timeout_ms: 30000,
            producer_config: HashMap::new(),
        }
    }
}

impl KafkaSinkConfig {
    /// Build from connection properties. `topic` and `bootstrap.servers` are
    /// required; recognised keys override defaults, all other keys are
    /// forwarded to librdkafka untouched.
    pub fn from_props(props: &ConnectionProps) -> Result<Self> {
        let mut config = KafkaSinkConfig::default();

        config.topic = required(props, TOPIC_PROPERTY)?;
        config.brokers = required(props, BOOTSTRAP_SERVERS)?;

        for (key, value) in props {
            if key == BOOTSTRAP_SERVERS || NON_CLIENT_PROPERTIES.contains(&key.as_str()) {
                continue;
            }
            match key.as_str() {
                "acks" => config.acks = AcknowledgementMode::parse(value)?,
                "client.id" => config.client_id = value.clone(),
                "linger.ms" => config.linger_ms = parse_ms(key, value)?,
                "message.timeout.ms" => config.message_timeout_ms = parse_ms(key, value)?,
                "request.timeout.ms" => config.request_timeout_ms = parse_ms(key, value)?,
                _ => {
                    config.producer_config.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms as u64)
    }

    /// Build rdkafka ClientConfig from this configuration
    pub fn build_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set(BOOTSTRAP_SERVERS, &self.brokers);
        config.set("client.id", &self.client_id);
        config.set("linger.ms", self.linger_ms.to_string());
        config.set("acks", self.acks.to_kafka_value());
        config.set("message.timeout.ms", self.message_timeout_ms.to_string());
        config.set("request.timeout.ms", self.request_timeout_ms.to_string());

        // Custom settings override built-in options
        for (key, value) in &self.producer_config {
            config.set(key, value);
        }

        config
    }
}

fn required(props: &ConnectionProps, key: &str) -> Result<String> {
    props
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| KafkaSinkError::Configuration(format!("missing required property {}", key)))
}

fn parse_ms(key: &str, value: &str) -> Result<u32> {
    value.trim().parse::<u32>().map_err(|e| {
        KafkaSinkError::Configuration(format!("invalid value for {}: {} ({})", key, value, e))
    })
}
