// SPDX-License-Identifier: Apache-2.0

use crate::compression::Compression;
use crate::config::{ConfigError, LogCollectConfig, OverflowPolicy, SinkKind, TOPIC_PROPERTY};
use crate::init::parse;
use crate::sampling::Sampler;
use clap::{Args, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// TOML configuration file, overridden by LOGGATE_* variables and flags
    #[arg(long, env = "LOGGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Newline-delimited JSON access records to ship, stdin when omitted
    #[arg(long, env = "LOGGATE_INPUT")]
    pub input: Option<PathBuf>,

    /// Sink driven by the collector
    #[arg(value_enum, long, env = "LOGGATE_SINK")]
    pub sink: Option<SinkArg>,

    /// Capacity of the in-memory record queue
    #[arg(long, env = "LOGGATE_BUFFER_QUEUE_SIZE")]
    pub buffer_queue_size: Option<usize>,

    /// What to drop when the queue is full
    #[arg(value_enum, long, env = "LOGGATE_OVERFLOW")]
    pub overflow: Option<OverflowArg>,

    /// Records handed to the sink per batch
    #[arg(long, env = "LOGGATE_BATCH_MAX_SIZE")]
    pub batch_max_size: Option<usize>,

    /// Interval between queue drains
    #[arg(long, env = "LOGGATE_BATCH_INTERVAL")]
    pub batch_interval: Option<humantime::Duration>,

    /// Upper bound on the final flush at shutdown
    #[arg(long, env = "LOGGATE_FLUSH_TIMEOUT")]
    pub flush_timeout: Option<humantime::Duration>,

    /// Payload compression (none, lz4, gzip)
    #[arg(long, env = "LOGGATE_COMPRESS_ALG")]
    pub compress_alg: Option<Compression>,

    /// Global sample rate: 1 keeps everything, 0 nothing
    #[arg(long, env = "LOGGATE_SAMPLE_RATE")]
    pub sample_rate: Option<Sampler>,

    /// Per-path sample rates (path=rate,...)
    #[arg(long, value_parser = parse::parse_key_val::<String, Sampler>, value_delimiter = ',')]
    pub route_samplers: Vec<(String, Sampler)>,

    /// Default destination topic
    #[arg(long, env = "LOGGATE_TOPIC")]
    pub topic: Option<String>,

    /// Per-path destination topics (path=topic,...)
    #[arg(long, value_parser = parse::parse_key_val::<String, String>, value_delimiter = ',')]
    pub route_topics: Vec<(String, String)>,

    /// Kafka broker addresses (comma-separated)
    #[arg(long, env = "LOGGATE_KAFKA_BROKERS")]
    pub kafka_brokers: Option<String>,

    /// Additional producer settings (key=value,...)
    #[arg(long, env = "LOGGATE_KAFKA_PRODUCER_CONFIG", value_parser = parse::parse_key_val::<String, String>, value_delimiter = ',')]
    pub kafka_producer_config: Vec<(String, String)>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum SinkArg {
    Kafka,
    Blackhole,
}

impl From<SinkArg> for SinkKind {
    fn from(value: SinkArg) -> Self {
        match value {
            SinkArg::Kafka => SinkKind::Kafka,
            SinkArg::Blackhole => SinkKind::Blackhole,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum OverflowArg {
    DropNewest,
    DropOldest,
}

impl From<OverflowArg> for OverflowPolicy {
    fn from(value: OverflowArg) -> Self {
        match value {
            OverflowArg::DropNewest => OverflowPolicy::DropNewest,
            OverflowArg::DropOldest => OverflowPolicy::DropOldest,
        }
    }
}

impl AgentRun {
    /// Load the file and environment layers, then apply flags on top.
    pub fn build_config(&self) -> Result<LogCollectConfig, ConfigError> {
        let mut config = LogCollectConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut LogCollectConfig) {
        if let Some(sink) = self.sink {
            config.sink = sink.into();
        }
        if let Some(size) = self.buffer_queue_size {
            config.buffer_queue_size = size;
        }
        if let Some(overflow) = self.overflow {
            config.overflow = overflow.into();
        }
        if let Some(size) = self.batch_max_size {
            config.batch.max_size = size;
        }
        if let Some(interval) = self.batch_interval {
            config.batch.interval_ms = interval.as_millis() as u64;
        }
        if let Some(timeout) = self.flush_timeout {
            config.flush_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(alg) = self.compress_alg {
            config.compress_alg = alg;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = Some(rate);
        }
        config
            .route_samplers
            .extend(self.route_samplers.iter().cloned());
        if let Some(topic) = &self.topic {
            config.topic = topic.clone();
            config
                .producer
                .insert(TOPIC_PROPERTY.to_string(), topic.clone());
        }
        config.route_topics.extend(self.route_topics.iter().cloned());
        if let Some(brokers) = &self.kafka_brokers {
            config
                .producer
                .insert("bootstrap.servers".to_string(), brokers.clone());
        }
        config
            .producer
            .extend(self.kafka_producer_config.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        run: AgentRun,
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "loggate",
            "--sink",
            "blackhole",
            "--buffer-queue-size",
            "10",
            "--overflow",
            "drop-oldest",
            "--batch-interval",
            "1s",
            "--compress-alg",
            "lz4",
            "--sample-rate",
            "0.25",
            "--route-samplers",
            "/health=0",
            "--topic",
            "access",
            "--route-topics",
            "/api/orders=orders-topic,/api/users=users-topic",
            "--kafka-brokers",
            "k1:9092",
            "--kafka-producer-config",
            "acks=all",
        ])
        .unwrap();

        let mut config = LogCollectConfig::default();
        cli.run.apply(&mut config);

        assert_eq!(SinkKind::Blackhole, config.sink);
        assert_eq!(10, config.buffer_queue_size);
        assert_eq!(OverflowPolicy::DropOldest, config.overflow);
        assert_eq!(1000, config.batch.interval_ms);
        assert_eq!(Compression::Lz4, config.compress_alg);
        assert_eq!(Some(Sampler::Rate(0.25)), config.sample_rate);
        assert_eq!(Some(&Sampler::Never), config.route_samplers.get("/health"));
        assert_eq!("access", config.topic);
        assert_eq!(Some("orders-topic"), config.topic_for("/api/orders"));
        assert_eq!(Some("users-topic"), config.topic_for("/api/users"));

        let props = config.connection_props();
        assert_eq!(Some(&"access".to_string()), props.get("topic"));
        assert_eq!(Some(&"k1:9092".to_string()), props.get("bootstrap.servers"));
        assert_eq!(Some(&"all".to_string()), props.get("acks"));
    }

    #[test]
    fn rejects_bad_sample_rate() {
        let res = Cli::try_parse_from(["loggate", "--sample-rate", "1.5"]);
        assert!(res.is_err());
    }
}
