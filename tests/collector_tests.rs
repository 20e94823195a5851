// SPDX-License-Identifier: Apache-2.0

//! End-to-end runs of the collector and broker sink over an in-memory
//! transport.

use async_trait::async_trait;
use bytes::Bytes;
use loggate::collector::Collector;
use loggate::compression::{CompressedEnvelope, Compression};
use loggate::config::{BatchConfig, ConfigHandle, LogCollectConfig};
use loggate::exporters::broker::{BrokerSink, Connect, Transport, TransportError};
use loggate::exporters::{ConnectionProps, LogSink, SinkContext, SinkFactory};
use loggate::record::AccessLogRecord;
use loggate::sampling::Sampler;
use loggate::telemetry::PipelineStats;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Clone, Default)]
struct MemoryBroker {
    topics: Arc<Mutex<Vec<(String, Bytes)>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
}

impl MemoryBroker {
    fn messages(&self) -> Vec<(String, Bytes)> {
        self.topics.lock().unwrap().clone()
    }

    fn factory(&self) -> SinkFactory {
        let broker = self.clone();
        Arc::new(move |ctx: SinkContext| -> Box<dyn LogSink> {
            Box::new(BrokerSink::new("memory", broker.clone(), ctx))
        })
    }
}

struct MemoryTransport(MemoryBroker);

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        // plain JSON payloads can be checked against the failing paths
        if let Ok(record) = AccessLogRecord::from_json(&payload) {
            if self.0.fail_paths.lock().unwrap().contains(&record.path) {
                return Err(TransportError::Transient("broker unavailable".into()));
            }
        }
        self.0
            .topics
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self, _timeout: Duration) {}
}

impl Connect for MemoryBroker {
    type Transport = MemoryTransport;

    fn connect(&self, _props: &ConnectionProps) -> loggate::exporters::Result<MemoryTransport> {
        Ok(MemoryTransport(self.clone()))
    }
}

fn config() -> LogCollectConfig {
    LogCollectConfig {
        topic: "access".to_string(),
        batch: BatchConfig {
            max_size: 16,
            interval_ms: 10,
        },
        ..Default::default()
    }
}

fn collector(config: LogCollectConfig, broker: &MemoryBroker) -> Collector {
    Collector::with_stats(
        Arc::new(ConfigHandle::new(config)),
        broker.factory(),
        Arc::new(PipelineStats::default()),
    )
}

fn record(path: &str) -> AccessLogRecord {
    AccessLogRecord::builder("GET", path)
        .with_client_ip("192.0.2.10")
        .with_status(200)
        .build()
}

#[tokio::test]
async fn lz4_record_is_routed_to_override_topic() {
    let broker = MemoryBroker::default();
    let mut cfg = config();
    cfg.compress_alg = Compression::Lz4;
    cfg.route_topics
        .insert("/api/orders".to_string(), "orders-topic".to_string());
    let c = collector(cfg, &broker);
    c.start().await;

    let rec = record("/api/orders");
    let serialized = rec.to_json().unwrap();
    c.collect(rec);
    c.close().await;

    let messages = broker.messages();
    assert_eq!(1, messages.len());
    assert_eq!("orders-topic", messages[0].0);
    let envelope = CompressedEnvelope::from_json(&messages[0].1).unwrap();
    assert_eq!(Compression::Lz4, envelope.algorithm);
    assert_eq!(serialized.len() as u64, envelope.original_size);
    assert_eq!(serialized, envelope.open().unwrap());
}

#[tokio::test]
async fn unrouted_record_goes_to_default_topic() {
    let broker = MemoryBroker::default();
    let c = collector(config(), &broker);
    c.start().await;

    c.collect(record("/api/unknown"));
    c.close().await;

    let messages = broker.messages();
    assert_eq!(1, messages.len());
    assert_eq!("access", messages[0].0);
}

#[tokio::test]
async fn one_failed_record_does_not_block_the_batch() {
    let broker = MemoryBroker::default();
    broker
        .fail_paths
        .lock()
        .unwrap()
        .push("/2".to_string());
    let c = collector(
        LogCollectConfig {
            batch: BatchConfig {
                max_size: 16,
                interval_ms: 60_000,
            },
            ..config()
        },
        &broker,
    );
    c.start().await;
    sleep(Duration::from_millis(20)).await;

    for path in ["/1", "/2", "/3"] {
        c.collect(record(path));
    }
    c.close().await;

    let paths: Vec<String> = broker
        .messages()
        .iter()
        .map(|(_, p)| AccessLogRecord::from_json(p).unwrap().path)
        .collect();
    assert_eq!(vec!["/1".to_string(), "/3".to_string()], paths);

    let stats = c.stats();
    assert_eq!(2, stats.delivered);
    assert_eq!(1, stats.delivery_failed);
}

#[tokio::test]
async fn missing_topic_leaves_collector_degraded() {
    let broker = MemoryBroker::default();
    let c = collector(
        LogCollectConfig {
            topic: "  ".to_string(),
            ..config()
        },
        &broker,
    );
    c.start().await;
    assert!(c.is_started());

    c.collect(record("/api/orders"));
    c.close().await;

    assert!(broker.messages().is_empty());
    assert_eq!(1, c.stats().accepted);
    assert_eq!(1, c.stats().delivery_failed);
}

#[tokio::test]
async fn config_update_applies_to_next_batch() {
    let broker = MemoryBroker::default();
    let handle = Arc::new(ConfigHandle::new(config()));
    let c = Collector::with_stats(
        handle.clone(),
        broker.factory(),
        Arc::new(PipelineStats::default()),
    );
    c.start().await;

    c.collect(record("/api/users"));
    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.messages().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut updated = config();
    updated
        .route_topics
        .insert("/api/users".to_string(), "users-topic".to_string());
    updated.route_samplers = HashMap::from([("/health".to_string(), Sampler::Never)]);
    handle.update(updated);
    assert!(!handle.is_sampled("/health"));

    c.collect(record("/api/users"));
    c.close().await;

    let topics: Vec<String> = broker.messages().into_iter().map(|(t, _)| t).collect();
    assert_eq!(vec!["access".to_string(), "users-topic".to_string()], topics);
}

#[tokio::test]
async fn concurrent_producers_all_delivered() {
    let broker = MemoryBroker::default();
    let c = Arc::new(collector(config(), &broker));
    c.start().await;

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let c = c.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..250 {
                c.collect(record(&format!("/w{}/{}", worker, i)));
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    c.close().await;

    assert_eq!(1000, broker.messages().len());
    // per-producer order is preserved
    let w0: Vec<String> = broker
        .messages()
        .iter()
        .map(|(_, p)| AccessLogRecord::from_json(p).unwrap().path)
        .filter(|p| p.starts_with("/w0/"))
        .collect();
    let expected: Vec<String> = (0..250).map(|i| format!("/w0/{}", i)).collect();
    assert_eq!(expected, w0);
}
