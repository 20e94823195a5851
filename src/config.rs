// SPDX-License-Identifier: Apache-2.0

//! Access log configuration snapshot.
//!
//! The collector and the request path only ever read an immutable
//! [`LogCollectConfig`]. Updates replace the snapshot as a whole through
//! [`ConfigHandle::update`].

use crate::compression::Compression;
use crate::sampling::{Sampler, SamplerTable};
use arc_swap::ArcSwapOption;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BUFFER_QUEUE_SIZE: usize = 50_000;
pub const DEFAULT_MAX_BODY_SIZE: usize = 512 * 1024;
pub const DEFAULT_TOPIC: &str = "shenyu-access-logging";
pub const ENV_PREFIX: &str = "LOGGATE_";

/// Connection property naming the default destination topic.
pub const TOPIC_PROPERTY: &str = "topic";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What the collector does with a record when the queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep what is queued, drop the incoming record.
    #[default]
    #[serde(alias = "drop-newest")]
    DropNewest,
    /// Evict the oldest queued record to make room.
    #[serde(alias = "drop-oldest")]
    DropOldest,
}

/// Which sink the collector drives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Kafka,
    Blackhole,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Upper bound of records handed to the sink in one call
    pub max_size: usize,
    /// Drain tick in milliseconds
    pub interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 512,
            interval_ms: 200,
        }
    }
}

impl BatchConfig {
    /// Records per sink call, never below one.
    pub fn batch_size(&self) -> usize {
        self.max_size.max(1)
    }

    /// Drain tick, never below one millisecond.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogCollectConfig {
    pub buffer_queue_size: usize,
    pub max_request_body_size: usize,
    pub max_response_body_size: usize,
    pub compress_alg: Compression,
    /// Default destination topic
    pub topic: String,
    /// Destination overrides keyed by request path
    pub route_topics: HashMap<String, String>,
    /// Samplers keyed by request path
    pub route_samplers: HashMap<String, Sampler>,
    /// Global fallback sampler
    pub sample_rate: Option<Sampler>,
    pub batch: BatchConfig,
    pub overflow: OverflowPolicy,
    pub flush_timeout_ms: u64,
    pub sink: SinkKind,
    /// Backend client properties, passed to the sink untouched
    pub producer: HashMap<String, String>,
}

impl Default for LogCollectConfig {
    fn default() -> Self {
        Self {
            buffer_queue_size: DEFAULT_BUFFER_QUEUE_SIZE,
            max_request_body_size: DEFAULT_MAX_BODY_SIZE,
            max_response_body_size: DEFAULT_MAX_BODY_SIZE,
            compress_alg: Compression::None,
            topic: DEFAULT_TOPIC.to_string(),
            route_topics: HashMap::new(),
            route_samplers: HashMap::new(),
            sample_rate: None,
            batch: BatchConfig::default(),
            overflow: OverflowPolicy::default(),
            flush_timeout_ms: 3_000,
            sink: SinkKind::default(),
            producer: HashMap::new(),
        }
    }
}

impl LogCollectConfig {
    /// Load from an optional TOML file, overridden by `LOGGATE_*` variables.
    /// Nested keys use a double underscore, e.g. `LOGGATE_BATCH__MAX_SIZE`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: LogCollectConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_size == 0 {
            return Err(ConfigError::Invalid("batch.max_size must be > 0".into()));
        }
        if self.batch.interval_ms == 0 {
            return Err(ConfigError::Invalid("batch.interval_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Queue capacity, never below one.
    pub fn queue_capacity(&self) -> usize {
        self.buffer_queue_size.max(1)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn is_request_body_too_large(&self, len: usize) -> bool {
        len > self.max_request_body_size
    }

    pub fn is_response_body_too_large(&self, len: usize) -> bool {
        len > self.max_response_body_size
    }

    /// Destination override for a path, if any.
    pub fn topic_for(&self, path: &str) -> Option<&str> {
        self.route_topics
            .get(path)
            .map(String::as_str)
            .filter(|t| !t.trim().is_empty())
    }

    /// One-off sampling decision straight from this snapshot. The request
    /// path normally goes through [`ConfigHandle::is_sampled`].
    pub fn is_sampled(&self, path: &str) -> bool {
        self.route_samplers
            .get(path)
            .copied()
            .or(self.sample_rate)
            .unwrap_or_default()
            .should_sample()
    }

    pub fn sampler_table(&self) -> SamplerTable {
        SamplerTable::new(self.route_samplers.clone(), self.sample_rate)
    }

    /// Flat connection properties for the sink. The default topic is
    /// included unless the producer map already names one.
    pub fn connection_props(&self) -> HashMap<String, String> {
        let mut props = self.producer.clone();
        props
            .entry(TOPIC_PROPERTY.to_string())
            .or_insert_with(|| self.topic.clone());
        props
    }
}

/// A snapshot and the sampler table built from it, swapped as one unit.
#[derive(Debug)]
struct Installed {
    config: Arc<LogCollectConfig>,
    samplers: SamplerTable,
}

/// Shared, hot-swappable configuration. Readers load the snapshot and its
/// sampler table together, so an update is never observed half applied.
#[derive(Debug, Default)]
pub struct ConfigHandle {
    current: ArcSwapOption<Installed>,
}

impl ConfigHandle {
    pub fn new(config: LogCollectConfig) -> Self {
        let handle = Self::default();
        handle.update(config);
        handle
    }

    /// Install a new snapshot. Readers see either the old or the new one.
    pub fn update(&self, config: LogCollectConfig) {
        let samplers = config.sampler_table();
        self.current.store(Some(Arc::new(Installed {
            config: Arc::new(config),
            samplers,
        })));
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    /// The installed snapshot, if any.
    pub fn get(&self) -> Option<Arc<LogCollectConfig>> {
        self.current.load().as_ref().map(|i| i.config.clone())
    }

    /// The installed snapshot, or the defaults when none is installed.
    pub fn snapshot(&self) -> Arc<LogCollectConfig> {
        self.get()
            .unwrap_or_else(|| Arc::new(LogCollectConfig::default()))
    }

    /// Sampler for a path: the route sampler, else the global one, else
    /// [`Sampler::Always`].
    pub fn resolve(&self, path: &str) -> Sampler {
        self.current
            .load()
            .as_ref()
            .map_or(Sampler::Always, |i| i.samplers.resolve(path))
    }

    pub fn is_sampled(&self, path: &str) -> bool {
        self.resolve(path).should_sample()
    }

    /// Sampling decision and the snapshot it was made against, read in one
    /// load. `None` when the path is not sampled.
    pub fn sample(&self, path: &str) -> Option<Arc<LogCollectConfig>> {
        match self.current.load().as_ref() {
            Some(i) => i
                .samplers
                .resolve(path)
                .should_sample()
                .then(|| i.config.clone()),
            None => Some(Arc::new(LogCollectConfig::default())),
        }
    }

    /// Without an installed snapshot no body counts as too large.
    pub fn is_request_body_too_large(&self, len: usize) -> bool {
        self.get()
            .is_some_and(|c| c.is_request_body_too_large(len))
    }

    pub fn is_response_body_too_large(&self, len: usize) -> bool {
        self.get()
            .is_some_and(|c| c.is_response_body_too_large(len))
    }
}
