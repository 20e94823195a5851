// SPDX-License-Identifier: Apache-2.0

use crate::exporters::{ConnectionProps, LogSink, Result};
use crate::record::AccessLogRecord;
use crate::telemetry::PipelineStats;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Discards every batch. Used when no broker backend is configured.
pub struct BlackholeSink {
    stats: Arc<PipelineStats>,
}

impl BlackholeSink {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        BlackholeSink { stats }
    }
}

#[async_trait]
impl LogSink for BlackholeSink {
    fn name(&self) -> &'static str {
        "blackhole"
    }

    async fn init(&mut self, _props: &ConnectionProps) -> Result<()> {
        Ok(())
    }

    async fn consume(&mut self, batch: Vec<AccessLogRecord>) {
        debug!(batch_size = batch.len(), "blackhole sink discarding batch");
        for _ in &batch {
            self.stats.record_delivered();
        }
    }

    async fn close(&mut self) {
        debug!("exiting blackhole sink")
    }
}
