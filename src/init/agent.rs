// SPDX-License-Identifier: Apache-2.0

use crate::collector::Collector;
use crate::config::{ConfigHandle, LogCollectConfig};
use crate::record::AccessLogRecord;
use crate::telemetry::StatsSnapshot;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ships newline-delimited JSON access records through a collector.
pub struct Agent {
    config: Arc<ConfigHandle>,
    input: Option<PathBuf>,
}

/// What one agent run did with its input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgentReport {
    pub lines: u64,
    pub malformed: u64,
    pub unsampled: u64,
    pub stats: StatsSnapshot,
}

impl Agent {
    pub fn new(config: LogCollectConfig, input: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(ConfigHandle::new(config)),
            input,
        }
    }

    /// Run until the input is exhausted or `agent_cancel` fires, then close
    /// the collector.
    pub async fn run(
        self,
        agent_cancel: CancellationToken,
    ) -> Result<AgentReport, Box<dyn Error + Send + Sync>> {
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &self.input {
            Some(path) => {
                info!(path = %path.display(), "Reading access records from file");
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
                Box::new(BufReader::new(file))
            }
            None => {
                info!("Reading access records from stdin");
                Box::new(BufReader::new(tokio::io::stdin()))
            }
        };

        let collector = Arc::new(Collector::with_default_sink(self.config.clone()));
        collector.start().await;

        let result = ship(&collector, reader, &agent_cancel).await;

        collector.close().await;

        let mut report = result?;
        report.stats = collector.stats();
        info!(
            lines = report.lines,
            malformed = report.malformed,
            unsampled = report.unsampled,
            accepted = report.stats.accepted,
            delivered = report.stats.delivered,
            failed = report.stats.delivery_failed,
            dropped = report.stats.dropped_queue_full + report.stats.dropped_on_close,
            "Agent finished"
        );
        Ok(report)
    }
}

async fn ship<R: AsyncBufRead + Unpin>(
    collector: &Collector,
    reader: R,
    cancel: &CancellationToken,
) -> Result<AgentReport, Box<dyn Error + Send + Sync>> {
    let mut report = AgentReport::default();
    let mut lines = reader.lines();

    loop {
        let line = select! {
            _ = cancel.cancelled() => {
                debug!("Agent received shutdown signal, stop reading input");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("Reached end of input");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        report.lines += 1;

        let record = match AccessLogRecord::from_json(line.as_bytes()) {
            Ok(r) => r,
            Err(e) => {
                warn!(line = report.lines, error = %e, "Skipping malformed access record");
                report.malformed += 1;
                continue;
            }
        };
        if !collector.config().is_sampled(&record.path) {
            report.unsampled += 1;
            continue;
        }
        collector.collect(record);
    }

    Ok(report)
}
