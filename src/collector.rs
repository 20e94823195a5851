// SPDX-License-Identifier: Apache-2.0

//! Buffers access log records and drives a sink from a background task.
//!
//! `collect` is called from the request path and never waits: it only
//! pushes into a bounded queue, applying the configured overflow policy
//! when the queue is full. A dispatch task drains the queue in batches on a
//! fixed tick and hands them to the sink.

use crate::bounded_channel::{BoundedReceiver, BoundedSender, TrySendError, bounded};
use crate::config::{ConfigHandle, OverflowPolicy};
use crate::exporters::{LogSink, SinkContext, SinkFactory, default_sink_factory};
use crate::record::AccessLogRecord;
use crate::telemetry::{PipelineStats, StatsSnapshot};
use arc_swap::ArcSwapOption;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

static GLOBAL: OnceLock<Arc<Collector>> = OnceLock::new();

/// Install the process-wide collector. Fails, handing the argument back, if
/// one is already installed.
pub fn install_global(collector: Arc<Collector>) -> Result<(), Arc<Collector>> {
    GLOBAL.set(collector)
}

pub fn global() -> Option<&'static Arc<Collector>> {
    GLOBAL.get()
}

/// Write side of a started collector.
struct Intake {
    tx: BoundedSender<AccessLogRecord>,
    // evicts under DropOldest and collects leftovers after close
    rx: BoundedReceiver<AccessLogRecord>,
    overflow: OverflowPolicy,
    // set once the dispatch task has exited
    finished: AtomicBool,
}

impl Intake {
    /// Discard whatever is still queued, returns how many records that was.
    fn discard_remaining(&self) -> usize {
        self.rx.drain_up_to(usize::MAX).len()
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Collector {
    config: Arc<ConfigHandle>,
    factory: SinkFactory,
    stats: Arc<PipelineStats>,
    intake: ArcSwapOption<Intake>,
    lifecycle: Mutex<Option<Running>>,
}

impl Collector {
    pub fn new(config: Arc<ConfigHandle>, factory: SinkFactory) -> Self {
        Self::with_stats(config, factory, Arc::new(PipelineStats::with_meter()))
    }

    /// Collector using the sink selected by the configuration.
    pub fn with_default_sink(config: Arc<ConfigHandle>) -> Self {
        Self::new(config, default_sink_factory())
    }

    pub fn with_stats(
        config: Arc<ConfigHandle>,
        factory: SinkFactory,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            config,
            factory,
            stats,
            intake: ArcSwapOption::empty(),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.intake.load().is_some()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records currently buffered, zero when stopped.
    pub fn queue_len(&self) -> usize {
        self.intake.load().as_ref().map_or(0, |i| i.tx.len())
    }

    /// Allocate the queue, build and initialize the sink, and spawn the
    /// dispatch task. Does nothing if already started.
    ///
    /// A sink that fails to initialize is reported once; the collector
    /// still starts and drops every batch until the next start.
    pub async fn start(&self) {
        let mut running = self.lifecycle.lock().await;
        if running.is_some() {
            return;
        }

        let config = self.config.snapshot();
        let (tx, rx) = bounded(config.queue_capacity());

        let mut sink = (self.factory)(SinkContext {
            config: self.config.clone(),
            stats: self.stats.clone(),
        });
        let sink_ready = match sink.init(&config.connection_props()).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    sink = sink.name(),
                    error = %e,
                    "Failed to initialize access log sink, records will be dropped"
                );
                false
            }
        };

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher {
            sink,
            sink_ready,
            rx: rx.clone(),
            batch_size: config.batch.batch_size(),
            interval: config.batch.interval(),
            flush_timeout: config.flush_timeout(),
            in_flight: 0,
            stats: self.stats.clone(),
        };
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));

        self.intake.store(Some(Arc::new(Intake {
            tx,
            rx,
            overflow: config.overflow,
            finished: AtomicBool::new(false),
        })));
        *running = Some(Running { cancel, handle });

        info!(
            queue_capacity = config.queue_capacity(),
            batch_size = config.batch.batch_size(),
            overflow = ?config.overflow,
            "Access log collector started"
        );
    }

    /// Enqueue a record. Never blocks and never fails; a record that cannot
    /// be queued is counted and dropped.
    pub fn collect(&self, record: AccessLogRecord) {
        let guard = self.intake.load();
        if let Some(intake) = guard.as_ref() {
            self.enqueue(intake, record);
        }
    }

    fn enqueue(&self, intake: &Intake, record: AccessLogRecord) {
        let queued = match intake.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => match intake.overflow {
                OverflowPolicy::DropNewest => {
                    trace!("Access log queue full, dropping record");
                    self.stats.record_queue_full();
                    false
                }
                OverflowPolicy::DropOldest => {
                    if intake.rx.try_recv().is_some() {
                        self.stats.record_queue_full();
                    }
                    match intake.tx.try_send(record) {
                        Ok(()) => true,
                        Err(_) => {
                            self.stats.record_queue_full();
                            false
                        }
                    }
                }
            },
            // the intake keeps a receiver, so the queue never disconnects
            Err(TrySendError::Disconnected(_)) => false,
        };
        if !queued {
            return;
        }
        self.stats.record_accepted();

        // close() finished draining while this record was being queued
        if intake.finished.load(Ordering::SeqCst) {
            let discarded = intake.discard_remaining();
            self.stats.record_dropped_on_close(discarded as u64);
        }
    }

    /// Stop accepting records, flush what is buffered within the flush
    /// timeout, close the sink, and wait for the dispatch task.
    pub async fn close(&self) {
        let mut running = self.lifecycle.lock().await;
        let Some(Running { cancel, handle }) = running.take() else {
            return;
        };

        let intake = self.intake.swap(None);
        cancel.cancel();
        if let Err(e) = handle.await {
            error!(error = ?e, "Access log dispatch task failed");
        }

        // records queued by collect calls that raced with the swap above
        if let Some(intake) = intake {
            intake.finished.store(true, Ordering::SeqCst);
            let discarded = intake.discard_remaining();
            if discarded > 0 {
                self.stats.record_dropped_on_close(discarded as u64);
                debug!(discarded, "Discarded access log records queued during close");
            }
        }
        info!("Access log collector stopped");
    }
}

struct Dispatcher {
    sink: Box<dyn LogSink>,
    sink_ready: bool,
    rx: BoundedReceiver<AccessLogRecord>,
    batch_size: usize,
    interval: Duration,
    flush_timeout: Duration,
    // size of the batch the sink is working on
    in_flight: usize,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    async fn run(mut self, cancel: CancellationToken) {
        let flush_timeout = self.flush_timeout;
        let timed_out = {
            let mut work = pin!(self.dispatch(&cancel));
            select! {
                biased;

                _ = &mut work => false,
                _ = cancel.cancelled() => {
                    debug!("Access log dispatcher received shutdown signal");
                    // a batch may be in flight, it shares the flush budget
                    tokio::time::timeout(flush_timeout, &mut work).await.is_err()
                }
            }
        };

        if timed_out {
            let discarded = self.in_flight + self.rx.drain_up_to(usize::MAX).len();
            self.stats.record_dropped_on_close(discarded as u64);
            warn!(
                discarded,
                timeout = ?flush_timeout,
                "Final flush of access logs timed out, discarding remaining records"
            );
        }
        self.sink.close().await;
    }

    /// Drain on every tick until cancelled, then flush what is queued.
    async fn dispatch(&mut self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    // keep going while batches come back full
                    while self.drain_batch().await == self.batch_size {
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                }
            }
        }

        while self.drain_batch().await > 0 {}
    }

    /// Hands at most one batch to the sink, returns its size.
    async fn drain_batch(&mut self) -> usize {
        let records = self.rx.drain_up_to(self.batch_size);
        let n = records.len();
        if n == 0 {
            return 0;
        }

        if self.sink_ready {
            trace!(batch_size = n, sink = self.sink.name(), "Dispatching batch");
            self.in_flight = n;
            self.sink.consume(records).await;
            self.in_flight = 0;
        } else {
            self.stats.record_delivery_failed(n as u64);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, LogCollectConfig};
    use crate::exporters::{ConnectionProps, SinkError};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    struct Recorder {
        batches: Arc<StdMutex<Vec<Vec<AccessLogRecord>>>>,
        built: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        consume_delay: Option<Duration>,
        fail_init: bool,
    }

    impl Recorder {
        fn paths(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .map(|r| r.path.clone())
                .collect()
        }

        fn factory(&self) -> SinkFactory {
            let recorder = self.clone();
            Arc::new(move |_ctx: SinkContext| -> Box<dyn LogSink> {
                recorder.built.fetch_add(1, Ordering::SeqCst);
                Box::new(RecordingSink {
                    recorder: recorder.clone(),
                })
            })
        }
    }

    struct RecordingSink {
        recorder: Recorder,
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn init(&mut self, _props: &ConnectionProps) -> crate::exporters::Result<()> {
            if self.recorder.fail_init {
                return Err(SinkError::Configuration("no brokers".into()));
            }
            Ok(())
        }

        async fn consume(&mut self, batch: Vec<AccessLogRecord>) {
            if let Some(delay) = self.recorder.consume_delay {
                tokio::time::sleep(delay).await;
            }
            self.recorder.batches.lock().unwrap().push(batch);
        }

        async fn close(&mut self) {
            self.recorder.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(i: usize) -> AccessLogRecord {
        AccessLogRecord::builder("GET", format!("/r/{}", i)).build()
    }

    fn paths(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
        range.map(|i| format!("/r/{}", i)).collect()
    }

    fn collector(config: LogCollectConfig, recorder: &Recorder) -> Collector {
        Collector::with_stats(
            Arc::new(ConfigHandle::new(config)),
            recorder.factory(),
            Arc::new(PipelineStats::default()),
        )
    }

    /// Drain tick long enough that nothing is dispatched before close.
    fn idle_config(queue: usize) -> LogCollectConfig {
        LogCollectConfig {
            buffer_queue_size: queue,
            batch: BatchConfig {
                max_size: 512,
                interval_ms: 60_000,
            },
            ..Default::default()
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn collect_before_start_is_noop() {
        let recorder = Recorder::default();
        let c = collector(idle_config(10), &recorder);

        c.collect(record(1));
        assert!(!c.is_started());
        assert_eq!(0, c.queue_len());
        assert_eq!(0, c.stats().accepted);
        assert_eq!(0, recorder.built.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn queue_full_drops_newest() {
        let recorder = Recorder::default();
        let c = collector(idle_config(3), &recorder);
        c.start().await;
        // let the first, immediate tick pass
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 1..=4 {
            c.collect(record(i));
        }
        assert_eq!(3, c.queue_len());
        assert_eq!(3, c.stats().accepted);
        assert_eq!(1, c.stats().dropped_queue_full);

        c.close().await;
        assert_eq!(paths(1..=3), recorder.paths());
    }

    #[tokio::test]
    async fn queue_full_drops_oldest() {
        let recorder = Recorder::default();
        let config = LogCollectConfig {
            overflow: OverflowPolicy::DropOldest,
            ..idle_config(3)
        };
        let c = collector(config, &recorder);
        c.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 1..=4 {
            c.collect(record(i));
        }
        assert_eq!(3, c.queue_len());
        assert_eq!(1, c.stats().dropped_queue_full);

        c.close().await;
        assert_eq!(paths(2..=4), recorder.paths());
    }

    #[tokio::test]
    async fn zero_capacity_is_raised_to_one() {
        let recorder = Recorder::default();
        let c = collector(idle_config(0), &recorder);
        c.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        c.collect(record(1));
        c.collect(record(2));
        assert_eq!(1, c.queue_len());
        c.close().await;
    }

    #[tokio::test]
    async fn close_stops_collecting() {
        let recorder = Recorder::default();
        let c = collector(idle_config(10), &recorder);
        c.start().await;
        assert!(c.is_started());

        c.close().await;
        assert!(!c.is_started());
        assert_eq!(1, recorder.closed.load(Ordering::SeqCst));

        c.collect(record(1));
        assert_eq!(0, c.stats().accepted);

        // second close is a no-op
        c.close().await;
        assert_eq!(1, recorder.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let recorder = Recorder::default();
        let c = Arc::new(collector(idle_config(10), &recorder));

        let (a, b) = (c.clone(), c.clone());
        tokio::join!(a.start(), b.start());
        c.start().await;
        assert_eq!(1, recorder.built.load(Ordering::SeqCst));

        c.close().await;
    }

    #[tokio::test]
    async fn restart_builds_fresh_sink() {
        let recorder = Recorder::default();
        let c = collector(idle_config(10), &recorder);

        c.start().await;
        c.close().await;
        c.start().await;
        c.collect(record(1));
        c.close().await;

        assert_eq!(2, recorder.built.load(Ordering::SeqCst));
        assert_eq!(paths(1..=1), recorder.paths());
    }

    #[tokio::test]
    async fn delivers_in_order_in_bounded_batches() {
        let recorder = Recorder::default();
        let config = LogCollectConfig {
            batch: BatchConfig {
                max_size: 2,
                interval_ms: 10,
            },
            ..Default::default()
        };
        let c = collector(config, &recorder);
        c.start().await;

        for i in 1..=5 {
            c.collect(record(i));
        }
        wait_for(|| recorder.paths().len() == 5).await;

        assert_eq!(paths(1..=5), recorder.paths());
        assert!(
            recorder
                .batches
                .lock()
                .unwrap()
                .iter()
                .all(|b| !b.is_empty() && b.len() <= 2)
        );
        c.close().await;
    }

    #[tokio::test]
    async fn failed_init_accepts_but_drops() {
        let recorder = Recorder {
            fail_init: true,
            ..Default::default()
        };
        let c = collector(idle_config(10), &recorder);
        c.start().await;
        assert!(c.is_started());

        c.collect(record(1));
        c.collect(record(2));
        c.close().await;

        assert!(recorder.paths().is_empty());
        let stats = c.stats();
        assert_eq!(2, stats.accepted);
        assert_eq!(2, stats.delivery_failed);
    }

    #[tokio::test]
    async fn final_flush_is_bounded() {
        let recorder = Recorder {
            consume_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let config = LogCollectConfig {
            flush_timeout_ms: 50,
            batch: BatchConfig {
                max_size: 2,
                interval_ms: 60_000,
            },
            ..idle_config(10)
        };
        let c = collector(config, &recorder);
        c.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 1..=5 {
            c.collect(record(i));
        }

        tokio::time::timeout(Duration::from_secs(5), c.close())
            .await
            .expect("close must not wait for the slow sink");

        // the first batch was cut off in the sink, the rest never left
        // the queue
        assert_eq!(5, c.stats().dropped_on_close);
        assert_eq!(1, recorder.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_bounds_batch_in_flight() {
        let recorder = Recorder {
            consume_delay: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        let config = LogCollectConfig {
            flush_timeout_ms: 50,
            batch: BatchConfig {
                max_size: 16,
                interval_ms: 10,
            },
            ..Default::default()
        };
        let c = collector(config, &recorder);
        c.start().await;

        c.collect(record(1));
        // a regular tick picks the record up and the sink is now busy
        tokio::time::sleep(Duration::from_millis(60)).await;

        let started = std::time::Instant::now();
        c.close().await;
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "close took {:?}",
            started.elapsed()
        );
        assert!(recorder.paths().is_empty());
        assert_eq!(1, c.stats().dropped_on_close);
        assert_eq!(1, recorder.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_batch_settings_still_deliver() {
        let recorder = Recorder::default();
        let config = LogCollectConfig {
            batch: BatchConfig {
                max_size: 0,
                interval_ms: 0,
            },
            ..Default::default()
        };
        let c = collector(config, &recorder);
        c.start().await;

        for i in 1..=3 {
            c.collect(record(i));
        }
        wait_for(|| recorder.paths().len() == 3).await;
        tokio::time::timeout(Duration::from_secs(5), c.close())
            .await
            .unwrap();

        assert_eq!(paths(1..=3), recorder.paths());
        assert!(recorder.batches.lock().unwrap().iter().all(|b| b.len() == 1));
    }

    #[tokio::test]
    async fn record_queued_after_close_is_counted() {
        let recorder = Recorder::default();
        let c = collector(idle_config(10), &recorder);
        c.start().await;

        // a collect call that loaded the intake just before close swapped it
        let stale = c.intake.load_full().unwrap();
        c.close().await;
        c.enqueue(&stale, record(1));

        let stats = c.stats();
        assert_eq!(1, stats.accepted);
        assert_eq!(1, stats.dropped_on_close);
        assert_eq!(0, stale.tx.len());
        assert!(recorder.paths().is_empty());
    }

    #[tokio::test]
    async fn global_collector_installs_once() {
        let recorder = Recorder::default();
        let first = Arc::new(collector(idle_config(10), &recorder));
        let second = Arc::new(collector(idle_config(10), &recorder));

        // other tests never install, so the first call here wins
        assert!(install_global(first.clone()).is_ok());
        assert!(install_global(second).is_err());
        assert!(Arc::ptr_eq(&first, global().unwrap()));
    }
}
