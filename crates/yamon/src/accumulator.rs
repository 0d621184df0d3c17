// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic batch accumulator shared by the forward sink and the storage writer.
//!
//! Producers append records under a short-lived lock. A background loop flushes
//! whenever one kind crosses its threshold or the interval timer fires,
//! whichever comes first:
//!
//! ```text
//!   add() ──► Mutex<Batch> ──(threshold)──► flush signal ─┐
//!                                                         ├─► flush(): swap batch, unlock, FlushAction
//!   interval timer ───────────────────────────────────────┘
//! ```
//!
//! The flush signal is a `Notify` holding at most one permit: any number of
//! threshold crossings before the loop wakes collapse into a single flush, and
//! a crossing that happens while a flush is running is never lost.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::envelope::{Batch, Event, LogEntry, Metric};
use crate::errors::FlushError;
use crate::sink::{DataWriter, EventSink, LogSink, MetricSink};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// What happens to a batch once it has been swapped out.
#[async_trait]
pub trait FlushAction: Send + Sync + 'static {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Disposes of a non-empty batch. The batch is dropped regardless of the
    /// outcome; there is no local retry.
    async fn flush(&self, batch: Batch) -> Result<(), FlushError>;
}

/// Per-kind flush thresholds and the periodic flush interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorConfig {
    pub metric_threshold: usize,
    pub log_threshold: usize,
    pub event_threshold: usize,
    pub interval: Duration,
}

impl AccumulatorConfig {
    /// Thresholds used by the agent's forward sink.
    #[must_use]
    pub fn agent() -> Self {
        AccumulatorConfig {
            metric_threshold: 1000,
            log_threshold: 1000,
            event_threshold: 1000,
            interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    /// Thresholds used by the server's storage writer.
    #[must_use]
    pub fn server() -> Self {
        AccumulatorConfig {
            metric_threshold: 5000,
            log_threshold: 5000,
            event_threshold: 5000,
            interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self::agent()
    }
}

pub struct BatchAccumulator<F> {
    config: AccumulatorConfig,
    batch: Mutex<Batch>,
    flush_signal: Notify,
    flush_cycles: AtomicU64,
    action: F,
}

impl<F: FlushAction> BatchAccumulator<F> {
    pub fn new(config: AccumulatorConfig, action: F) -> Self {
        BatchAccumulator {
            config,
            batch: Mutex::new(Batch::new()),
            flush_signal: Notify::new(),
            flush_cycles: AtomicU64::new(0),
            action,
        }
    }

    pub fn action(&self) -> &F {
        &self.action
    }

    #[must_use]
    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    // A panic while holding the lock can only happen inside Vec::extend; the
    // batch is still structurally valid, so keep accumulating.
    fn lock_batch(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_metrics(&self, metrics: impl IntoIterator<Item = Metric>) {
        let mut batch = self.lock_batch();
        batch.metrics.extend(metrics);
        if batch.metrics.len() > self.config.metric_threshold {
            self.request_flush();
        }
    }

    pub fn add_logs(&self, logs: impl IntoIterator<Item = LogEntry>) {
        let mut batch = self.lock_batch();
        batch.logs.extend(logs);
        if batch.logs.len() > self.config.log_threshold {
            self.request_flush();
        }
    }

    pub fn add_events(&self, events: impl IntoIterator<Item = Event>) {
        let mut batch = self.lock_batch();
        batch.events.extend(events);
        if batch.events.len() > self.config.event_threshold {
            self.request_flush();
        }
    }

    /// Raises the flush signal. Never blocks; repeated calls before the flush
    /// loop wakes up coalesce into one flush.
    pub fn request_flush(&self) {
        self.flush_signal.notify_one();
    }

    /// In-memory (metrics, logs, events) counts of the batch being built.
    #[must_use]
    pub fn snapshot_len(&self) -> (usize, usize, usize) {
        let batch = self.lock_batch();
        (batch.metrics.len(), batch.logs.len(), batch.events.len())
    }

    /// Number of flush cycles run so far, including cycles that found an
    /// empty batch.
    #[must_use]
    pub fn flush_cycles(&self) -> u64 {
        self.flush_cycles.load(Ordering::Acquire)
    }

    /// Replaces the current batch with an empty one and returns the old one.
    fn swap(&self) -> Batch {
        std::mem::take(&mut *self.lock_batch())
    }

    /// Runs one flush cycle. The lock is released before the flush action
    /// runs, so producers are never blocked by network or storage I/O.
    pub async fn flush(&self) {
        let batch = self.swap();
        self.flush_cycles.fetch_add(1, Ordering::AcqRel);

        if batch.is_empty() {
            debug!("{} | Nothing to flush", self.action.name());
            return;
        }

        let (n_metrics, n_logs, n_events) =
            (batch.metrics.len(), batch.logs.len(), batch.events.len());
        let now = Instant::now();
        match self.action.flush(batch).await {
            Ok(()) => debug!(
                "{} | Flushed {n_metrics} metrics, {n_logs} logs and {n_events} events in {} ms",
                self.action.name(),
                now.elapsed().as_millis()
            ),
            Err(e) => error!(
                "{} | Dropped {n_metrics} metrics, {n_logs} logs and {n_events} events: {e}",
                self.action.name()
            ),
        }
    }

    /// Flush loop. Runs until `cancel` fires, then performs one last flush so
    /// an orderly shutdown does not lose the in-memory batch.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        debug!("{} | Flush loop started", self.action.name());
        loop {
            tokio::select! {
                () = self.flush_signal.notified() => {}
                _ = ticker.tick() => {}
                () = cancel.cancelled() => {
                    self.flush().await;
                    break;
                }
            }
            self.flush().await;
        }
        debug!("{} | Flush loop stopped", self.action.name());
    }
}

impl<F: FlushAction> MetricSink for BatchAccumulator<F> {
    fn write_metric(&self, metric: Metric) {
        self.add_metrics(std::iter::once(metric));
    }
}

impl<F: FlushAction> LogSink for BatchAccumulator<F> {
    fn write_log(&self, entry: LogEntry) {
        self.add_logs(std::iter::once(entry));
    }
}

impl<F: FlushAction> EventSink for BatchAccumulator<F> {
    fn write_event(&self, event: Event) {
        self.add_events(std::iter::once(event));
    }
}

impl<F: FlushAction> DataWriter for BatchAccumulator<F> {
    fn write_metrics(&self, metrics: Vec<Metric>) {
        self.add_metrics(metrics);
    }

    fn write_logs(&self, logs: Vec<LogEntry>) {
        self.add_logs(logs);
    }

    fn write_events(&self, events: Vec<Event>) {
        self.add_events(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    /// Flush action that records every batch it receives. When `gate` is set,
    /// each flush waits for a permit so tests can hold a flush "in flight".
    #[derive(Default)]
    struct RecordingAction {
        batches: Mutex<Vec<Batch>>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl FlushAction for RecordingAction {
        fn name(&self) -> &'static str {
            "TEST"
        }

        async fn flush(&self, batch: Batch) -> Result<(), FlushError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    impl RecordingAction {
        fn calls(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    fn config(threshold: usize) -> AccumulatorConfig {
        AccumulatorConfig {
            metric_threshold: threshold,
            log_threshold: threshold,
            event_threshold: threshold,
            interval: Duration::from_secs(5),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_crossing_triggers_flush() {
        let accumulator = Arc::new(BatchAccumulator::new(config(2), RecordingAction::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));
        settle().await;

        accumulator.add_logs((0..3).map(|i| LogEntry::new("svc", format!("line {i}"))));
        settle().await;

        assert_eq!(accumulator.action().calls(), 1);
        assert_eq!(accumulator.action().batches.lock().unwrap()[0].logs.len(), 3);
        assert_eq!(accumulator.snapshot_len(), (0, 0, 0));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_threshold_does_not_flush() {
        let accumulator = Arc::new(BatchAccumulator::new(config(2), RecordingAction::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));
        settle().await;

        accumulator.add_metrics(vec![Metric::gauge("a", 1.0), Metric::gauge("b", 2.0)]);
        settle().await;

        assert_eq!(accumulator.action().calls(), 0);
        assert_eq!(accumulator.snapshot_len(), (2, 0, 0));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_thresholds_are_independent_per_kind() {
        let cfg = AccumulatorConfig {
            metric_threshold: 100,
            log_threshold: 100,
            event_threshold: 1,
            interval: Duration::from_secs(5),
        };
        let accumulator = Arc::new(BatchAccumulator::new(cfg, RecordingAction::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));
        settle().await;

        accumulator.add_metrics((0..50).map(|i| Metric::counter("c", f64::from(i))));
        settle().await;
        assert_eq!(accumulator.action().calls(), 0);

        accumulator.add_events(vec![Event::new("a", ""), Event::new("b", "")]);
        settle().await;

        let batches = accumulator.action().batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].metrics.len(), 50);
        assert_eq!(batches[0].events.len(), 2);
        drop(batches);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_on_empty_batch_skips_action() {
        let accumulator = Arc::new(BatchAccumulator::new(config(10), RecordingAction::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));
        settle().await;
        assert_eq!(accumulator.flush_cycles(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(accumulator.flush_cycles(), 1);
        assert_eq!(accumulator.action().calls(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_sends_below_threshold_records() {
        let accumulator = Arc::new(BatchAccumulator::new(config(10), RecordingAction::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));
        settle().await;

        accumulator.write_metric(Metric::gauge("memory.free", 42.0));
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(accumulator.action().calls(), 1);
        assert_eq!(accumulator.snapshot_len(), (0, 0, 0));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_signals_produce_single_flush() {
        let accumulator = Arc::new(BatchAccumulator::new(config(1), RecordingAction::default()));

        // Raise the signal many times before the flush loop gets to run.
        for i in 0..20 {
            accumulator.add_metrics(vec![Metric::gauge("x", f64::from(i)), Metric::gauge("y", 0.0)]);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));
        settle().await;

        assert_eq!(accumulator.action().calls(), 1);
        assert_eq!(accumulator.action().batches.lock().unwrap()[0].metrics.len(), 40);
        assert_eq!(accumulator.flush_cycles(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_adds_during_flush_land_in_next_batch() {
        let gate = Arc::new(Semaphore::new(0));
        let action = RecordingAction {
            batches: Mutex::new(Vec::new()),
            gate: Some(Arc::clone(&gate)),
        };
        let accumulator = Arc::new(BatchAccumulator::new(config(1), action));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));
        settle().await;

        accumulator.add_logs(vec![LogEntry::new("a", "1"), LogEntry::new("a", "2")]);
        settle().await;

        // The first flush is now blocked inside the action; the producer is not.
        accumulator.add_logs(vec![LogEntry::new("b", "3"), LogEntry::new("b", "4")]);
        assert_eq!(accumulator.snapshot_len(), (0, 2, 0));

        gate.add_permits(2);
        settle().await;

        let batches = accumulator.action().batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        let first: Vec<_> = batches[0].logs.iter().map(|l| l.data.as_str()).collect();
        let second: Vec<_> = batches[1].logs.iter().map(|l| l.data.as_str()).collect();
        assert_eq!(first, vec!["1", "2"]);
        assert_eq!(second, vec!["3", "4"]);
        drop(batches);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_adds_are_never_lost() {
        let accumulator = Arc::new(BatchAccumulator::new(config(7), RecordingAction::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));

        let mut producers = Vec::new();
        for p in 0..4 {
            let accumulator = Arc::clone(&accumulator);
            producers.push(tokio::spawn(async move {
                for i in 0..250 {
                    accumulator.write_metric(Metric::counter(format!("p{p}"), f64::from(i)));
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        cancel.cancel();
        handle.await.unwrap();

        let flushed: usize = accumulator
            .action()
            .batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.metrics.len())
            .sum();
        assert_eq!(flushed, 1000);
        assert_eq!(accumulator.snapshot_len(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_cancel_drains_pending_batch() {
        let accumulator = Arc::new(BatchAccumulator::new(config(100), RecordingAction::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&accumulator).run(cancel.clone()));

        accumulator.write_event(Event::new("shutdown", ""));
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(accumulator.action().calls(), 1);
    }
}
