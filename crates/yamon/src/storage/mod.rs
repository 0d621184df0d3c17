// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server-side persistence of accumulated batches into a column store.
//!
//! `StoreFlusher` is the flush action behind the server's accumulator. Each
//! cycle inserts every non-empty kind into its own table independently, so a
//! failing table never blocks the others. The connection is opened lazily and
//! dropped after any failed insert so the next cycle reconnects.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::accumulator::{BatchAccumulator, FlushAction};
use crate::envelope::{Batch, Event, LogEntry, Metric, RecordKind};
use crate::errors::{FlushError, StoreError};

pub mod clickhouse;

/// An open session able to bulk insert each record kind.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn insert_metrics(&self, metrics: &[Metric]) -> Result<(), StoreError>;
    async fn insert_logs(&self, logs: &[LogEntry]) -> Result<(), StoreError>;
    async fn insert_events(&self, events: &[Event]) -> Result<(), StoreError>;
}

/// Factory for store connections.
#[async_trait]
pub trait ColumnStore: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError>;
}

#[async_trait]
impl<S: ColumnStore + ?Sized> ColumnStore for Arc<S> {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        (**self).connect().await
    }
}

/// Records written to and dropped by the store, per kind.
#[derive(Debug, Default)]
pub struct IngestCounters {
    written: [AtomicU64; 3],
    dropped: [AtomicU64; 3],
}

fn slot(kind: RecordKind) -> usize {
    match kind {
        RecordKind::Metrics => 0,
        RecordKind::Logs => 1,
        RecordKind::Events => 2,
    }
}

impl IngestCounters {
    pub fn record(&self, kind: RecordKind, written: bool, count: usize) {
        if count == 0 {
            return;
        }
        let (counters, result) = if written {
            (&self.written, "written")
        } else {
            (&self.dropped, "dropped")
        };
        counters[slot(kind)].fetch_add(count as u64, Ordering::Relaxed);

        let count = count as u64;
        match kind {
            RecordKind::Metrics => metrics::counter!("yamon_ingested_metrics", count, "result" => result),
            RecordKind::Logs => metrics::counter!("yamon_ingested_logs", count, "result" => result),
            RecordKind::Events => metrics::counter!("yamon_ingested_events", count, "result" => result),
        }
    }

    #[must_use]
    pub fn written(&self, kind: RecordKind) -> u64 {
        self.written[slot(kind)].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped(&self, kind: RecordKind) -> u64 {
        self.dropped[slot(kind)].load(Ordering::Relaxed)
    }
}

pub struct StoreFlusher<S> {
    store: S,
    connection: Mutex<Option<Box<dyn StoreConnection>>>,
    counters: Arc<IngestCounters>,
}

impl<S: ColumnStore> StoreFlusher<S> {
    pub fn new(store: S) -> Self {
        StoreFlusher {
            store,
            connection: Mutex::new(None),
            counters: Arc::new(IngestCounters::default()),
        }
    }

    #[must_use]
    pub fn counters(&self) -> Arc<IngestCounters> {
        Arc::clone(&self.counters)
    }

    fn drop_all(&self, batch: &Batch) {
        for kind in RecordKind::ALL {
            self.counters.record(kind, false, batch.len_of(kind));
        }
    }

    async fn insert(
        &self,
        connection: &dyn StoreConnection,
        kind: RecordKind,
        batch: &Batch,
    ) -> Option<StoreError> {
        let count = batch.len_of(kind);
        if count == 0 {
            return None;
        }
        let result = match kind {
            RecordKind::Metrics => connection.insert_metrics(&batch.metrics).await,
            RecordKind::Logs => connection.insert_logs(&batch.logs).await,
            RecordKind::Events => connection.insert_events(&batch.events).await,
        };
        self.counters.record(kind, result.is_ok(), count);
        match result {
            Ok(()) => {
                debug!("STORAGE | Inserted {count} {kind}");
                None
            }
            Err(e) => {
                error!("STORAGE | Dropped {count} {kind}: {e}");
                Some(e)
            }
        }
    }
}

#[async_trait]
impl<S: ColumnStore> FlushAction for StoreFlusher<S> {
    fn name(&self) -> &'static str {
        "STORAGE"
    }

    async fn flush(&self, batch: Batch) -> Result<(), FlushError> {
        let mut guard = self.connection.lock().await;
        let connection = match guard.take() {
            Some(connection) => connection,
            None => match self.store.connect().await {
                Ok(connection) => connection,
                Err(e) => {
                    self.drop_all(&batch);
                    return Err(e.into());
                }
            },
        };

        // Insertion order doubles as error priority: logs, metrics, events.
        let mut first_error = None;
        for kind in [RecordKind::Logs, RecordKind::Metrics, RecordKind::Events] {
            if let Some(e) = self.insert(connection.as_ref(), kind, &batch).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => {
                *guard = Some(connection);
                Ok(())
            }
            Some(e) => {
                warn!("STORAGE | Resetting connection after failed insert");
                Err(e.into())
            }
        }
    }
}

/// Accumulator persisting into a column store.
pub type StorageWriter<S> = BatchAccumulator<StoreFlusher<S>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_counters() {
        let counters = IngestCounters::default();
        counters.record(RecordKind::Logs, true, 3);
        counters.record(RecordKind::Logs, false, 2);
        counters.record(RecordKind::Events, false, 0);

        assert_eq!(counters.written(RecordKind::Logs), 3);
        assert_eq!(counters.dropped(RecordKind::Logs), 2);
        assert_eq!(counters.written(RecordKind::Metrics), 0);
        assert_eq!(counters.dropped(RecordKind::Events), 0);
    }
}
