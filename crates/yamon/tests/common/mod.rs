// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared mocks for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use yamon::envelope::{Event, LogEntry, Metric, RecordKind};
use yamon::errors::StoreError;
use yamon::storage::{ColumnStore, StoreConnection};

/// One `insert_*` call as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertCall {
    pub kind: RecordKind,
    pub rows: usize,
    pub connection: usize,
}

#[derive(Default)]
struct State {
    inserts: Mutex<Vec<InsertCall>>,
    metrics: Mutex<Vec<Metric>>,
    logs: Mutex<Vec<LogEntry>>,
    events: Mutex<Vec<Event>>,
    failing: Mutex<Vec<RecordKind>>,
    refuse_connect: AtomicBool,
    connects: AtomicUsize,
}

/// In-memory column store that records every insert and can be told to fail
/// connecting or inserting a given kind.
#[derive(Clone, Default)]
pub struct RecordingStore {
    state: Arc<State>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, kind: RecordKind) {
        self.state.failing.lock().unwrap().push(kind);
    }

    pub fn heal(&self) {
        self.state.failing.lock().unwrap().clear();
        self.state.refuse_connect.store(false, Ordering::SeqCst);
    }

    pub fn refuse_connect(&self) {
        self.state.refuse_connect.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn inserts(&self) -> Vec<InsertCall> {
        self.state.inserts.lock().unwrap().clone()
    }

    pub fn inserts_of(&self, kind: RecordKind) -> Vec<InsertCall> {
        self.inserts().into_iter().filter(|c| c.kind == kind).collect()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.state.metrics.lock().unwrap().clone()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.state.logs.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().unwrap().clone()
    }
}

struct RecordingConnection {
    id: usize,
    state: Arc<State>,
}

impl RecordingConnection {
    fn record(&self, kind: RecordKind, rows: usize) -> Result<(), StoreError> {
        self.state.inserts.lock().unwrap().push(InsertCall {
            kind,
            rows,
            connection: self.id,
        });
        if self.state.failing.lock().unwrap().contains(&kind) {
            return Err(StoreError::Insert {
                table: kind.as_str(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConnection for RecordingConnection {
    async fn insert_metrics(&self, metrics: &[Metric]) -> Result<(), StoreError> {
        self.record(RecordKind::Metrics, metrics.len())?;
        self.state.metrics.lock().unwrap().extend_from_slice(metrics);
        Ok(())
    }

    async fn insert_logs(&self, logs: &[LogEntry]) -> Result<(), StoreError> {
        self.record(RecordKind::Logs, logs.len())?;
        self.state.logs.lock().unwrap().extend_from_slice(logs);
        Ok(())
    }

    async fn insert_events(&self, events: &[Event]) -> Result<(), StoreError> {
        self.record(RecordKind::Events, events.len())?;
        self.state.events.lock().unwrap().extend_from_slice(events);
        Ok(())
    }
}

#[async_trait]
impl ColumnStore for RecordingStore {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        if self.state.refuse_connect.load(Ordering::SeqCst) {
            return Err(StoreError::Connect("connection refused".to_string()));
        }
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(RecordingConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}
