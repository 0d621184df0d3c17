// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capability traits through which every producer emits telemetry.
//!
//! Producers only see a `Sink`; whether records end up in a forward batch, a
//! storage batch or a test recorder is decided at wiring time.

use crate::envelope::{Event, LogEntry, Metric, Tags};
use std::sync::Arc;

pub trait MetricSink: Send + Sync {
    fn write_metric(&self, metric: Metric);
}

pub trait LogSink: Send + Sync {
    fn write_log(&self, entry: LogEntry);
}

pub trait EventSink: Send + Sync {
    fn write_event(&self, event: Event);
}

/// Composite of the three narrow capabilities.
pub trait Sink: MetricSink + LogSink + EventSink {}

impl<T: MetricSink + LogSink + EventSink + ?Sized> Sink for T {}

impl<S: MetricSink + ?Sized> MetricSink for Arc<S> {
    fn write_metric(&self, metric: Metric) {
        (**self).write_metric(metric);
    }
}

impl<S: LogSink + ?Sized> LogSink for Arc<S> {
    fn write_log(&self, entry: LogEntry) {
        (**self).write_log(entry);
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn write_event(&self, event: Event) {
        (**self).write_event(event);
    }
}

/// Bulk ingestion interface used by the receiving side of the forward
/// protocol. Records arrive already stamped with their origin host.
pub trait DataWriter: Send + Sync {
    fn write_metrics(&self, metrics: Vec<Metric>);
    fn write_logs(&self, logs: Vec<LogEntry>);
    fn write_events(&self, events: Vec<Event>);
}

impl<W: DataWriter + ?Sized> DataWriter for Arc<W> {
    fn write_metrics(&self, metrics: Vec<Metric>) {
        (**self).write_metrics(metrics);
    }

    fn write_logs(&self, logs: Vec<LogEntry>) {
        (**self).write_logs(logs);
    }

    fn write_events(&self, events: Vec<Event>) {
        (**self).write_events(events);
    }
}

/// Decorator that stamps the local hostname and static tags onto every record
/// before handing it to the inner sink.
///
/// This is the only place `host` is populated. Static tags overwrite tags of
/// the same name set by the producer.
#[derive(Debug, Clone)]
pub struct MetadataFilter<S> {
    hostname: String,
    tags: Tags,
    inner: S,
}

impl<S> MetadataFilter<S> {
    pub fn new(hostname: impl Into<String>, tags: Tags, inner: S) -> Self {
        MetadataFilter {
            hostname: hostname.into(),
            tags,
            inner,
        }
    }

    fn apply(&self, host: &mut String, tags: &mut Tags) {
        for (key, value) in &self.tags {
            tags.insert(key.clone(), value.clone());
        }
        host.clone_from(&self.hostname);
    }
}

impl<S: MetricSink> MetricSink for MetadataFilter<S> {
    fn write_metric(&self, mut metric: Metric) {
        self.apply(&mut metric.host, &mut metric.tags);
        self.inner.write_metric(metric);
    }
}

impl<S: LogSink> LogSink for MetadataFilter<S> {
    fn write_log(&self, mut entry: LogEntry) {
        self.apply(&mut entry.host, &mut entry.tags);
        self.inner.write_log(entry);
    }
}

impl<S: EventSink> EventSink for MetadataFilter<S> {
    fn write_event(&self, mut event: Event) {
        self.apply(&mut event.host, &mut event.tags);
        self.inner.write_event(event);
    }
}
