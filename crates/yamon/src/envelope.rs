// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry record shapes and the `Batch` that groups them.
//!
//! The serialized form uses compact single-letter keys and is shared by the
//! forward protocol and the agent's direct ingestion endpoint:
//!
//! ```text
//! {"m": [{"t", "m", "h", "n", "v", "g"}], "l": [{"t", "h", "s", "l", "d", "g"}], "e": [{"t", "h", "e", "d", "g"}]}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Tag mapping attached to every record. Keys are unique.
pub type Tags = BTreeMap<String, String>;

/// Deserializes `null` the same way as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(format!("unsupported metric type '{other}'")),
        }
    }
}

/// The three record kinds a `Batch` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Metrics,
    Logs,
    Events,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Metrics, RecordKind::Logs, RecordKind::Events];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Metrics => "metrics",
            RecordKind::Logs => "logs",
            RecordKind::Events => "events",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "t", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "m")]
    pub kind: MetricKind,
    #[serde(rename = "h", default, deserialize_with = "null_as_default")]
    pub host: String,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "v")]
    pub value: f64,
    #[serde(rename = "g", default, deserialize_with = "null_as_default")]
    pub tags: Tags,
}

impl Metric {
    pub fn new(name: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Metric {
            timestamp: Utc::now(),
            kind,
            host: String::new(),
            name: name.into(),
            value,
            tags: Tags::new(),
        }
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Gauge, value)
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Counter, value)
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "t", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "h", default, deserialize_with = "null_as_default")]
    pub host: String,
    #[serde(rename = "s", default, deserialize_with = "null_as_default")]
    pub service: String,
    #[serde(rename = "l", default, deserialize_with = "null_as_default")]
    pub level: String,
    #[serde(rename = "d", default, deserialize_with = "null_as_default")]
    pub data: String,
    #[serde(rename = "g", default, deserialize_with = "null_as_default")]
    pub tags: Tags,
}

impl LogEntry {
    pub fn new(service: impl Into<String>, data: impl Into<String>) -> Self {
        LogEntry {
            timestamp: Utc::now(),
            host: String::new(),
            service: service.into(),
            level: String::new(),
            data: data.into(),
            tags: Tags::new(),
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "t", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "h", default, deserialize_with = "null_as_default")]
    pub host: String,
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "d", default, deserialize_with = "null_as_default")]
    pub data: String,
    #[serde(rename = "g", default, deserialize_with = "null_as_default")]
    pub tags: Tags,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Event {
            timestamp: Utc::now(),
            host: String::new(),
            event_type: event_type.into(),
            data: data.into(),
            tags: Tags::new(),
        }
    }

    /// Builds an event whose payload is `data` encoded as JSON.
    pub fn from_json<T: Serialize + ?Sized>(event_type: impl Into<String>, data: &T) -> Self {
        let data = serde_json::to_string(data).unwrap_or_else(|_| "<invalid json>".to_string());
        Self::new(event_type, data)
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Pending metrics, logs and events awaiting transmission or persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(rename = "m", default, deserialize_with = "null_as_default")]
    pub metrics: Vec<Metric>,
    #[serde(rename = "l", default, deserialize_with = "null_as_default")]
    pub logs: Vec<LogEntry>,
    #[serde(rename = "e", default, deserialize_with = "null_as_default")]
    pub events: Vec<Event>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len() + self.logs.len() + self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn len_of(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::Metrics => self.metrics.len(),
            RecordKind::Logs => self.logs.len(),
            RecordKind::Events => self.events.len(),
        }
    }
}
