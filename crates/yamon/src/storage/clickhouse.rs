// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! ClickHouse backend using the HTTP interface.
//!
//! Each kind is sent as a single `INSERT ... FORMAT JSONEachRow` request with
//! asynchronous inserts enabled on the server side.

use async_trait::async_trait;
use core::time::Duration;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::envelope::{Event, LogEntry, Metric, Tags};
use crate::errors::StoreError;
use crate::http_utils::build_client;
use crate::storage::{ColumnStore, StoreConnection};

const METRICS_INSERT: &str = "INSERT INTO metrics (when, type, host, name, value, tags) FORMAT JSONEachRow";
const LOGS_INSERT: &str = "INSERT INTO logs (when, host, service, level, data, tags) FORMAT JSONEachRow";
const EVENTS_INSERT: &str = "INSERT INTO events (when, host, type, data, tags) FORMAT JSONEachRow";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn default_database() -> String {
    "default".to_string()
}

fn default_username() -> String {
    "default".to_string()
}

fn default_timeout() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClickHouseConfig {
    /// HTTP endpoints tried in order, e.g. `localhost:8123` or
    /// `https://ch.internal:8443`.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        ClickHouseConfig {
            targets: Vec::new(),
            database: default_database(),
            username: default_username(),
            password: String::new(),
            timeout: default_timeout(),
        }
    }
}

fn normalize_target(target: &str) -> String {
    let target = target.trim_end_matches('/');
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{target}")
    }
}

pub struct ClickHouseStore {
    targets: Vec<String>,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl ClickHouseStore {
    pub fn new(config: &ClickHouseConfig, timeout: Duration) -> Result<Self, StoreError> {
        if config.targets.is_empty() {
            return Err(StoreError::Connect("no clickhouse targets configured".to_string()));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("x-clickhouse-user", &config.username),
            ("x-clickhouse-key", &config.password),
            ("x-clickhouse-database", &config.database),
        ] {
            let value = value
                .parse()
                .map_err(|_| StoreError::Connect(format!("invalid value for {name}")))?;
            headers.insert(name, value);
        }

        Ok(ClickHouseStore {
            targets: config.targets.iter().map(|t| normalize_target(t)).collect(),
            headers,
            client: build_client(timeout)?,
        })
    }

    async fn probe(&self, base: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .get(format!("{base}/"))
            .headers(self.headers.clone())
            .query(&[("query", "SELECT 1")])
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Connect(format!("{base}: {status}: {}", body.trim())))
        }
    }
}

#[async_trait]
impl ColumnStore for ClickHouseStore {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let mut last_error = None;
        for base in &self.targets {
            match self.probe(base).await {
                Ok(()) => {
                    debug!("STORAGE | Connected to {base}");
                    return Ok(Box::new(ClickHouseConnection {
                        base: base.clone(),
                        headers: self.headers.clone(),
                        client: self.client.clone(),
                    }));
                }
                Err(e) => {
                    warn!("STORAGE | Failed to connect to {base}: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| StoreError::Connect("no clickhouse targets configured".to_string())))
    }
}

struct ClickHouseConnection {
    base: String,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl ClickHouseConnection {
    async fn insert<R: Serialize>(
        &self,
        table: &'static str,
        query: &str,
        rows: impl Iterator<Item = R>,
    ) -> Result<(), StoreError> {
        let mut body = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut body, &row)?;
            body.push(b'\n');
        }

        let response = self
            .client
            .post(format!("{}/", self.base))
            .headers(self.headers.clone())
            .query(&[("query", query), ("async_insert", "1")])
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Insert {
            table,
            reason: format!("{status}: {}", body.trim()),
        })
    }
}

#[derive(Serialize)]
struct MetricRow<'a> {
    when: String,
    #[serde(rename = "type")]
    kind: &'static str,
    host: &'a str,
    name: &'a str,
    value: f64,
    tags: &'a Tags,
}

#[derive(Serialize)]
struct LogRow<'a> {
    when: String,
    host: &'a str,
    service: &'a str,
    level: &'a str,
    data: &'a str,
    tags: &'a Tags,
}

#[derive(Serialize)]
struct EventRow<'a> {
    when: String,
    host: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a str,
    tags: &'a Tags,
}

#[async_trait]
impl StoreConnection for ClickHouseConnection {
    async fn insert_metrics(&self, metrics: &[Metric]) -> Result<(), StoreError> {
        let rows = metrics.iter().map(|m| MetricRow {
            when: m.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            kind: m.kind.as_str(),
            host: &m.host,
            name: &m.name,
            value: m.value,
            tags: &m.tags,
        });
        self.insert("metrics", METRICS_INSERT, rows).await
    }

    async fn insert_logs(&self, logs: &[LogEntry]) -> Result<(), StoreError> {
        let rows = logs.iter().map(|l| LogRow {
            when: l.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            host: &l.host,
            service: &l.service,
            level: &l.level,
            data: &l.data,
            tags: &l.tags,
        });
        self.insert("logs", LOGS_INSERT, rows).await
    }

    async fn insert_events(&self, events: &[Event]) -> Result<(), StoreError> {
        let rows = events.iter().map(|e| EventRow {
            when: e.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            host: &e.host,
            event_type: &e.event_type,
            data: &e.data,
            tags: &e.tags,
        });
        self.insert("events", EVENTS_INSERT, rows).await
    }
}
