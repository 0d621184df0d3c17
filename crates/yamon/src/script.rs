// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User-provided scripts that report metrics as JSON on stdout.
//!
//! A result object carries either a single `metric` or a list of `metrics`:
//!
//! ```text
//! {"metric": {"type": "gauge", "name": "queue.depth", "value": 12}}
//! {"metrics": [{"type": "counter", "name": "jobs.done", "value": 4, "time": 1709294400, "tags": {"queue": "mail"}}]}
//! ```
//!
//! One-shot scripts print one result and exit; streaming scripts stay alive
//! and print one result per line.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::time::Duration;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::{Metric, MetricKind, Tags};
use crate::errors::CollectError;
use crate::scheduler::{Collector, TaskConfig};
use crate::sink::{MetricSink, Sink};

pub const DEFAULT_SCRIPT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptMetric {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub value: f64,
    /// Unix seconds; zero or absent means "now".
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub tags: Option<Tags>,
}

impl ScriptMetric {
    fn into_metric(self) -> Option<Metric> {
        let kind = match self.kind.parse::<MetricKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("SCRIPT | Skipping metric {}: {e}", self.name);
                return None;
            }
        };
        let mut metric = Metric::new(self.name, kind, self.value).with_tags(self.tags.unwrap_or_default());
        if self.time > 0 {
            if let Some(timestamp) = DateTime::<Utc>::from_timestamp(self.time, 0) {
                metric = metric.at(timestamp);
            }
        }
        Some(metric)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScriptResult {
    #[serde(default)]
    pub metric: Option<ScriptMetric>,
    #[serde(default)]
    pub metrics: Vec<ScriptMetric>,
}

impl ScriptResult {
    /// Writes every valid metric to `sink`, returning how many were written.
    pub fn write<S: MetricSink + ?Sized>(self, sink: &S) -> usize {
        let mut written = 0;
        for metric in self.metric.into_iter().chain(self.metrics) {
            if let Some(metric) = metric.into_metric() {
                sink.write_metric(metric);
                written += 1;
            }
        }
        written
    }
}

/// Decodes the first JSON value of a one-shot script's stdout.
pub fn decode_output(name: &str, stdout: &[u8]) -> Result<ScriptResult, CollectError> {
    serde_json::Deserializer::from_slice(stdout)
        .into_iter::<ScriptResult>()
        .next()
        .ok_or_else(|| CollectError::parse(name, "script produced no output"))?
        .map_err(CollectError::from)
}

#[derive(Debug, Clone)]
pub struct Script {
    name: String,
    path: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    interval: Duration,
    timeout: Duration,
    streaming: bool,
}

impl Script {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Script {
            name: format!("script:{path}"),
            path,
            args: Vec::new(),
            env: BTreeMap::new(),
            interval: DEFAULT_SCRIPT_INTERVAL,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
            streaming: false,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Scheduler entry for a one-shot script.
    #[must_use]
    pub fn task_config(&self) -> TaskConfig {
        TaskConfig::new(self.name.clone())
            .with_interval(self.interval)
            .with_timeout(self.timeout)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.path);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }

    /// Keeps a streaming script running, writing one result per stdout line.
    /// Returns when `cancel` fires; the script exiting is always an error.
    pub async fn run_streaming(
        &self,
        sink: Arc<dyn Sink>,
        cancel: CancellationToken,
    ) -> Result<(), CollectError> {
        let mut child = self.command().spawn()?;
        let stdout = child.stdout.take().ok_or(CollectError::ProcessExited)?;
        let mut lines = BufReader::new(stdout).lines();
        debug!("SCRIPT | Streaming {}", self.path);

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match serde_json::from_str::<ScriptResult>(&line) {
                        Ok(result) => {
                            result.write(sink.as_ref());
                        }
                        Err(e) => warn!("SCRIPT | {}: failed to parse streaming result: {e}", self.path),
                    },
                    None => break,
                },
                () = cancel.cancelled() => return Ok(()),
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Err(CollectError::ProcessExited)
        } else {
            Err(CollectError::ProcessFailed(status))
        }
    }
}

#[async_trait]
impl Collector for Script {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, sink: &dyn Sink) -> Result<(), CollectError> {
        // The child is killed if the scheduler's timeout drops this future.
        let output = self.command().output().await?;
        if !output.status.success() {
            return Err(CollectError::ProcessFailed(output.status));
        }
        let written = decode_output(&self.name, &output.stdout)?.write(sink);
        debug!("SCRIPT | {} reported {written} metrics", self.path);
        Ok(())
    }
}
