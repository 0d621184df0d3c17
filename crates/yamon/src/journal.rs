// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resumable systemd journal reader.
//!
//! Entries are read from `journalctl --output json --follow`, one JSON object
//! per line. Every entry is handed to the sink before its cursor is committed,
//! so a restart may replay the last entry but never skips one.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::CursorTracker;
use crate::envelope::{LogEntry, Tags};
use crate::errors::CollectError;
use crate::sink::LogSink;

pub const JOURNALCTL: &str = "journalctl";

const FIELD_MESSAGE: &str = "MESSAGE";
const FIELD_CURSOR: &str = "__CURSOR";
const FIELD_REALTIME: &str = "__REALTIME_TIMESTAMP";
const FIELD_PRIORITY: &str = "PRIORITY";
const FIELD_IDENTIFIER: &str = "SYSLOG_IDENTIFIER";

/// Journal fields that are never copied into tags.
const STRIPPED_FIELDS: [&str; 8] = [
    FIELD_MESSAGE,
    "_HOSTNAME",
    "_SYSTEMD_INVOCATION_ID",
    "_STREAM_ID",
    "__MONOTONIC_TIMESTAMP",
    FIELD_REALTIME,
    FIELD_CURSOR,
    FIELD_IDENTIFIER,
];

/// Maps a syslog priority (0-7) to a level name.
#[must_use]
pub fn level_name(priority: &str) -> &'static str {
    match priority {
        "0" | "1" | "2" => "critical",
        "3" => "error",
        "4" => "warning",
        "5" | "6" => "info",
        "7" => "debug",
        _ => "",
    }
}

/// One decoded journal record and the cursor that points at it.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub cursor: Option<String>,
    pub log: LogEntry,
}

fn field_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Decodes one line of `journalctl --output json`.
pub fn decode_entry(line: &str) -> Result<JournalEntry, CollectError> {
    let fields: Map<String, Value> = serde_json::from_str(line)?;
    let mut fields: Tags = fields
        .into_iter()
        .map(|(key, value)| (key, field_to_string(value)))
        .collect();

    let cursor = fields.get(FIELD_CURSOR).cloned();
    let message = fields.get(FIELD_MESSAGE).cloned().unwrap_or_default();
    let service = fields.get(FIELD_IDENTIFIER).cloned().unwrap_or_default();
    let level = fields
        .get(FIELD_PRIORITY)
        .map(|p| level_name(p))
        .unwrap_or_default();
    let timestamp = fields
        .get(FIELD_REALTIME)
        .and_then(|micros| micros.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .unwrap_or_else(Utc::now);

    for field in STRIPPED_FIELDS {
        fields.remove(field);
    }

    let log = LogEntry::new(service, message)
        .with_level(level)
        .with_tags(fields)
        .at(timestamp);
    Ok(JournalEntry { cursor, log })
}

pub struct JournalReader {
    sink: Arc<dyn LogSink>,
    tracker: Box<dyn CursorTracker>,
    ignored_services: HashSet<String>,
    command: String,
}

impl JournalReader {
    pub fn new(
        sink: Arc<dyn LogSink>,
        tracker: Box<dyn CursorTracker>,
        ignored_services: impl IntoIterator<Item = String>,
    ) -> Self {
        JournalReader {
            sink,
            tracker,
            ignored_services: ignored_services.into_iter().collect(),
            command: JOURNALCTL.to_string(),
        }
    }

    /// Overrides the `journalctl` executable.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Arguments for `journalctl`, resuming after `cursor` when there is one.
    #[must_use]
    pub fn journalctl_args(cursor: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--output".to_string(),
            "json".to_string(),
            "--follow".to_string(),
        ];
        match cursor {
            Some(cursor) => {
                args.push("--after-cursor".to_string());
                args.push(cursor.to_string());
            }
            None => args.push("-n0".to_string()),
        }
        args
    }

    /// Sinks one line of output, then commits its cursor. Entries from
    /// ignored services are not sunk, but their cursor still advances.
    pub fn handle_line(&mut self, line: &str) -> Result<(), CollectError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let entry = match decode_entry(line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("JOURNAL | Skipping undecodable entry: {e}");
                return Ok(());
            }
        };

        if !self.ignored_services.contains(&entry.log.service) {
            self.sink.write_log(entry.log);
        }
        if let Some(cursor) = entry.cursor {
            self.tracker.commit_cursor(&cursor)?;
        }
        Ok(())
    }

    /// Follows the journal until `cancel` fires or the child exits. Exit of
    /// the child is always reported as a failure.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), CollectError> {
        let cursor = self.tracker.last_cursor()?;
        match &cursor {
            Some(cursor) => info!("JOURNAL | Resuming after cursor {cursor}"),
            None => info!("JOURNAL | No stored cursor, starting at the tail"),
        }

        let mut child = Command::new(&self.command)
            .args(Self::journalctl_args(cursor.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take().ok_or(CollectError::ProcessExited)?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => self.handle_line(&line)?,
                    None => break,
                },
                () = cancel.cancelled() => {
                    debug!("JOURNAL | Shutdown signal received, stopping");
                    return Ok(());
                }
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
