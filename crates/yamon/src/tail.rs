// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Follows a log file, emitting each appended line as a log entry or, for
//! auditd logs, reassembling lines into audit events.

use core::time::Duration;
use std::fmt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{parse_audit_line, AuditReassembler};
use crate::envelope::{Event, LogEntry};
use crate::errors::CollectError;
use crate::sink::Sink;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One log entry per line.
    #[default]
    Plain,
    /// auditd records, grouped into `audit.<TYPE>` events.
    Audit,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "plain" => Ok(LogFormat::Plain),
            "audit" => Ok(LogFormat::Audit),
            other => Err(format!("unknown log format '{other}', expected 'plain' or 'audit'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plain => f.write_str("plain"),
            LogFormat::Audit => f.write_str("audit"),
        }
    }
}

// Device and inode on unix. Elsewhere rotation is only detected by size.
#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

pub struct LogFileTailer {
    path: PathBuf,
    service: String,
    level: String,
    sink: Arc<dyn Sink>,
    poll_interval: Duration,
    offset: u64,
    identity: Option<(u64, u64)>,
    partial: Vec<u8>,
    audit: Option<AuditReassembler>,
}

impl LogFileTailer {
    /// Starts following `path` from its current end. A file that does not
    /// exist yet is followed from its start once it appears.
    pub async fn open(
        path: impl AsRef<Path>,
        service: Option<String>,
        level: impl Into<String>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, CollectError> {
        let path = path.as_ref().to_path_buf();
        let (offset, identity) = match tokio::fs::metadata(&path).await {
            Ok(metadata) => (metadata.len(), file_identity(&metadata)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("TAIL | {} does not exist yet", path.display());
                (0, None)
            }
            Err(e) => return Err(e.into()),
        };

        Ok(LogFileTailer {
            service: service.unwrap_or_else(|| path.display().to_string()),
            path,
            level: level.into(),
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
            offset,
            identity,
            partial: Vec::new(),
            audit: None,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.audit = match format {
            LogFormat::Plain => None,
            LogFormat::Audit => Some(AuditReassembler::default()),
        };
        self
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn format(&self) -> LogFormat {
        if self.audit.is_some() {
            LogFormat::Audit
        } else {
            LogFormat::Plain
        }
    }

    fn restart(&mut self, reason: &str) {
        info!("TAIL | {} was {reason}, reading from start", self.path.display());
        self.offset = 0;
        self.partial.clear();
    }

    /// Reads whatever was appended since the last poll and handles every
    /// complete line. Returns the number of lines read.
    pub async fn poll(&mut self) -> Result<usize, CollectError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let identity = file_identity(&metadata);
        if identity != self.identity {
            if self.identity.is_some() {
                self.restart("replaced");
            }
            self.identity = identity;
        }
        let len = metadata.len();
        if len < self.offset {
            self.restart("truncated");
        }
        if len == self.offset {
            return Ok(0);
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let read = file.read_to_end(&mut self.partial).await?;
        self.offset += read as u64;

        let mut handled = 0;
        let mut start = 0;
        loop {
            let Some(newline) = self.partial[start..].iter().position(|b| *b == b'\n') else {
                break;
            };
            let end = start + newline;
            let line = String::from_utf8_lossy(&self.partial[start..end]).into_owned();
            start = end + 1;
            self.handle_line(line.trim_end_matches('\r'));
            handled += 1;
        }
        self.partial.drain(..start);
        Ok(handled)
    }

    fn handle_line(&mut self, line: &str) {
        match self.audit.as_mut() {
            None => self
                .sink
                .write_log(LogEntry::new(self.service.clone(), line).with_level(self.level.clone())),
            Some(reassembler) => match parse_audit_line(line) {
                Ok(record) => {
                    let events = reassembler.push(record);
                    self.emit(events);
                }
                Err(e) => warn!("TAIL | Skipping line in {}: {e}", self.path.display()),
            },
        }
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            self.sink.write_event(event);
        }
    }

    /// Emits audit groups that timed out waiting for their end marker.
    pub fn flush_stale(&mut self) {
        if let Some(events) = self.audit.as_mut().map(AuditReassembler::flush_stale) {
            self.emit(events);
        }
    }

    /// Polls until `cancel` fires. Read errors are logged and retried on the
    /// next tick. Open audit groups are emitted on shutdown.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("TAIL | Following {} as {}", self.path.display(), self.format());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => break,
            }
            if let Err(e) = self.poll().await {
                warn!("TAIL | Failed to read {}: {e}", self.path.display());
            }
            self.flush_stale();
        }

        if let Some(events) = self.audit.as_mut().map(AuditReassembler::finish) {
            self.emit(events);
        }
    }
}
