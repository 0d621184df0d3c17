// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Linux audit log support for the file tailer.
//!
//! auditd writes one line per record, for example:
//!
//! ```text
//! type=SYSCALL msg=audit(1364481363.243:24287): arch=c000003e syscall=2 exe="/bin/cat"
//! ```
//!
//! Records sharing the serial after the colon belong to the same event. The
//! [`AuditReassembler`] groups them and turns each completed group into one
//! `audit.<TYPE>` event.

use chrono::{DateTime, Utc};
use core::time::Duration;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::Instant;

use crate::envelope::Event;
use crate::errors::CollectError;

pub const AUDIT_EVENT_PREFIX: &str = "audit.";
/// Groups older than this are emitted even without an `EOE` record.
pub const DEFAULT_GROUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;

const END_OF_EVENT: &str = "EOE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(skip)]
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub serial: u64,
    pub fields: BTreeMap<String, String>,
}

fn parse_error(reason: impl Into<String>) -> CollectError {
    CollectError::parse("audit record", reason)
}

// `1364481363.243` -> seconds and fractional part.
fn parse_audit_time(value: &str) -> Result<DateTime<Utc>, CollectError> {
    let (secs, frac) = value.split_once('.').unwrap_or((value, "0"));
    let secs: i64 = secs.parse().map_err(|_| parse_error(format!("bad timestamp '{value}'")))?;
    let digits = frac.len().min(9);
    let frac: u32 = frac
        .get(..digits)
        .and_then(|frac| frac.parse().ok())
        .ok_or_else(|| parse_error(format!("bad timestamp '{value}'")))?;
    let nanos = frac * 10u32.pow(9 - digits as u32);
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| parse_error(format!("timestamp out of range '{value}'")))
}

/// Splits `k=v k="quoted value" k='single quoted'` into pairs. Quotes are
/// stripped; unquoted values end at the next space.
fn split_fields(mut rest: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    loop {
        rest = rest.trim_start();
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let value = match rest.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let body = &rest[1..];
                let end = body.find(quote).unwrap_or(body.len());
                let value = &body[..end];
                rest = body.get(end + 1..).unwrap_or("");
                value
            }
            _ => {
                let end = rest.find(' ').unwrap_or(rest.len());
                let value = &rest[..end];
                rest = &rest[end..];
                value
            }
        };
        if !key.is_empty() {
            fields.push((key, value.to_string()));
        }
    }
    fields
}

/// Parses one auditd log line.
pub fn parse_audit_line(line: &str) -> Result<AuditRecord, CollectError> {
    let line = line.trim();
    let type_start = line
        .find("type=")
        .ok_or_else(|| parse_error("missing type"))?;
    let line = &line[type_start + "type=".len()..];
    let (record_type, rest) = line
        .split_once(' ')
        .ok_or_else(|| parse_error("missing msg"))?;

    let rest = rest
        .trim_start()
        .strip_prefix("msg=audit(")
        .ok_or_else(|| parse_error("missing msg=audit("))?;
    let (header, body) = rest
        .split_once("):")
        .ok_or_else(|| parse_error("unterminated audit header"))?;
    let (time, serial) = header
        .split_once(':')
        .ok_or_else(|| parse_error(format!("bad audit header '{header}'")))?;
    let serial: u64 = serial
        .parse()
        .map_err(|_| parse_error(format!("bad serial '{serial}'")))?;

    Ok(AuditRecord {
        record_type: record_type.to_string(),
        timestamp: parse_audit_time(time)?,
        serial,
        fields: split_fields(body).into_iter().collect(),
    })
}

#[derive(Debug, Serialize)]
struct AuditEventData<'a> {
    sequence: u64,
    records: &'a [AuditRecord],
}

#[derive(Debug)]
struct AuditGroup {
    records: Vec<AuditRecord>,
    started: Instant,
}

impl AuditGroup {
    fn into_event(self, serial: u64) -> Option<Event> {
        let first = self.records.first()?;
        let event = Event::from_json(
            format!("{AUDIT_EVENT_PREFIX}{}", first.record_type),
            &AuditEventData {
                sequence: serial,
                records: &self.records,
            },
        );
        Some(event.at(first.timestamp))
    }
}

/// Collects audit records into events keyed by serial.
///
/// A group completes when its `EOE` record arrives, when it is older than
/// the group timeout, or when more than `max_in_flight` groups are open, in
/// which case the lowest serial is emitted first.
#[derive(Debug)]
pub struct AuditReassembler {
    groups: BTreeMap<u64, AuditGroup>,
    timeout: Duration,
    max_in_flight: usize,
}

impl Default for AuditReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT, DEFAULT_GROUP_TIMEOUT)
    }
}

impl AuditReassembler {
    #[must_use]
    pub fn new(max_in_flight: usize, timeout: Duration) -> Self {
        AuditReassembler {
            groups: BTreeMap::new(),
            timeout,
            max_in_flight: max_in_flight.max(1),
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.groups.len()
    }

    /// Adds a record and returns every event it completed.
    pub fn push(&mut self, record: AuditRecord) -> Vec<Event> {
        let serial = record.serial;
        if record.record_type == END_OF_EVENT {
            return self
                .groups
                .remove(&serial)
                .and_then(|group| group.into_event(serial))
                .into_iter()
                .collect();
        }

        self.groups
            .entry(serial)
            .or_insert_with(|| AuditGroup {
                records: Vec::new(),
                started: Instant::now(),
            })
            .records
            .push(record);

        let mut completed = Vec::new();
        while self.groups.len() > self.max_in_flight {
            if let Some((serial, group)) = self.groups.pop_first() {
                completed.extend(group.into_event(serial));
            }
        }
        completed
    }

    /// Emits groups that have waited longer than the timeout.
    pub fn flush_stale(&mut self) -> Vec<Event> {
        let timeout = self.timeout;
        let stale: Vec<u64> = self
            .groups
            .iter()
            .filter(|(_, group)| group.started.elapsed() >= timeout)
            .map(|(serial, _)| *serial)
            .collect();
        stale
            .into_iter()
            .filter_map(|serial| {
                self.groups
                    .remove(&serial)
                    .and_then(|group| group.into_event(serial))
            })
            .collect()
    }

    /// Emits every open group, lowest serial first.
    pub fn finish(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.groups)
            .into_iter()
            .filter_map(|(serial, group)| group.into_event(serial))
            .collect()
    }
}
