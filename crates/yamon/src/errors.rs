// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the ingestion pipeline.
//!
//! Errors are split by concern. Setup errors abort process startup; everything
//! raised inside a flush cycle, a collector run or an HTTP request is handled
//! locally and never escapes the owning loop.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid duration for {field}: '{value}'")]
    Duration { field: String, value: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Fatal failure while wiring up the process. Always aborts startup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no such collector '{0}'")]
    UnknownCollector(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cursor tracker: {0}")]
    Cursor(#[from] CursorError),

    #[error("collector setup: {0}")]
    Collect(#[from] CollectError),

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a single collector/reader invocation.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse {source_name}: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("failed to decode output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("process exited with {0}")]
    ProcessFailed(std::process::ExitStatus),

    #[error("process exited unexpectedly")]
    ProcessExited,

    #[error("cursor tracker: {0}")]
    Cursor(#[from] CursorError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{status}: unexpected response status from {url}")]
    Status { status: u16, url: String },
}

impl CollectError {
    pub fn parse(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// Failure delivering a batch from agent to server.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid forward target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{status}: unexpected response status: {body}")]
    Status { status: u16, body: String },
}

/// Failure talking to the column store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to column store: {0}")]
    Connect(String),

    #[error("insert into {table} failed: {reason}")]
    Insert { table: &'static str, reason: String },

    #[error("column store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to encode rows: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure reading or persisting a cursor.
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("stored cursor is not valid UTF-8")]
    InvalidUtf8,
}

/// Failure of one flush cycle. Logged by the accumulator, never propagated.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("forward: {0}")]
    Forward(#[from] ForwardError),

    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SetupError::UnknownCollector("gpu".to_string());
        assert_eq!(error.to_string(), "no such collector 'gpu'");

        let error = ForwardError::Status {
            status: 401,
            body: "unauthorized".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "401: unexpected response status: unauthorized"
        );
    }

    #[test]
    fn test_flush_error_wraps_store_error() {
        let error: FlushError = StoreError::Insert {
            table: "logs",
            reason: "timeout".to_string(),
        }
        .into();
        assert_eq!(error.to_string(), "storage: insert into logs failed: timeout");
    }
}
