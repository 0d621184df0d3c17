// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::envelope::Batch;
use crate::forward::SUBMIT_BATCH_PATH;
use crate::http_utils::{handler_metrics, handler_not_found, log_and_create_http_response};
use crate::sink::DataWriter;

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Static key-id to secret map. An empty ring disables authentication.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, String>,
}

impl KeyRing {
    pub fn new(keys: HashMap<String, String>) -> Self {
        KeyRing { keys }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Checks an `Authorization` header of the form `<key-id>:<secret>`.
    #[must_use]
    pub fn authorize(&self, header: Option<&str>) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let Some(header) = header else {
            return false;
        };
        let parts: Vec<&str> = header.split(':').collect();
        let [key_id, secret] = parts.as_slice() else {
            return false;
        };
        self.keys
            .get(*key_id)
            .is_some_and(|expected| expected.as_str() == *secret)
    }
}

#[derive(Clone)]
struct ForwardState {
    writer: Arc<dyn DataWriter>,
    keys: Arc<KeyRing>,
}

/// Router exposing `POST /v1/submit-batch` and `GET /metrics`.
pub fn router(writer: Arc<dyn DataWriter>, keys: KeyRing, max_request_bytes: usize) -> Router {
    if !keys.is_enabled() {
        debug!("FORWARD_SERVER | No keys configured, authentication disabled");
    }
    let state = ForwardState {
        writer,
        keys: Arc::new(keys),
    };

    Router::new()
        .route(SUBMIT_BATCH_PATH, post(submit_batch))
        .route("/metrics", get(handler_metrics))
        .fallback(handler_not_found)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}

async fn submit_batch(
    State(state): State<ForwardState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !state.keys.authorize(authorization) {
        return log_and_create_http_response(
            "FORWARD_SERVER | unauthorized",
            StatusCode::UNAUTHORIZED,
        );
    }

    let batch: Batch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            return log_and_create_http_response(
                &format!("FORWARD_SERVER | invalid json: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    debug!(
        "FORWARD_SERVER | Received {} metrics, {} logs and {} events",
        batch.metrics.len(),
        batch.logs.len(),
        batch.events.len()
    );

    let Batch {
        metrics,
        logs,
        events,
    } = batch;
    if !metrics.is_empty() {
        state.writer.write_metrics(metrics);
    }
    if !logs.is_empty() {
        state.writer.write_logs(logs);
    }
    if !events.is_empty() {
        state.writer.write_events(events);
    }

    StatusCode::NO_CONTENT.into_response()
}
