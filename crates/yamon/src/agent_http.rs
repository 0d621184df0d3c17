// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Optional local ingestion endpoint of the agent.
//!
//! Lets applications on the host push records directly into the agent's sink
//! (`POST /v1/data`) and turns arbitrary webhooks into events
//! (`POST /v1/webhook`).

use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::envelope::{Event, LogEntry, Metric, Tags};
use crate::http_utils::{handler_metrics, handler_not_found, log_and_create_http_response};
use crate::sink::Sink;

pub const DATA_PATH: &str = "/v1/data";
pub const WEBHOOK_PATH: &str = "/v1/webhook";
pub const WEBHOOK_EVENT_TYPE: &str = "yamon-agent.webhook";

#[derive(Debug, Default, Deserialize)]
pub struct PostDataRequest {
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Clone)]
struct AgentState {
    sink: Arc<dyn Sink>,
}

pub fn router(sink: Arc<dyn Sink>) -> Router {
    Router::new()
        .route(DATA_PATH, post(post_data))
        .route(WEBHOOK_PATH, post(post_webhook))
        .route("/metrics", get(handler_metrics))
        .fallback(handler_not_found)
        .with_state(AgentState { sink })
}

async fn post_data(State(state): State<AgentState>, body: Bytes) -> Response {
    let request: PostDataRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return log_and_create_http_response(
                &format!("AGENT_HTTP | invalid json: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    debug!(
        "AGENT_HTTP | Received {} metrics, {} logs and {} events",
        request.metrics.len(),
        request.logs.len(),
        request.events.len()
    );
    for metric in request.metrics {
        state.sink.write_metric(metric);
    }
    for entry in request.logs {
        state.sink.write_log(entry);
    }
    for event in request.events {
        state.sink.write_event(event);
    }
    StatusCode::NO_CONTENT.into_response()
}

// Form values that parse as JSON are kept structured, anything else as text.
fn form_value(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

async fn post_webhook(
    State(state): State<AgentState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut data = Map::new();
    if content_type.starts_with("multipart/form-data") {
        let mut multipart = match Multipart::from_request(request, &state).await {
            Ok(multipart) => multipart,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("AGENT_HTTP | invalid multipart body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };
        loop {
            match multipart.next_field().await {
                Ok(Some(field)) => {
                    let Some(name) = field.name().map(str::to_string) else {
                        continue;
                    };
                    match field.text().await {
                        Ok(text) => {
                            data.entry(name).or_insert_with(|| form_value(text));
                        }
                        Err(e) => {
                            return log_and_create_http_response(
                                &format!("AGENT_HTTP | invalid multipart field: {e}"),
                                StatusCode::BAD_REQUEST,
                            );
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return log_and_create_http_response(
                        &format!("AGENT_HTTP | invalid multipart body: {e}"),
                        StatusCode::BAD_REQUEST,
                    );
                }
            }
        }
    } else if content_type.starts_with("application/json") {
        let body = match Bytes::from_request(request, &state).await {
            Ok(body) => body,
            Err(e) => return e.into_response(),
        };
        match serde_json::from_slice::<Map<String, Value>>(&body) {
            Ok(object) => data = object,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("AGENT_HTTP | invalid json: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        }
    }

    let mut tags = Tags::new();
    tags.insert(
        "remote-addr".to_string(),
        remote.map(|ConnectInfo(addr)| addr.to_string()).unwrap_or_default(),
    );
    tags.insert("content-type".to_string(), content_type);

    state
        .sink
        .write_event(Event::from_json(WEBHOOK_EVENT_TYPE, &data).with_tags(tags));
    StatusCode::NO_CONTENT.into_response()
}
