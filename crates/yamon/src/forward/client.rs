// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use core::time::Duration;
use reqwest::{header, StatusCode};
use std::time::Instant;
use tracing::debug;

use crate::accumulator::FlushAction;
use crate::envelope::Batch;
use crate::errors::{FlushError, ForwardError};
use crate::forward::ForwardTarget;
use crate::http_utils::build_client;

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends batches to a yamon server. Used as the flush action of the agent's
/// terminal accumulator.
#[derive(Clone)]
pub struct ForwardClient {
    target: ForwardTarget,
    client: reqwest::Client,
}

impl ForwardClient {
    pub fn new(target: ForwardTarget, timeout: Duration) -> Result<Self, ForwardError> {
        Ok(ForwardClient {
            target,
            client: build_client(timeout)?,
        })
    }

    #[must_use]
    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// Posts one batch. Only `204 No Content` counts as delivered; the batch
    /// is not retried either way.
    pub async fn submit_batch(&self, batch: &Batch) -> Result<(), ForwardError> {
        let body = serde_json::to_vec(batch)?;
        let url = self.target.submit_url();
        debug!(
            "FORWARD | Submitting {} records ({} bytes) to {}",
            batch.len(),
            body.len(),
            self.target.base()
        );

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, self.target.authorization())
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwardError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(
            "FORWARD | Batch accepted in {} ms",
            start.elapsed().as_millis()
        );
        Ok(())
    }
}

#[async_trait]
impl FlushAction for ForwardClient {
    fn name(&self) -> &'static str {
        "FORWARD"
    }

    async fn flush(&self, batch: Batch) -> Result<(), FlushError> {
        let result = self.submit_batch(&batch).await;
        let outcome = if result.is_ok() { "sent" } else { "failed" };
        metrics::counter!("yamon_forward_batches", 1, "result" => outcome);
        Ok(result?)
    }
}
