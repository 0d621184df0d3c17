// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide logging and self-metrics setup shared by both binaries.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::errors::SetupError;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Builds the filter directive for `log_level`, silencing noisy HTTP crates.
#[must_use]
pub fn env_filter_directive(log_level: &str) -> String {
    format!(
        "h2=off,hyper=off,rustls=off,reqwest=warn,{}",
        log_level.to_lowercase()
    )
}

/// Installs the global fmt subscriber.
pub fn init_logging(log_level: &str) -> Result<(), SetupError> {
    let filter = EnvFilter::try_new(env_filter_directive(log_level))
        .map_err(|e| SetupError::Logging(format!("could not parse log level '{log_level}': {e}")))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| SetupError::Logging(e.to_string()))?;

    debug!("Logging subsystem enabled");
    Ok(())
}

/// Installs the Prometheus recorder behind the `metrics` facade and describes
/// the counters this crate emits.
pub fn install_metrics_recorder() -> Result<(), SetupError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| SetupError::Metrics(e.to_string()))?;
    if PROMETHEUS_HANDLE.set(handle).is_err() {
        return Err(SetupError::Metrics("recorder already installed".to_string()));
    }

    metrics::describe_counter!(
        "yamon_ingested_metrics",
        "Metrics written to or dropped by the column store"
    );
    metrics::describe_counter!(
        "yamon_ingested_logs",
        "Log entries written to or dropped by the column store"
    );
    metrics::describe_counter!(
        "yamon_ingested_events",
        "Events written to or dropped by the column store"
    );
    metrics::describe_counter!(
        "yamon_forward_batches",
        "Batches sent to or rejected by the forward target"
    );
    metrics::describe_counter!("yamon_collector_runs", "Collector invocations by outcome");
    Ok(())
}

/// Prometheus text exposition of every recorded metric.
#[must_use]
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# metrics recorder not installed\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_directive() {
        assert_eq!(
            env_filter_directive("DEBUG"),
            "h2=off,hyper=off,rustls=off,reqwest=warn,debug"
        );
        assert!(EnvFilter::try_new(env_filter_directive("info")).is_ok());
    }

    #[test]
    fn test_render_without_recorder() {
        if PROMETHEUS_HANDLE.get().is_none() {
            assert!(render_metrics().starts_with('#'));
        }
    }
}
