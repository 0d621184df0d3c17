// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scrapes a Prometheus text exposition endpoint and re-emits its gauges and
//! counters as yamon metrics.

use async_trait::async_trait;
use core::time::Duration;
use prometheus_parse::{Sample, Scrape, Value};
use reqwest::Url;
use tracing::debug;

use crate::envelope::{Metric, Tags};
use crate::errors::CollectError;
use crate::http_utils::build_client;
use crate::scheduler::{Collector, TaskConfig};
use crate::sink::Sink;

pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolved `prometheus` block of the agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub url: Url,
    pub interval: Duration,
    pub timeout: Duration,
    /// Prepended verbatim to every scraped metric name.
    pub prefix: String,
    /// Added to every metric, overriding labels of the same name.
    pub tags: Tags,
}

impl ScrapeTarget {
    #[must_use]
    pub fn new(url: Url) -> Self {
        ScrapeTarget {
            url,
            interval: DEFAULT_SCRAPE_INTERVAL,
            timeout: DEFAULT_SCRAPE_TIMEOUT,
            prefix: String::new(),
            tags: Tags::new(),
        }
    }
}

pub struct PrometheusScraper {
    name: String,
    target: ScrapeTarget,
    client: reqwest::Client,
}

impl PrometheusScraper {
    pub fn new(target: ScrapeTarget) -> Result<Self, CollectError> {
        Ok(PrometheusScraper {
            name: format!("prometheus:{}", target.url),
            client: build_client(target.timeout)?,
            target,
        })
    }

    #[must_use]
    pub fn task_config(&self) -> TaskConfig {
        TaskConfig::new(self.name.clone())
            .with_interval(self.target.interval)
            .with_timeout(self.target.timeout)
    }

    // Histograms, summaries, untyped and non-finite samples are dropped.
    fn to_metric(&self, sample: Sample) -> Option<Metric> {
        let name = format!("{}{}", self.target.prefix, sample.metric);
        let metric = match sample.value {
            Value::Gauge(value) if value.is_finite() => Metric::gauge(name, value),
            Value::Counter(value) if value.is_finite() => Metric::counter(name, value),
            _ => return None,
        };

        let mut tags: Tags = sample
            .labels
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        tags.extend(self.target.tags.clone());
        Some(metric.with_tags(tags).at(sample.timestamp))
    }
}

/// Parses a Prometheus text exposition body.
pub fn parse_exposition(body: &str) -> Result<Vec<Sample>, CollectError> {
    let scrape = Scrape::parse(body.lines().map(|line| Ok(line.to_owned())))?;
    Ok(scrape.samples)
}

#[async_trait]
impl Collector for PrometheusScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, sink: &dyn Sink) -> Result<(), CollectError> {
        let response = self.client.get(self.target.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::Status {
                status: status.as_u16(),
                url: self.target.url.to_string(),
            });
        }
        let body = response.text().await?;

        let samples = parse_exposition(&body)?;
        let total = samples.len();
        let mut written = 0;
        for metric in samples.into_iter().filter_map(|sample| self.to_metric(sample)) {
            sink.write_metric(metric);
            written += 1;
        }
        debug!("SCRAPE | {} reported {written} of {total} samples", self.target.url);
        Ok(())
    }
}
