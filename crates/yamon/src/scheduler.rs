// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs independently configured collectors concurrently against one sink.
//!
//! Each task gets its own loop. Every invocation is spawned as a separate
//! tokio task and awaited under the task's timeout, so a collector that hangs
//! is aborted and one that panics only loses that invocation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{CollectError, SetupError};
use crate::sink::Sink;

pub const DEFAULT_TASK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(5);

/// A source of telemetry run periodically by the scheduler.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Runs one collection pass, emitting everything it finds into `sink`.
    async fn collect(&self, sink: &dyn Sink) -> Result<(), CollectError>;
}

/// Named collectors available to the scheduler. Built explicitly at startup.
#[derive(Default, Clone)]
pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in host collector.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::collectors::register_builtin(&mut registry);
        registry
    }

    /// Registers `collector` under its own name, replacing any previous entry.
    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.collectors
            .insert(collector.name().to_string(), collector);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(name).cloned()
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collectors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub enabled: bool,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>) -> Self {
        TaskConfig {
            name: name.into(),
            interval: DEFAULT_TASK_INTERVAL,
            timeout: DEFAULT_TASK_TIMEOUT,
            enabled: true,
        }
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
}

struct ScheduledTask {
    config: TaskConfig,
    collector: Arc<dyn Collector>,
}

pub struct CollectorScheduler {
    sink: Arc<dyn Sink>,
    tasks: Vec<ScheduledTask>,
}

impl CollectorScheduler {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        CollectorScheduler {
            sink,
            tasks: Vec::new(),
        }
    }

    /// Resolves every enabled task against `registry`. Nothing is scheduled
    /// unless all names resolve.
    pub fn schedule(
        &mut self,
        registry: &CollectorRegistry,
        configs: &[TaskConfig],
    ) -> Result<(), SetupError> {
        let mut resolved = Vec::with_capacity(configs.len());
        for config in configs.iter().filter(|c| c.enabled) {
            let collector = registry
                .get(&config.name)
                .ok_or_else(|| SetupError::UnknownCollector(config.name.clone()))?;
            resolved.push(ScheduledTask {
                config: config.clone(),
                collector,
            });
        }
        self.tasks.extend(resolved);
        Ok(())
    }

    /// Schedules a collector that does not live in the registry, such as a
    /// configured script.
    pub fn add_task(&mut self, config: TaskConfig, collector: Arc<dyn Collector>) {
        if config.enabled {
            self.tasks.push(ScheduledTask { config, collector });
        }
    }

    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.config.name.as_str()).collect()
    }

    /// Spawns one loop per task. The loops stop when `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!("SCHEDULER | Starting {} collection tasks", self.tasks.len());
        self.tasks
            .into_iter()
            .map(|task| {
                let sink = Arc::clone(&self.sink);
                let cancel = cancel.clone();
                tokio::spawn(run_task(task, sink, cancel))
            })
            .collect()
    }
}

async fn run_task(task: ScheduledTask, sink: Arc<dyn Sink>, cancel: CancellationToken) {
    let mut ticker = interval(task.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => break,
        }
        run_once(&task, &sink).await;
    }
    debug!("SCHEDULER | Task {} stopped", task.config.name);
}

async fn run_once(task: &ScheduledTask, sink: &Arc<dyn Sink>) {
    let name = task.config.name.as_str();
    let collector = Arc::clone(&task.collector);
    let sink = Arc::clone(sink);
    let mut handle = tokio::spawn(async move { collector.collect(sink.as_ref()).await });

    let now = Instant::now();
    let succeeded = match timeout(task.config.timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => {
            debug!(
                "SCHEDULER | Task {name} finished in {} ms",
                now.elapsed().as_millis()
            );
            true
        }
        Ok(Ok(Err(e))) => {
            error!("SCHEDULER | Task {name} failed: {e}");
            false
        }
        Ok(Err(join_error)) if join_error.is_panic() => {
            error!("SCHEDULER | Task {name} panicked: {join_error}");
            false
        }
        Ok(Err(join_error)) => {
            warn!("SCHEDULER | Task {name} was cancelled: {join_error}");
            false
        }
        Err(_) => {
            handle.abort();
            warn!(
                "SCHEDULER | Task {name} timed out after {} ms",
                task.config.timeout.as_millis()
            );
            false
        }
    };

    let result = if succeeded { "ok" } else { "failed" };
    metrics::counter!("yamon_collector_runs", 1, "collector" => name.to_string(), "result" => result);
}
