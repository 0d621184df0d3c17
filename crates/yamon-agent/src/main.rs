// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use yamon::{
    accumulator::{AccumulatorConfig, BatchAccumulator},
    agent_http,
    config::{load_agent_config, AgentConfig},
    cursor::{CursorTracker, FileCursorTracker, NoopCursorTracker},
    errors::SetupError,
    forward::{client::ForwardClient, ForwardTarget},
    http_utils,
    journal::JournalReader,
    prometheus::PrometheusScraper,
    scheduler::{CollectorRegistry, CollectorScheduler},
    script::Script,
    sink::{LogSink, MetadataFilter, Sink},
    tail::LogFileTailer,
    telemetry::{init_logging, install_metrics_recorder},
};

#[derive(Debug, Parser)]
#[command(name = "yamon-agent", version, about = "Collects host telemetry and forwards it to a yamon server")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long, env = "YAMON_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "YAMON_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

type ForwardAccumulator = BatchAccumulator<ForwardClient>;

/// Everything resolved from configuration before any task is spawned.
struct Agent {
    accumulator: Arc<ForwardAccumulator>,
    sink: Arc<dyn Sink>,
    scheduler: CollectorScheduler,
    streaming: Vec<Script>,
    tailers: Vec<LogFileTailer>,
    journal: Option<JournalReader>,
    http: Option<std::net::SocketAddr>,
}

async fn build(config: &AgentConfig) -> Result<Agent, SetupError> {
    let target = ForwardTarget::parse(&config.target)?;
    let client = ForwardClient::new(target, config.forward_timeout()?)?;
    let flush = config.flush.to_accumulator(AccumulatorConfig::agent())?;
    let accumulator = Arc::new(BatchAccumulator::new(flush, client));

    let hostname = config.resolve_hostname();
    info!("Reporting as host {hostname} to {}", accumulator.action().target().base());
    let sink: Arc<dyn Sink> = Arc::new(MetadataFilter::new(
        hostname,
        config.tags.clone(),
        Arc::clone(&accumulator),
    ));

    let mut registry = CollectorRegistry::with_builtin();
    let mut tasks = config.task_configs(&registry.names())?;
    let mut streaming = Vec::new();
    for script in config.scripts()? {
        if script.is_streaming() {
            streaming.push(script);
        } else {
            tasks.push(script.task_config());
            registry.register(Arc::new(script));
        }
    }
    for target in config.scrape_targets()? {
        let scraper = PrometheusScraper::new(target)?;
        tasks.push(scraper.task_config());
        registry.register(Arc::new(scraper));
    }
    let mut scheduler = CollectorScheduler::new(Arc::clone(&sink));
    scheduler.schedule(&registry, &tasks)?;

    let mut tailers = Vec::with_capacity(config.log_file.len());
    for file in &config.log_file {
        let format = file.log_format()?;
        let tailer = LogFileTailer::open(&file.path, file.service.clone(), file.level.clone(), Arc::clone(&sink)).await?;
        tailers.push(tailer.with_format(format));
    }

    let journal = match &config.journal {
        Some(journal) if journal.enabled => {
            let tracker: Box<dyn CursorTracker> = match &journal.cursor_path {
                Some(path) => Box::new(FileCursorTracker::open(path, journal.cursor_sync)?),
                None => Box::new(NoopCursorTracker),
            };
            let log_sink = Arc::new(Arc::clone(&sink)) as Arc<dyn LogSink>;
            Some(JournalReader::new(log_sink, tracker, journal.ignored_services.clone()))
        }
        _ => None,
    };

    Ok(Agent {
        accumulator,
        sink,
        scheduler,
        streaming,
        tailers,
        journal,
        http: config.http_bind()?,
    })
}

fn spawn_streaming(script: Script, sink: Arc<dyn Sink>, cancel: CancellationToken) -> JoinHandle<()> {
    let restart_after = script.task_config().interval;
    tokio::spawn(async move {
        loop {
            match script.run_streaming(Arc::clone(&sink), cancel.clone()).await {
                Ok(()) => break,
                Err(e) => error!("SCRIPT | {}: {e}, restarting in {restart_after:?}", script.task_config().name),
            }
            tokio::select! {
                () = tokio::time::sleep(restart_after) => {}
                () = cancel.cancelled() => break,
            }
        }
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("Failed to listen for ctrl-c: {e}");
                        }
                    }
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {e}");
    }
}

async fn run(args: Args) -> Result<(), SetupError> {
    let config = load_agent_config(args.config.as_deref())?;
    install_metrics_recorder()?;
    let agent = build(&config).await?;
    debug!("Scheduled collectors: {:?}", agent.scheduler.task_names());

    let cancel = CancellationToken::new();
    let flush_cancel = CancellationToken::new();
    let flusher = tokio::spawn(Arc::clone(&agent.accumulator).run(flush_cancel.clone()));

    let mut handles = agent.scheduler.start(cancel.clone());
    for script in agent.streaming {
        handles.push(spawn_streaming(script, Arc::clone(&agent.sink), cancel.clone()));
    }
    for tailer in agent.tailers {
        handles.push(tokio::spawn(tailer.run(cancel.clone())));
    }
    if let Some(reader) = agent.journal {
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = reader.run(cancel).await {
                error!("JOURNAL | Reader stopped: {e}");
            }
        }));
    }
    if let Some(addr) = agent.http {
        let router = agent_http::router(Arc::clone(&agent.sink));
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = http_utils::serve("AGENT_HTTP", addr, router, cancel).await {
                error!("AGENT_HTTP | Server error: {e}");
            }
        }));
    }

    info!("yamon-agent started");
    shutdown_signal().await;
    info!("Shutting down, flushing pending records");

    // Producers stop first so the final flush sees everything they wrote.
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Task failed during shutdown: {e}");
        }
    }
    flush_cancel.cancel();
    if let Err(e) = flusher.await {
        error!("FORWARD | Flush loop failed: {e}");
    }
    Ok(())
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("yamon-agent: {e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to start yamon-agent: {e}");
            ExitCode::FAILURE
        }
    }
}
