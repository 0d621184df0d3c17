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
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use yamon::{
    accumulator::AccumulatorConfig,
    config::load_server_config,
    errors::SetupError,
    forward::server::{router, KeyRing},
    http_utils,
    sink::DataWriter,
    storage::{clickhouse::ClickHouseStore, StorageWriter, StoreFlusher},
    telemetry::{init_logging, install_metrics_recorder},
};

#[derive(Debug, Parser)]
#[command(name = "yamon-server", version, about = "Receives forwarded telemetry and stores it in ClickHouse")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long, env = "YAMON_SERVER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "YAMON_LOG_LEVEL", default_value = "info")]
    log_level: String,
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
    let config = load_server_config(args.config.as_deref())?;
    install_metrics_recorder()?;

    let bind = config.bind_addr()?;
    let flush = config.flush.to_accumulator(AccumulatorConfig::server())?;
    let store = ClickHouseStore::new(&config.clickhouse, config.clickhouse_timeout()?)?;
    let writer = Arc::new(StorageWriter::new(flush, StoreFlusher::new(store)));

    let keys = KeyRing::new(config.keys.clone());
    if !keys.is_enabled() {
        warn!("FORWARD_SERVER | No keys configured, accepting unauthenticated batches");
    }
    let app = router(
        Arc::clone(&writer) as Arc<dyn DataWriter>,
        keys,
        config.max_request_bytes,
    );

    let flush_cancel = CancellationToken::new();
    let flusher = tokio::spawn(Arc::clone(&writer).run(flush_cancel.clone()));

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(http_utils::serve(
        "FORWARD_SERVER",
        bind,
        app,
        shutdown.clone(),
    ));

    let served = tokio::select! {
        result = &mut server => result,
        () = shutdown_signal() => {
            info!("Shutting down, flushing pending records");
            shutdown.cancel();
            server.await
        }
    };

    flush_cancel.cancel();
    if let Err(e) = flusher.await {
        error!("STORAGE | Flush loop failed: {e}");
    }

    match served {
        Ok(result) => Ok(result?),
        Err(e) => Err(std::io::Error::other(e).into()),
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("yamon-server: {e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("yamon-server stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
