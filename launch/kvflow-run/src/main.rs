// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `kvflow-run` - start a router or a worker.
//!
//! Configuration comes from `KVFLOW_ROUTER_*` / `KVFLOW_WORKER_*`
//! environment variables; the few flags below override it for quick local
//! runs. Exits non-zero on misconfiguration or bind failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kvflow_core::indexer::CacheIndexer;
use kvflow_router::background::spawn_stale_sweeper;
use kvflow_router::service::AppState;
use kvflow_router::{Dispatcher, RouterConfig, RoutingStrategy, WorkerTable};
use kvflow_worker::reporter::{ReporterContext, spawn_report_loops};
use kvflow_worker::service::WorkerState;
use kvflow_worker::{WorkerConfig, WorkerEngine};

#[derive(Parser)]
#[command(name = "kvflow-run", about = "Cache-aware LLM request router", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the router.
    Router {
        #[arg(long)]
        port: Option<u16>,

        /// cache_aware, round_robin or least_loaded
        #[arg(long)]
        strategy: Option<String>,

        /// Forward requests to the chosen worker instead of returning the
        /// decision only.
        #[arg(long)]
        proxy: bool,
    },
    /// Run a worker.
    Worker {
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        router_url: Option<String>,

        #[arg(long)]
        worker_id: Option<String>,
    },
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("KVFLOW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Router {
            port,
            strategy,
            proxy,
        } => run_router(port, strategy, proxy).await,
        Command::Worker {
            port,
            router_url,
            worker_id,
        } => run_worker(port, router_url, worker_id).await,
    }
}

async fn run_router(
    port: Option<u16>,
    strategy: Option<String>,
    proxy: bool,
) -> anyhow::Result<()> {
    let mut config = RouterConfig::from_settings().context("invalid router configuration")?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(strategy) = strategy {
        config.strategy = strategy
            .parse::<RoutingStrategy>()
            .map_err(|err| anyhow::anyhow!(err))?;
    }
    if proxy {
        config.proxy_mode = true;
    }

    let cancel = shutdown_token();
    let indexer = CacheIndexer::new(cancel.clone());
    let workers = Arc::new(WorkerTable::new());
    let dispatcher = Arc::new(Dispatcher::new(&config, indexer, workers));

    let sweeper = spawn_stale_sweeper(
        dispatcher.clone(),
        config.stale_worker_timeout(),
        cancel.clone(),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid router listen address")?;
    let state = Arc::new(AppState::new(dispatcher, config));
    kvflow_router::service::serve(state, addr, cancel.clone())
        .await
        .context("router server failed")?;

    cancel.cancel();
    sweeper.await.ok();
    tracing::info!("router stopped");
    Ok(())
}

async fn run_worker(
    port: Option<u16>,
    router_url: Option<String>,
    worker_id: Option<String>,
) -> anyhow::Result<()> {
    let mut config = WorkerConfig::from_settings().context("invalid worker configuration")?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(router_url) = router_url {
        config.router_url = router_url;
    }
    if worker_id.is_some() {
        config.worker_id = worker_id;
    }

    let resolved_id = config.resolved_worker_id();
    tracing::info!(
        worker_id = %resolved_id,
        num_blocks = config.num_blocks,
        block_size = config.block_size,
        "starting worker"
    );

    let cancel = shutdown_token();
    let (evict_tx, evict_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = WorkerEngine::start(
        resolved_id.clone(),
        config.engine_args(),
        evict_tx,
        cancel.clone(),
    );

    let reporters = spawn_report_loops(
        ReporterContext {
            worker_id: resolved_id.clone(),
            router_url: config.router_url.clone(),
            advertise_url: config.resolved_advertise_url(),
            heartbeat_period: Duration::from_secs_f64(config.heartbeat_period_secs),
            sync_period: Duration::from_secs_f64(config.sync_period_secs),
        },
        engine.clone(),
        evict_rx,
        cancel.clone(),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid worker listen address")?;
    let state = Arc::new(WorkerState {
        worker_id: resolved_id,
        engine,
    });
    kvflow_worker::service::serve(state, addr, cancel.clone())
        .await
        .context("worker server failed")?;

    cancel.cancel();
    for handle in reporters {
        handle.await.ok();
    }
    tracing::info!("worker stopped");
    Ok(())
}
