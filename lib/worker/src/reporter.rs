// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background report loops: heartbeat, anti-entropy sync and push-based
//! eviction notifications.
//!
//! Every loop is best-effort. A failed send is logged and state simply
//! rides along to the next cycle; the periodic sync bounds how stale the
//! router's view can get.

use std::time::Duration;

use kvflow_core::protocols::{BlockHash, EvictionReport, Heartbeat, WorkerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::WorkerEngine;

/// Everything the report loops need to know about their worker.
#[derive(Debug, Clone)]
pub struct ReporterContext {
    pub worker_id: WorkerId,
    pub router_url: String,
    pub advertise_url: String,
    pub heartbeat_period: Duration,
    pub sync_period: Duration,
}

impl ReporterContext {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.router_url.trim_end_matches('/'))
    }
}

/// Spawn the three report loops. They stop when `cancel` fires; join the
/// returned handles for a deterministic shutdown.
pub fn spawn_report_loops(
    ctx: ReporterContext,
    engine: WorkerEngine,
    evict_rx: mpsc::UnboundedReceiver<BlockHash>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let client = reqwest::Client::new();
    vec![
        tokio::spawn(heartbeat_loop(
            ctx.clone(),
            client.clone(),
            engine.clone(),
            cancel.clone(),
        )),
        tokio::spawn(sync_loop(
            ctx.clone(),
            client.clone(),
            engine,
            cancel.clone(),
        )),
        tokio::spawn(eviction_loop(ctx, client, evict_rx, cancel)),
    ]
}

async fn heartbeat_loop(
    ctx: ReporterContext,
    client: reqwest::Client,
    engine: WorkerEngine,
    cancel: CancellationToken,
) {
    let url = ctx.endpoint("/internal/heartbeat");
    let mut interval = tokio::time::interval(ctx.heartbeat_period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let metrics = engine.metrics();
        let heartbeat = Heartbeat {
            worker_id: ctx.worker_id.clone(),
            current_load: metrics.current_load,
            worker_url: Some(ctx.advertise_url.clone()),
            unhealthy: metrics.unhealthy,
        };
        if let Err(err) = client.post(&url).json(&heartbeat).send().await {
            tracing::warn!(worker_id = %ctx.worker_id, "heartbeat failed, retrying next cycle: {err}");
        }
    }
    tracing::debug!(worker_id = %ctx.worker_id, "heartbeat loop stopped");
}

async fn sync_loop(
    ctx: ReporterContext,
    client: reqwest::Client,
    engine: WorkerEngine,
    cancel: CancellationToken,
) {
    let url = ctx.endpoint("/internal/sync");
    let mut interval = tokio::time::interval(ctx.sync_period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let report = match engine.sync_snapshot().await {
            Ok(report) => report,
            Err(err) => {
                tracing::debug!(worker_id = %ctx.worker_id, "engine gone, stopping sync loop: {err}");
                break;
            }
        };
        let num_blocks = report.cached_hashes.len();
        match client.post(&url).json(&report).send().await {
            Ok(_) => tracing::debug!(worker_id = %ctx.worker_id, num_blocks, "synced cache state"),
            Err(err) => {
                tracing::warn!(worker_id = %ctx.worker_id, "sync failed, retrying next cycle: {err}");
            }
        }
    }
    tracing::debug!(worker_id = %ctx.worker_id, "sync loop stopped");
}

async fn eviction_loop(
    ctx: ReporterContext,
    client: reqwest::Client,
    mut evict_rx: mpsc::UnboundedReceiver<BlockHash>,
    cancel: CancellationToken,
) {
    let url = ctx.endpoint("/internal/evict");
    loop {
        let block_hash = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            block_hash = evict_rx.recv() => {
                let Some(block_hash) = block_hash else { break };
                block_hash
            }
        };

        let report = EvictionReport {
            worker_id: ctx.worker_id.clone(),
            block_hash,
        };
        // best effort: the next sync corrects anything dropped here
        if let Err(err) = client.post(&url).json(&report).send().await {
            tracing::warn!(worker_id = %ctx.worker_id, %block_hash, "eviction report failed: {err}");
        }
    }
    tracing::debug!(worker_id = %ctx.worker_id, "eviction loop stopped");
}
