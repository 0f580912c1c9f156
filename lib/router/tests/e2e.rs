// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Full loopback test: a router and a worker on real sockets, wired by the
//! worker's own heartbeat/sync/eviction report loops, with the router in
//! proxy mode.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kvflow_core::indexer::CacheIndexer;
use kvflow_core::protocols::{CompletionRequest, CompletionResponse};
use kvflow_router::service::AppState;
use kvflow_router::{Dispatcher, RouterConfig, RoutingStrategy, WorkerTable};
use kvflow_worker::engine::EngineArgs;
use kvflow_worker::reporter::{ReporterContext, spawn_report_loops};
use kvflow_worker::service::WorkerState;
use kvflow_worker::WorkerEngine;
use tokio_util::sync::CancellationToken;

async fn serve_on_ephemeral_port(app: axum::Router, cancel: CancellationToken) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .unwrap();
    });
    addr
}

fn prompt(blocks: usize) -> String {
    (0..blocks * 16)
        .map(|i| format!("tok{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::test]
async fn e2e_proxy_flow_with_live_reporting() {
    let cancel = CancellationToken::new();

    // router
    let config = RouterConfig {
        strategy: RoutingStrategy::CacheAware,
        proxy_mode: true,
        ..Default::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        CacheIndexer::new(cancel.clone()),
        Arc::new(WorkerTable::new()),
    ));
    let router_app = kvflow_router::service::app(Arc::new(AppState::new(dispatcher, config)));
    let router_addr = serve_on_ephemeral_port(router_app, cancel.clone()).await;
    let router_url = format!("http://{router_addr}");

    // worker
    let (evict_tx, evict_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = WorkerEngine::start(
        "w1".to_string(),
        EngineArgs::builder()
            .num_blocks(64)
            .speedup_ratio(1000.0)
            .build()
            .unwrap(),
        evict_tx,
        cancel.clone(),
    );
    let worker_app = kvflow_worker::service::app(Arc::new(WorkerState {
        worker_id: "w1".to_string(),
        engine: engine.clone(),
    }));
    let worker_addr = serve_on_ephemeral_port(worker_app, cancel.clone()).await;

    let handles = spawn_report_loops(
        ReporterContext {
            worker_id: "w1".to_string(),
            router_url: router_url.clone(),
            advertise_url: format!("http://{worker_addr}"),
            heartbeat_period: Duration::from_millis(50),
            sync_period: Duration::from_millis(200),
        },
        engine,
        evict_rx,
        cancel.clone(),
    );

    let client = reqwest::Client::new();

    // wait for the first heartbeat to register the worker
    let health_url = format!("{router_url}/health");
    let mut live = 0;
    for _ in 0..100 {
        let health: serde_json::Value = client
            .get(&health_url)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        live = health["live_workers"].as_u64().unwrap_or(0);
        if live == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(live, 1, "worker never registered with the router");

    // first request: proxied, computed cold
    let completions_url = format!("{router_url}/v1/completions");
    let request = CompletionRequest {
        prompt: prompt(3),
        max_tokens: 4,
    };
    let first: CompletionResponse = client
        .post(&completions_url)
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first.assigned_worker, "w1");
    let worker_report = first.worker.expect("proxy mode must carry the worker reply");
    assert_eq!(worker_report.num_cached_blocks, 0);
    assert_eq!(worker_report.num_computed_blocks, 3);

    // second request: router HIT, worker prefix fully warm
    let second: CompletionResponse = client
        .post(&completions_url)
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second.assigned_worker, "w1");
    assert_eq!(second.match_length, 3);
    let worker_report = second.worker.unwrap();
    assert_eq!(worker_report.num_cached_blocks, 3);

    // after a sync period the router's view matches the worker's cache
    tokio::time::sleep(Duration::from_millis(400)).await;
    let workers: serde_json::Value = client
        .get(format!("{router_url}/v1/workers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(workers["workers"][0]["worker_id"], "w1");
    assert_eq!(workers["workers"][0]["cached_blocks"], 3);

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
