// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Router HTTP surface, exercised in-process via tower.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use kvflow_core::indexer::CacheIndexer;
use kvflow_core::protocols::CompletionResponse;
use kvflow_router::service::{AppState, app};
use kvflow_router::{Dispatcher, RouterConfig, RoutingStrategy, WorkerTable};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn router_app(config: RouterConfig) -> Router {
    let workers = Arc::new(WorkerTable::new());
    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        CacheIndexer::new(CancellationToken::new()),
        workers,
    ));
    app(Arc::new(AppState::new(dispatcher, config)))
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn prompt(blocks: usize) -> String {
    (0..blocks * 16)
        .map(|i| format!("tok{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn heartbeat_body(worker_id: &str) -> Value {
    json!({"worker_id": worker_id, "current_load": 0.0, "worker_url": "http://localhost:9999"})
}

#[tokio::test]
async fn test_no_workers_is_service_unavailable() {
    let app = router_app(RouterConfig::default());
    let response = app
        .oneshot(post("/v1/completions", json!({"prompt": prompt(1)})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "no_workers_available");
}

#[tokio::test]
async fn test_heartbeat_then_miss_then_hit() {
    let app = router_app(RouterConfig::default());

    let response = app
        .clone()
        .oneshot(post("/internal/heartbeat", heartbeat_body("w1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ok"], true);

    let request = json!({"prompt": prompt(2), "max_tokens": 8});
    let response = app
        .clone()
        .oneshot(post("/v1/completions", request.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first: CompletionResponse =
        serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(first.assigned_worker, "w1");
    assert_eq!(first.block_hashes.len(), 2);
    // hashes are opaque uniform-width strings on the wire
    assert!(first.block_hashes.iter().all(|h| h.to_string().len() == 16));

    let response = app
        .oneshot(post("/v1/completions", request))
        .await
        .unwrap();
    let second = body_json(response).await;
    assert_eq!(second["cache_status"], "HIT");
    assert_eq!(second["match_length"], 2);
    assert_eq!(second["status"], "simulated");
}

#[tokio::test]
async fn test_empty_prompt_is_bad_request() {
    let app = router_app(RouterConfig::default());
    app.clone()
        .oneshot(post("/internal/heartbeat", heartbeat_body("w1")))
        .await
        .unwrap();

    let response = app
        .oneshot(post("/v1/completions", json!({"prompt": "   "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_oversized_prompt_is_request_too_large() {
    let config = RouterConfig {
        cache_capacity_blocks: 2,
        ..Default::default()
    };
    let app = router_app(config);
    app.clone()
        .oneshot(post("/internal/heartbeat", heartbeat_body("w1")))
        .await
        .unwrap();

    let response = app
        .oneshot(post("/v1/completions", json!({"prompt": prompt(3)})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["error"]["code"], "request_too_large");
}

#[tokio::test]
async fn test_evict_and_sync_round_trip() {
    let app = router_app(RouterConfig::default());
    app.clone()
        .oneshot(post("/internal/heartbeat", heartbeat_body("w1")))
        .await
        .unwrap();

    // sync installs state, evict tears one block down, both ack
    let response = app
        .clone()
        .oneshot(post(
            "/internal/sync",
            json!({
                "worker_id": "w1",
                "cached_hashes": ["00000000000000aa", "00000000000000bb"],
                "sequences": [["00000000000000aa", "00000000000000bb"]],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post(
            "/internal/evict",
            json!({"worker_id": "w1", "block_hash": "00000000000000bb"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // an eviction for a block that is not present is acknowledged too
    let response = app
        .clone()
        .oneshot(post(
            "/internal/evict",
            json!({"worker_id": "w1", "block_hash": "00000000000000cc"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/v1/workers")).await.unwrap();
    let body = body_json(response).await;
    let workers = body["workers"].as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["worker_id"], "w1");
    assert_eq!(workers[0]["cached_blocks"], 1);
}

#[tokio::test]
async fn test_health_reports_live_workers() {
    let app = router_app(RouterConfig::default());
    let response = app.clone().oneshot(get("/health")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["live_workers"], 0);

    app.clone()
        .oneshot(post("/internal/heartbeat", heartbeat_body("w1")))
        .await
        .unwrap();
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(body_json(response).await["live_workers"], 1);
}

#[tokio::test]
async fn test_unhealthy_heartbeat_excludes_worker() {
    let app = router_app(RouterConfig {
        strategy: RoutingStrategy::LeastLoaded,
        ..Default::default()
    });
    app.clone()
        .oneshot(post(
            "/internal/heartbeat",
            json!({"worker_id": "w1", "current_load": 0.0, "unhealthy": true}),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(post("/v1/completions", json!({"prompt": prompt(1)})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
