// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Router HTTP surface.
//!
//! Client-facing: `POST /v1/completions`. Worker-facing:
//! `POST /internal/{heartbeat,evict,sync}`. Operator-facing: `GET /health`
//! and `GET /v1/workers`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use kvflow_core::protocols::{
    Ack, CompletionRequest, CompletionResponse, DispatchStatus, EvictionReport, Heartbeat,
    SyncReport, WorkerCompletion,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::RouterConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ServiceError;

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: RouterConfig,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, config: RouterConfig) -> Self {
        Self {
            dispatcher,
            config,
            http: reqwest::Client::new(),
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/completions", post(completions_handler))
        .route("/v1/workers", get(workers_handler))
        .route("/internal/heartbeat", post(heartbeat_handler))
        .route("/internal/evict", post(evict_handler))
        .route("/internal/sync", post(sync_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, strategy = ?state.config.strategy, "router listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn completions_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ServiceError> {
    let deadline = state.config.request_timeout();
    match tokio::time::timeout(deadline, handle_completion(&state, request)).await {
        Ok(result) => result.map(Json),
        // speculative updates stay in place; the next sync corrects them
        Err(_) => Err(ServiceError::Timeout),
    }
}

async fn handle_completion(
    state: &AppState,
    request: CompletionRequest,
) -> Result<CompletionResponse, ServiceError> {
    let decision = state.dispatcher.dispatch(&request.prompt).await?;

    let mut response = CompletionResponse {
        assigned_worker: decision.worker_id.clone(),
        status: DispatchStatus::Simulated,
        block_hashes: decision.block_hashes,
        match_length: decision.match_length,
        cache_status: decision.cache_status,
        worker: None,
    };

    if state.config.proxy_mode {
        let Some(worker_url) = decision.worker_url else {
            return Err(ServiceError::BadGateway(format!(
                "worker {} has no advertised URL",
                decision.worker_id
            )));
        };
        response.worker = Some(forward_to_worker(state, &worker_url, &request).await?);
        response.status = DispatchStatus::Forwarded;
    }

    Ok(response)
}

async fn forward_to_worker(
    state: &AppState,
    worker_url: &str,
    request: &CompletionRequest,
) -> Result<WorkerCompletion, ServiceError> {
    let url = format!("{}/v1/completions", worker_url.trim_end_matches('/'));
    let resp = state
        .http
        .post(&url)
        .json(request)
        .send()
        .await
        .map_err(|err| ServiceError::BadGateway(err.to_string()))?;

    let status = resp.status();
    if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
        // surfaces the worker's own capacity verdict
        return Err(ServiceError::RequestTooLarge(
            "worker rejected the request as too large".to_string(),
        ));
    }
    if !status.is_success() {
        return Err(ServiceError::BadGateway(format!(
            "worker returned {status}"
        )));
    }
    resp.json::<WorkerCompletion>()
        .await
        .map_err(|err| ServiceError::BadGateway(err.to_string()))
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(heartbeat): Json<Heartbeat>,
) -> Json<Ack> {
    if state.dispatcher.workers().apply_heartbeat(&heartbeat) {
        tracing::info!(worker_id = %heartbeat.worker_id, url = ?heartbeat.worker_url, "worker registered");
    }
    if heartbeat.unhealthy {
        tracing::warn!(worker_id = %heartbeat.worker_id, "worker reported unhealthy; excluded from routing");
    }
    Json(Ack::ok())
}

async fn evict_handler(
    State(state): State<Arc<AppState>>,
    Json(report): Json<EvictionReport>,
) -> Result<Json<Ack>, ServiceError> {
    state
        .dispatcher
        .record_eviction(report)
        .map_err(|err| ServiceError::Internal(err.to_string()))?;
    Ok(Json(Ack::ok()))
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(report): Json<SyncReport>,
) -> Result<Json<Ack>, ServiceError> {
    let worker_id = report.worker_id.clone();
    let num_blocks = report.cached_hashes.len();
    state
        .dispatcher
        .record_sync(report)
        .await
        .map_err(|err| ServiceError::Internal(err.to_string()))?;
    tracing::debug!(worker_id = %worker_id, num_blocks, "applied sync report");
    Ok(Json(Ack::ok()))
}

async fn workers_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ServiceError> {
    let snapshots = state.dispatcher.workers().snapshot();
    let block_counts = state
        .dispatcher
        .indexer()
        .block_counts()
        .await
        .map_err(|err| ServiceError::Internal(err.to_string()))?;
    let workers: Vec<_> = snapshots
        .into_iter()
        .map(|snapshot| {
            let cached_blocks = block_counts.get(&snapshot.worker_id).copied().unwrap_or(0);
            json!({
                "worker_id": snapshot.worker_id,
                "worker_url": snapshot.worker_url,
                "current_load": snapshot.current_load,
                "healthy": snapshot.healthy,
                "last_heartbeat_secs_ago": snapshot.last_heartbeat_secs_ago,
                "cached_blocks": cached_blocks,
            })
        })
        .collect();
    Ok(Json(json!({ "workers": workers })))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "live_workers": state
            .dispatcher
            .workers()
            .live_workers(state.config.stale_worker_timeout())
            .len(),
    }))
}
