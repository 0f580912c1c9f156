// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker HTTP surface.
//!
//! `POST /v1/completions` admits a request and answers once the simulated
//! latency has elapsed; `GET /health` exposes the engine metrics snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use kvflow_core::protocols::{CompletionRequest, WorkerId};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::block_cache::BlockCacheError;
use crate::engine::{EngineError, WorkerEngine};

pub struct WorkerState {
    pub worker_id: WorkerId,
    pub engine: WorkerEngine,
}

pub fn app(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/v1/completions", post(completions_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    state: Arc<WorkerState>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(worker_id = %state.worker_id, %addr, "worker listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn completions_handler(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, WorkerServiceError> {
    let completion = state.engine.admit(request).await?;
    Ok(Json(completion).into_response())
}

async fn health_handler(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    let metrics = state.engine.metrics();
    let status = if metrics.unhealthy { "unhealthy" } else { "healthy" };
    Json(json!({
        "status": status,
        "worker_id": state.worker_id,
        "metrics": metrics,
    }))
}

struct WorkerServiceError(EngineError);

impl From<EngineError> for WorkerServiceError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for WorkerServiceError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            EngineError::Tokenize(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            EngineError::Cache(BlockCacheError::RequestTooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "request_too_large")
            }
            EngineError::Cache(_) | EngineError::Unhealthy | EngineError::Offline => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        };
        let body = Json(json!({
            "error": { "code": code, "message": self.0.to_string() }
        }));
        (status, body).into_response()
    }
}
