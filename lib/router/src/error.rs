// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error surface of the router service.
//!
//! Errors recoverable within a request are handled where they occur; what
//! reaches here is what the caller must decide about (retry, degrade,
//! abort), mapped onto HTTP statuses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::dispatcher::DispatchError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("{0}")]
    RequestTooLarge(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("request deadline exceeded")]
    Timeout,

    #[error("worker unreachable: {0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for ServiceError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NoWorkersAvailable => ServiceError::NoWorkersAvailable,
            err @ DispatchError::RequestTooLarge { .. } => {
                ServiceError::RequestTooLarge(err.to_string())
            }
            DispatchError::Tokenize(err) => ServiceError::BadRequest(err.to_string()),
            DispatchError::Indexer(err) => ServiceError::Internal(err.to_string()),
        }
    }
}

impl ServiceError {
    fn code(&self) -> (StatusCode, &'static str) {
        match self {
            ServiceError::NoWorkersAvailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_workers_available")
            }
            ServiceError::RequestTooLarge(_) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "request_too_large")
            }
            ServiceError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServiceError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ServiceError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "bad_gateway"),
            ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = self.code();
        if status.is_server_error() {
            tracing::error!(code, "request failed: {self}");
        }
        let body = Json(json!({
            "error": { "code": code, "message": self.to_string() }
        }));
        (status, body).into_response()
    }
}
