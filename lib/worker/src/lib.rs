// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! kvflow worker - block cache, task engine and router reporting.
//!
//! A worker admits generation requests, accounts for their KV blocks in a
//! fixed-capacity reference-counted cache, simulates prefill/decode latency,
//! and keeps the router's view of its cache converging through heartbeats,
//! push-based eviction reports and periodic full-state sync.

pub mod block_cache;
pub mod config;
pub mod engine;
pub mod reporter;
pub mod running_mean;
pub mod service;

pub use block_cache::{Allocation, BlockCache, BlockCacheError};
pub use config::WorkerConfig;
pub use engine::{EngineArgs, EngineError, WorkerEngine, WorkerMetrics};
