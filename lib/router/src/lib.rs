// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! kvflow router - cache-aware dispatch over a fleet of workers.
//!
//! The router keeps a live-worker table fed by heartbeats and a global
//! cache map fed by speculative routing decisions, eviction reports and
//! periodic worker syncs. Each incoming request is hashed into its block
//! sequence, matched against the map, and dispatched per the configured
//! strategy.

pub mod background;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod service;
pub mod workers;

pub use config::{RouterConfig, RoutingStrategy};
pub use dispatcher::{DispatchDecision, DispatchError, Dispatcher};
pub use workers::WorkerTable;
