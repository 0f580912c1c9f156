// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker selection.
//!
//! The dispatcher owns every mutation of shared routing state: it consults
//! the cache map, picks a worker per the configured strategy, and applies
//! the speculative updates (map and load) that keep back-to-back identical
//! requests from scattering across the fleet before the first one lands.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kvflow_core::indexer::{CacheIndexer, IndexerError};
use kvflow_core::protocols::{
    BlockHash, CacheStatus, EvictionReport, RouterEvent, SyncReport, WorkerId,
};
use kvflow_core::tokenize::{self, TokenizeError};

use crate::config::{RouterConfig, RoutingStrategy};
use crate::workers::WorkerTable;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("request requires {requested} blocks but worker capacity is {capacity}")]
    RequestTooLarge { requested: usize, capacity: usize },

    #[error(transparent)]
    Tokenize(#[from] TokenizeError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),
}

/// Outcome of one routing decision.
#[derive(Debug, Clone)]
pub struct DispatchDecision {
    pub worker_id: WorkerId,
    pub worker_url: Option<String>,
    pub cache_status: CacheStatus,
    pub match_length: u32,
    pub block_hashes: Vec<BlockHash>,
}

pub struct Dispatcher {
    indexer: CacheIndexer,
    workers: Arc<WorkerTable>,
    strategy: RoutingStrategy,
    block_size: usize,
    cache_capacity_blocks: usize,
    speculative_load_ms: f64,
    stale_worker_timeout: Duration,
    /// Shared rotation pointer for round-robin and tie-breaking.
    rotation: AtomicU64,
    /// Event ids for the cache events this router originates.
    event_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(config: &RouterConfig, indexer: CacheIndexer, workers: Arc<WorkerTable>) -> Self {
        Self {
            indexer,
            workers,
            strategy: config.strategy,
            block_size: config.block_size,
            cache_capacity_blocks: config.cache_capacity_blocks,
            speculative_load_ms: config.speculative_load_ms,
            stale_worker_timeout: config.stale_worker_timeout(),
            rotation: AtomicU64::new(0),
            event_id: AtomicU64::new(0),
        }
    }

    pub fn workers(&self) -> &WorkerTable {
        &self.workers
    }

    pub fn indexer(&self) -> &CacheIndexer {
        &self.indexer
    }

    /// Route one prompt: hash, select per strategy, speculatively update.
    pub async fn dispatch(&self, prompt: &str) -> Result<DispatchDecision, DispatchError> {
        let hashed = tokenize::hash_prompt(prompt, self.block_size)?;
        if hashed.block_hashes.len() > self.cache_capacity_blocks {
            return Err(DispatchError::RequestTooLarge {
                requested: hashed.block_hashes.len(),
                capacity: self.cache_capacity_blocks,
            });
        }

        let live = self.workers.live_workers(self.stale_worker_timeout);
        if live.is_empty() {
            return Err(DispatchError::NoWorkersAvailable);
        }

        let (worker_id, cache_status, match_length) = match self.strategy {
            RoutingStrategy::RoundRobin => {
                let index = self.rotation.fetch_add(1, Ordering::Relaxed) as usize % live.len();
                (live[index].0.clone(), CacheStatus::Miss, 0)
            }
            RoutingStrategy::LeastLoaded => {
                (self.select_least_loaded(&live), CacheStatus::Miss, 0)
            }
            RoutingStrategy::CacheAware => {
                let scores = self
                    .indexer
                    .find_matches(hashed.block_hashes.clone())
                    .await?;
                // only live workers count; the map may lag behind the table
                let best = scores.best_workers();
                let candidates: Vec<(WorkerId, f64)> = live
                    .iter()
                    .filter(|(id, _)| best.contains(id))
                    .cloned()
                    .collect();
                let match_length = scores.match_length();
                if match_length > 0 && !candidates.is_empty() {
                    (
                        self.select_least_loaded(&candidates),
                        CacheStatus::Hit,
                        match_length,
                    )
                } else {
                    (self.select_least_loaded(&live), CacheStatus::Miss, 0)
                }
            }
        };

        tracing::debug!(
            worker_id = %worker_id,
            ?cache_status,
            match_length,
            num_blocks = hashed.block_hashes.len(),
            "dispatch decision"
        );

        // Speculative update: concurrent identical requests must see this
        // sequence on the chosen worker before its first sync arrives, and
        // the load bump keeps ties from collapsing onto one worker.
        if !hashed.block_hashes.is_empty() {
            self.indexer.apply_event(RouterEvent::stored(
                worker_id.clone(),
                self.next_event_id(),
                hashed.block_hashes.clone(),
            ))?;
        }
        self.workers
            .add_speculative_load(&worker_id, self.speculative_load_ms);

        Ok(DispatchDecision {
            worker_url: self.workers.worker_url(&worker_id),
            worker_id,
            cache_status,
            match_length,
            block_hashes: hashed.block_hashes,
        })
    }

    /// Minimum load wins; ties rotate through the tied subset so repeated
    /// selections do not pile onto the first match.
    fn select_least_loaded(&self, workers: &[(WorkerId, f64)]) -> WorkerId {
        let min_load = workers
            .iter()
            .map(|(_, load)| *load)
            .fold(f64::INFINITY, f64::min);
        let tied: Vec<&WorkerId> = workers
            .iter()
            .filter(|(_, load)| *load == min_load)
            .map(|(id, _)| id)
            .collect();
        if tied.len() == 1 {
            return tied[0].clone();
        }
        let index = self.rotation.fetch_add(1, Ordering::Relaxed) as usize % tied.len();
        tied[index].clone()
    }

    fn next_event_id(&self) -> u64 {
        self.event_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fast-path correction from a worker eviction report.
    pub fn record_eviction(&self, report: EvictionReport) -> Result<(), IndexerError> {
        self.indexer.apply_event(RouterEvent::removed(
            report.worker_id,
            self.next_event_id(),
            vec![report.block_hash],
        ))
    }

    /// Slow-path anti-entropy from a worker sync report. Also (re)registers
    /// the worker in the live table.
    pub async fn record_sync(&self, report: SyncReport) -> Result<(), IndexerError> {
        self.workers.mark_registered(&report.worker_id);
        self.indexer
            .sync_worker_state(report.worker_id, report.cached_hashes, report.sequences)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvflow_core::protocols::Heartbeat;
    use tokio_util::sync::CancellationToken;

    fn setup(strategy: RoutingStrategy, worker_ids: &[&str]) -> Dispatcher {
        let config = RouterConfig {
            strategy,
            cache_capacity_blocks: 8,
            ..Default::default()
        };
        let workers = Arc::new(WorkerTable::new());
        for id in worker_ids {
            workers.apply_heartbeat(&Heartbeat {
                worker_id: id.to_string(),
                current_load: 0.0,
                worker_url: None,
                unhealthy: false,
            });
        }
        Dispatcher::new(&config, CacheIndexer::new(CancellationToken::new()), workers)
    }

    fn prompt(tag: &str, words: usize) -> String {
        (0..words)
            .map(|i| format!("{tag}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[tokio::test]
    async fn test_no_workers_available() {
        let dispatcher = setup(RoutingStrategy::CacheAware, &[]);
        let err = dispatcher.dispatch(&prompt("a", 16)).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoWorkersAvailable));
    }

    #[tokio::test]
    async fn test_request_too_large() {
        let dispatcher = setup(RoutingStrategy::CacheAware, &["w1"]);
        // capacity is 8 blocks in the test config
        let err = dispatcher.dispatch(&prompt("a", 16 * 9)).await.unwrap_err();
        assert!(matches!(err, DispatchError::RequestTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let dispatcher = setup(RoutingStrategy::RoundRobin, &["w1", "w2", "w3"]);
        let mut assigned = Vec::new();
        for _ in 0..6 {
            assigned.push(
                dispatcher
                    .dispatch(&prompt("a", 16))
                    .await
                    .unwrap()
                    .worker_id,
            );
        }
        assert_eq!(assigned, vec!["w1", "w2", "w3", "w1", "w2", "w3"]);
    }

    #[tokio::test]
    async fn test_sub_block_prompt_dispatches_as_miss() {
        let dispatcher = setup(RoutingStrategy::CacheAware, &["w1"]);
        let decision = dispatcher.dispatch("short prompt").await.unwrap();
        assert!(decision.block_hashes.is_empty());
        assert_eq!(decision.cache_status, CacheStatus::Miss);
        assert_eq!(decision.match_length, 0);
    }

    #[tokio::test]
    async fn test_cache_aware_sticks_after_first_dispatch() {
        let dispatcher = setup(RoutingStrategy::CacheAware, &["w1", "w2", "w3"]);
        let body = prompt("a", 32);

        let first = dispatcher.dispatch(&body).await.unwrap();
        assert_eq!(first.cache_status, CacheStatus::Miss);

        let second = dispatcher.dispatch(&body).await.unwrap();
        assert_eq!(second.cache_status, CacheStatus::Hit);
        assert_eq!(second.worker_id, first.worker_id);
        assert_eq!(second.match_length, 2);
    }

    #[tokio::test]
    async fn test_eviction_report_invalidates_match() {
        let dispatcher = setup(RoutingStrategy::CacheAware, &["w1"]);
        let body = prompt("a", 16);

        let first = dispatcher.dispatch(&body).await.unwrap();
        dispatcher
            .record_eviction(EvictionReport {
                worker_id: first.worker_id,
                block_hash: first.block_hashes[0],
            })
            .unwrap();

        let second = dispatcher.dispatch(&body).await.unwrap();
        assert_eq!(second.cache_status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_sync_registers_worker() {
        let dispatcher = setup(RoutingStrategy::CacheAware, &[]);
        dispatcher
            .record_sync(SyncReport {
                worker_id: "w9".to_string(),
                cached_hashes: vec![],
                sequences: vec![],
            })
            .await
            .unwrap();
        // now live, so dispatch succeeds
        let decision = dispatcher.dispatch(&prompt("a", 16)).await.unwrap();
        assert_eq!(decision.worker_id, "w9");
    }
}
