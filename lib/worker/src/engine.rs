// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker task engine.
//!
//! One background task owns the block cache and an agenda of in-flight
//! requests. Admissions arrive over a channel, completion is simulated by
//! sleeping until the earliest deadline, and each admission answers its
//! caller through a oneshot resolved at completion time.
//!
//! ## Latency model
//!
//! - `prefill_ms = PREFILL_BASE_MS + blocks_to_compute * PREFILL_PER_BLOCK_MS`
//! - `decode_ms = decode_tokens * DECODE_PER_TOKEN_MS`
//! - full blocks the generated tokens add beyond the resident prompt blocks
//!   are recomputed at the prefill per-block rate
//!
//! `current_load` is the sum of remaining estimated latency over active
//! tasks, in model milliseconds. Wall-clock sleeps are divided by
//! `speedup_ratio` so a fleet can be exercised faster than real time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use derive_builder::Builder;
use kvflow_core::protocols::{
    BlockHash, CompletionRequest, SyncReport, WorkerCompletion, WorkerId,
};
use kvflow_core::tokenize::{self, TokenizeError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::block_cache::{BlockCache, BlockCacheError};
use crate::running_mean::RunningMean;

/// Configuration for a worker engine.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(pattern = "owned", build_fn(public))]
pub struct EngineArgs {
    #[builder(default = "924")]
    pub num_blocks: usize,

    #[builder(default = "16")]
    pub block_size: usize,

    #[builder(default = "5.0")]
    pub prefill_base_ms: f64,

    #[builder(default = "2.5")]
    pub prefill_per_block_ms: f64,

    #[builder(default = "15.0")]
    pub decode_per_token_ms: f64,

    /// Simulated time runs this much faster than wall clock.
    #[builder(default = "1.0")]
    pub speedup_ratio: f64,

    #[builder(default = "1000")]
    pub hit_rate_window: u16,
}

impl Default for EngineArgs {
    fn default() -> Self {
        EngineArgsBuilder::default()
            .build()
            .expect("default EngineArgs must build")
    }
}

impl EngineArgs {
    pub fn builder() -> EngineArgsBuilder {
        EngineArgsBuilder::default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Tokenize(#[from] TokenizeError),

    #[error(transparent)]
    Cache(#[from] BlockCacheError),

    #[error("engine is offline")]
    Offline,

    #[error("worker is unhealthy; refusing admissions")]
    Unhealthy,
}

/// Snapshot of the engine's externally visible state, published on a watch
/// channel after every admission and completion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerMetrics {
    pub active_tasks: usize,
    /// Remaining estimated latency over active tasks, in model ms.
    pub current_load: f64,
    pub cached_blocks: usize,
    /// Mean block-level cache hit rate over recent admissions.
    pub hit_rate: f32,
    /// Set after a fatal invariant violation; sticky until restart.
    pub unhealthy: bool,
}

enum EngineCommand {
    Admit {
        request: CompletionRequest,
        resp: oneshot::Sender<Result<WorkerCompletion, EngineError>>,
    },
    SyncSnapshot {
        resp: oneshot::Sender<SyncReport>,
    },
}

struct ActiveTask {
    block_hashes: Vec<BlockHash>,
    completes_at: Instant,
    completion: WorkerCompletion,
    resp: oneshot::Sender<Result<WorkerCompletion, EngineError>>,
}

/// Handle to the engine task. Cheap to clone.
#[derive(Clone)]
pub struct WorkerEngine {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    metrics_rx: watch::Receiver<WorkerMetrics>,
}

impl WorkerEngine {
    /// Spawn the engine loop. Evicted block hashes are pushed to `evict_tx`
    /// as they happen, for the push-based eviction report path.
    pub fn start(
        worker_id: WorkerId,
        args: EngineArgs,
        evict_tx: mpsc::UnboundedSender<BlockHash>,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = watch::channel(WorkerMetrics::default());

        tokio::spawn(run_engine(
            worker_id, args, cmd_rx, metrics_tx, evict_tx, cancel,
        ));

        Self { cmd_tx, metrics_rx }
    }

    /// Admit a request; resolves with the completion report once the
    /// simulated latency has elapsed.
    pub async fn admit(&self, request: CompletionRequest) -> Result<WorkerCompletion, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Admit { request, resp })
            .map_err(|_| EngineError::Offline)?;
        rx.await.map_err(|_| EngineError::Offline)?
    }

    /// Authoritative cache contents for the periodic sync report.
    pub async fn sync_snapshot(&self) -> Result<SyncReport, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::SyncSnapshot { resp })
            .map_err(|_| EngineError::Offline)?;
        rx.await.map_err(|_| EngineError::Offline)
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics_rx.borrow().clone()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<WorkerMetrics> {
        self.metrics_rx.clone()
    }
}

struct EngineState {
    worker_id: WorkerId,
    args: EngineArgs,
    cache: BlockCache,
    tasks: HashMap<String, ActiveTask>,
    deadlines: BinaryHeap<Reverse<(Instant, String)>>,
    hit_rates: RunningMean,
    request_counter: u64,
    unhealthy: bool,
}

async fn run_engine(
    worker_id: WorkerId,
    args: EngineArgs,
    mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    metrics_tx: watch::Sender<WorkerMetrics>,
    evict_tx: mpsc::UnboundedSender<BlockHash>,
    cancel: CancellationToken,
) {
    let mut state = EngineState {
        cache: BlockCache::new(args.num_blocks),
        hit_rates: RunningMean::new(args.hit_rate_window),
        tasks: HashMap::new(),
        deadlines: BinaryHeap::new(),
        request_counter: 0,
        unhealthy: false,
        worker_id,
        args,
    };

    loop {
        let next_deadline = state.deadlines.peek().map(|entry| entry.0.0);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(worker_id = %state.worker_id, "engine shutting down");
                break;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    EngineCommand::Admit { request, resp } => {
                        state.admit(request, resp, &evict_tx);
                    }
                    EngineCommand::SyncSnapshot { resp } => {
                        let _ = resp.send(SyncReport {
                            worker_id: state.worker_id.clone(),
                            cached_hashes: state.cache.cached_hashes(),
                            sequences: state.cache.resident_sequences(),
                        });
                    }
                }
                state.publish_metrics(&metrics_tx);
            }
            _ = sleep_until(next_deadline), if next_deadline.is_some() => {
                state.complete_due();
                state.publish_metrics(&metrics_tx);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline.into()).await;
    }
}

impl EngineState {
    fn admit(
        &mut self,
        request: CompletionRequest,
        resp: oneshot::Sender<Result<WorkerCompletion, EngineError>>,
        evict_tx: &mpsc::UnboundedSender<BlockHash>,
    ) {
        match self.try_admit(request, evict_tx) {
            Ok((request_id, parts)) => {
                self.deadlines
                    .push(Reverse((parts.completes_at, request_id.clone())));
                self.tasks.insert(
                    request_id,
                    ActiveTask {
                        block_hashes: parts.block_hashes,
                        completes_at: parts.completes_at,
                        completion: parts.completion,
                        resp,
                    },
                );
            }
            Err(err) => {
                let _ = resp.send(Err(err));
            }
        }
    }

    fn try_admit(
        &mut self,
        request: CompletionRequest,
        evict_tx: &mpsc::UnboundedSender<BlockHash>,
    ) -> Result<(String, ActiveTaskParts), EngineError> {
        if self.unhealthy {
            return Err(EngineError::Unhealthy);
        }

        let hashed = tokenize::hash_prompt(&request.prompt, self.args.block_size)?;
        let total_blocks = hashed.block_hashes.len();

        let allocation = match self.cache.allocate(&hashed.block_hashes) {
            Ok(allocation) => allocation,
            Err(err @ BlockCacheError::ReferencedEviction { .. }) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    "cache invariant violated: {err}; marking worker unhealthy"
                );
                self.unhealthy = true;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        for block_hash in &allocation.evicted {
            let _ = evict_tx.send(*block_hash);
        }

        let decode_tokens = request.max_tokens.max(1);
        let blocks_to_compute = total_blocks - allocation.num_cached_prefix;

        // full blocks the generated tokens add past the resident prompt
        // blocks; those are recomputed at the prefill rate
        let overflow_blocks = ((hashed.total_tokens + decode_tokens) / self.args.block_size)
            .saturating_sub(total_blocks);

        let prefill_ms = self.args.prefill_base_ms
            + (blocks_to_compute + overflow_blocks) as f64 * self.args.prefill_per_block_ms;
        let decode_ms = decode_tokens as f64 * self.args.decode_per_token_ms;
        let latency_ms = prefill_ms + decode_ms;

        self.hit_rates.push(if total_blocks > 0 {
            allocation.num_cached_prefix as f32 / total_blocks as f32
        } else {
            0.0
        });

        self.request_counter += 1;
        let request_id = format!("req-{}", self.request_counter);
        let completes_at =
            Instant::now() + Duration::from_secs_f64(latency_ms / 1000.0 / self.args.speedup_ratio);

        tracing::debug!(
            worker_id = %self.worker_id,
            request_id = %request_id,
            total_blocks,
            cached = allocation.num_cached_prefix,
            to_compute = blocks_to_compute,
            decode_tokens,
            latency_ms,
            "admitted task"
        );

        let completion = WorkerCompletion {
            worker_id: self.worker_id.clone(),
            request_id: request_id.clone(),
            num_cached_blocks: allocation.num_cached_prefix,
            num_computed_blocks: blocks_to_compute,
            decode_tokens,
            latency_ms,
        };

        Ok((
            request_id,
            ActiveTaskParts {
                block_hashes: hashed.block_hashes,
                completes_at,
                completion,
            },
        ))
    }

    fn complete_due(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, _))) = self.deadlines.peek() {
            if *at > now {
                break;
            }
            let Reverse((_, request_id)) = self.deadlines.pop().expect("peeked entry must exist");
            let Some(task) = self.tasks.remove(&request_id) else {
                continue;
            };
            self.cache.release(&task.block_hashes);
            tracing::debug!(
                worker_id = %self.worker_id,
                request_id = %request_id,
                latency_ms = task.completion.latency_ms,
                "task completed"
            );
            let _ = task.resp.send(Ok(task.completion));
        }
    }

    fn current_load(&self, now: Instant) -> f64 {
        self.tasks
            .values()
            .map(|task| {
                task.completes_at.saturating_duration_since(now).as_secs_f64()
                    * 1000.0
                    * self.args.speedup_ratio
            })
            .sum()
    }

    fn publish_metrics(&self, metrics_tx: &watch::Sender<WorkerMetrics>) {
        let _ = metrics_tx.send(WorkerMetrics {
            active_tasks: self.tasks.len(),
            current_load: self.current_load(Instant::now()),
            cached_blocks: self.cache.len(),
            hit_rate: self.hit_rates.mean(),
            unhealthy: self.unhealthy,
        });
    }
}

/// The admission-time pieces of an [`ActiveTask`], before the response
/// channel is attached.
struct ActiveTaskParts {
    block_hashes: Vec<BlockHash>,
    completes_at: Instant,
    completion: WorkerCompletion,
}
