// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channel-fronted owner of the [`RadixTree`].
//!
//! The trie uses shared interior-mutable nodes and is not `Send`, so it
//! lives on its own thread behind a single command channel. One channel,
//! not one per operation: a speculative store enqueued before a match
//! request is guaranteed to be applied before that match runs, which is
//! what keeps concurrent identical requests from all missing at once.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocols::{BlockHash, OverlapScores, RouterEvent, WorkerId};
use crate::radix_tree::RadixTree;

/// Errors surfaced by the indexer front-end.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("indexer is offline")]
    IndexerOffline,

    #[error("indexer dropped the request")]
    IndexerDroppedRequest,
}

enum IndexerCommand {
    Apply(RouterEvent),
    Match {
        sequence: Vec<BlockHash>,
        resp: oneshot::Sender<OverlapScores>,
    },
    Sync {
        worker_id: WorkerId,
        cached_hashes: Vec<BlockHash>,
        sequences: Vec<Vec<BlockHash>>,
        resp: oneshot::Sender<()>,
    },
    RemoveWorker(WorkerId),
    BlockCounts {
        resp: oneshot::Sender<HashMap<WorkerId, usize>>,
    },
}

/// Handle to the cache-map thread. Cheap to clone; all clones feed the same
/// FIFO command queue.
#[derive(Clone)]
pub struct CacheIndexer {
    cmd_tx: mpsc::UnboundedSender<IndexerCommand>,
}

impl CacheIndexer {
    pub fn new(cancel: CancellationToken) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<IndexerCommand>();

        std::thread::Builder::new()
            .name("cache-indexer".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("failed to build indexer runtime");

                runtime.block_on(async move {
                    let mut tree = RadixTree::new();
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                tracing::debug!("cache indexer shutting down");
                                break;
                            }
                            cmd = cmd_rx.recv() => {
                                let Some(cmd) = cmd else {
                                    tracing::debug!("cache indexer channel closed");
                                    break;
                                };
                                Self::handle(&mut tree, cmd);
                            }
                        }
                    }
                });
            })
            .expect("failed to spawn cache-indexer thread");

        Self { cmd_tx }
    }

    fn handle(tree: &mut RadixTree, cmd: IndexerCommand) {
        match cmd {
            IndexerCommand::Apply(event) => tree.apply_event(event),
            IndexerCommand::Match { sequence, resp } => {
                let _ = resp.send(tree.find_matches(&sequence));
            }
            IndexerCommand::Sync {
                worker_id,
                cached_hashes,
                sequences,
                resp,
            } => {
                let cached: HashSet<BlockHash> = cached_hashes.into_iter().collect();
                tree.sync_worker_state(&worker_id, &cached, &sequences);
                let _ = resp.send(());
            }
            IndexerCommand::RemoveWorker(worker_id) => tree.remove_worker(&worker_id),
            IndexerCommand::BlockCounts { resp } => {
                let counts = tree
                    .get_workers()
                    .into_iter()
                    .map(|worker| {
                        let count = tree.worker_block_count(&worker);
                        (worker, count)
                    })
                    .collect();
                let _ = resp.send(counts);
            }
        }
    }

    fn send(&self, cmd: IndexerCommand) -> Result<(), IndexerError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| IndexerError::IndexerOffline)
    }

    /// Enqueue a cache event. Returns as soon as the event is queued; FIFO
    /// ordering guarantees it is visible to any later lookup.
    pub fn apply_event(&self, event: RouterEvent) -> Result<(), IndexerError> {
        self.send(IndexerCommand::Apply(event))
    }

    /// Score every worker's overlap with the given block sequence.
    pub async fn find_matches(
        &self,
        sequence: Vec<BlockHash>,
    ) -> Result<OverlapScores, IndexerError> {
        let (resp, rx) = oneshot::channel();
        self.send(IndexerCommand::Match { sequence, resp })?;
        rx.await.map_err(|_| IndexerError::IndexerDroppedRequest)
    }

    /// Replace the router's view of one worker with its reported state.
    pub async fn sync_worker_state(
        &self,
        worker_id: WorkerId,
        cached_hashes: Vec<BlockHash>,
        sequences: Vec<Vec<BlockHash>>,
    ) -> Result<(), IndexerError> {
        let (resp, rx) = oneshot::channel();
        self.send(IndexerCommand::Sync {
            worker_id,
            cached_hashes,
            sequences,
            resp,
        })?;
        rx.await.map_err(|_| IndexerError::IndexerDroppedRequest)
    }

    /// Forget a worker entirely.
    pub fn remove_worker(&self, worker_id: WorkerId) -> Result<(), IndexerError> {
        self.send(IndexerCommand::RemoveWorker(worker_id))
    }

    /// Distinct cached-hash count per tracked worker.
    pub async fn block_counts(&self) -> Result<HashMap<WorkerId, usize>, IndexerError> {
        let (resp, rx) = oneshot::channel();
        self.send(IndexerCommand::BlockCounts { resp })?;
        rx.await.map_err(|_| IndexerError::IndexerDroppedRequest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(values: &[u64]) -> Vec<BlockHash> {
        values.iter().copied().map(BlockHash).collect()
    }

    #[tokio::test]
    async fn test_store_then_match() {
        let indexer = CacheIndexer::new(CancellationToken::new());

        indexer
            .apply_event(RouterEvent::stored("w1".into(), 0, hashes(&[1, 2])))
            .unwrap();

        // FIFO: the store enqueued above must be visible here
        let scores = indexer.find_matches(hashes(&[1, 2, 3])).await.unwrap();
        assert_eq!(scores.scores["w1"], 2);
        assert_eq!(scores.match_length(), 2);
    }

    #[tokio::test]
    async fn test_sync_and_counts() {
        let indexer = CacheIndexer::new(CancellationToken::new());

        indexer
            .sync_worker_state("w1".into(), hashes(&[1, 2, 3]), vec![hashes(&[1, 2, 3])])
            .await
            .unwrap();
        indexer
            .sync_worker_state("w2".into(), hashes(&[1]), vec![hashes(&[1])])
            .await
            .unwrap();

        let counts = indexer.block_counts().await.unwrap();
        assert_eq!(counts["w1"], 3);
        assert_eq!(counts["w2"], 1);

        indexer.remove_worker("w1".into()).unwrap();
        let counts = indexer.block_counts().await.unwrap();
        assert!(!counts.contains_key("w1"));
    }

    #[tokio::test]
    async fn test_cancellation_takes_indexer_offline() {
        let cancel = CancellationToken::new();
        let indexer = CacheIndexer::new(cancel.clone());
        cancel.cancel();

        // the thread drains on its own schedule; poll until offline
        for _ in 0..100 {
            if indexer.find_matches(vec![]).await.is_err() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("indexer still accepting requests after cancellation");
    }
}
