// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Router background maintenance.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;

/// Periodically drop workers whose heartbeats stopped and purge their
/// entries from the cache map.
pub fn spawn_stale_sweeper(
    dispatcher: Arc<Dispatcher>,
    stale_after: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    // sweep a few times per timeout window so removal lag stays small
    let period = (stale_after / 4).max(Duration::from_millis(250));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            for worker_id in dispatcher.workers().sweep_stale(stale_after) {
                tracing::info!(worker_id = %worker_id, "worker timed out; removing from routing");
                if let Err(err) = dispatcher.indexer().remove_worker(worker_id) {
                    tracing::warn!("failed to purge timed-out worker from cache map: {err}");
                }
            }
        }
        tracing::debug!("stale-worker sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::workers::WorkerTable;
    use kvflow_core::indexer::CacheIndexer;
    use kvflow_core::protocols::Heartbeat;

    #[tokio::test]
    async fn test_sweeper_removes_silent_worker() {
        let config = RouterConfig::default();
        let workers = Arc::new(WorkerTable::new());
        workers.apply_heartbeat(&Heartbeat {
            worker_id: "w1".to_string(),
            current_load: 0.0,
            worker_url: None,
            unhealthy: false,
        });
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            CacheIndexer::new(CancellationToken::new()),
            workers.clone(),
        ));

        let cancel = CancellationToken::new();
        let handle = spawn_stale_sweeper(dispatcher, Duration::from_millis(50), cancel.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(workers.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
