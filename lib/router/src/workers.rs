// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Live-worker table.
//!
//! Workers appear on their first heartbeat (or sync), carry the load they
//! last reported plus any speculative addend applied at dispatch time, and
//! disappear when the stale sweep notices their heartbeats stopped. A
//! heartbeat overwrites the load outright, which is what decays the
//! speculative inflation.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use kvflow_core::protocols::{Heartbeat, WorkerId};
use serde::Serialize;

#[derive(Debug, Clone)]
struct WorkerEntry {
    url: Option<String>,
    current_load: f64,
    last_heartbeat: Instant,
    healthy: bool,
}

/// Serializable view of one tracked worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub worker_url: Option<String>,
    pub current_load: f64,
    pub healthy: bool,
    pub last_heartbeat_secs_ago: f64,
}

#[derive(Default)]
pub struct WorkerTable {
    entries: DashMap<WorkerId, WorkerEntry>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a heartbeat; returns true if this registered a new worker.
    pub fn apply_heartbeat(&self, heartbeat: &Heartbeat) -> bool {
        let mut registered = false;
        let mut entry = self
            .entries
            .entry(heartbeat.worker_id.clone())
            .or_insert_with(|| {
                registered = true;
                WorkerEntry {
                    url: None,
                    current_load: 0.0,
                    last_heartbeat: Instant::now(),
                    healthy: true,
                }
            });
        // authoritative load replaces any speculative inflation
        entry.current_load = heartbeat.current_load;
        entry.last_heartbeat = Instant::now();
        entry.healthy = !heartbeat.unhealthy;
        if heartbeat.worker_url.is_some() {
            entry.url = heartbeat.worker_url.clone();
        }
        registered
    }

    /// Register (or heal) a worker seen through a sync report.
    pub fn mark_registered(&self, worker_id: &WorkerId) {
        let mut entry = self
            .entries
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerEntry {
                url: None,
                current_load: 0.0,
                last_heartbeat: Instant::now(),
                healthy: true,
            });
        entry.healthy = true;
    }

    /// Inflate a worker's load at dispatch time; the next heartbeat
    /// overwrites it.
    pub fn add_speculative_load(&self, worker_id: &WorkerId, addend: f64) {
        if let Some(mut entry) = self.entries.get_mut(worker_id) {
            entry.current_load += addend;
        }
    }

    /// Healthy workers with a fresh heartbeat, sorted by id so callers can
    /// rotate through them deterministically.
    pub fn live_workers(&self, stale_after: Duration) -> Vec<(WorkerId, f64)> {
        let now = Instant::now();
        let mut workers: Vec<(WorkerId, f64)> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.healthy && now.saturating_duration_since(entry.last_heartbeat) <= stale_after
            })
            .map(|entry| (entry.key().clone(), entry.current_load))
            .collect();
        workers.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        workers
    }

    pub fn worker_url(&self, worker_id: &WorkerId) -> Option<String> {
        self.entries.get(worker_id).and_then(|entry| entry.url.clone())
    }

    /// Drop workers whose heartbeat is older than the timeout; returns the
    /// removed ids.
    pub fn sweep_stale(&self, stale_after: Duration) -> Vec<WorkerId> {
        let now = Instant::now();
        let stale: Vec<WorkerId> = self
            .entries
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_heartbeat) > stale_after)
            .map(|entry| entry.key().clone())
            .collect();
        for worker_id in &stale {
            self.entries.remove(worker_id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<WorkerSnapshot> = self
            .entries
            .iter()
            .map(|entry| WorkerSnapshot {
                worker_id: entry.key().clone(),
                worker_url: entry.url.clone(),
                current_load: entry.current_load,
                healthy: entry.healthy,
                last_heartbeat_secs_ago: now
                    .saturating_duration_since(entry.last_heartbeat)
                    .as_secs_f64(),
            })
            .collect();
        snapshots.sort_unstable_by(|a, b| a.worker_id.cmp(&b.worker_id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(worker_id: &str, load: f64) -> Heartbeat {
        Heartbeat {
            worker_id: worker_id.to_string(),
            current_load: load,
            worker_url: Some(format!("http://{worker_id}:8081")),
            unhealthy: false,
        }
    }

    #[test]
    fn test_first_heartbeat_registers() {
        let table = WorkerTable::new();
        assert!(table.apply_heartbeat(&heartbeat("w1", 10.0)));
        assert!(!table.apply_heartbeat(&heartbeat("w1", 20.0)));
        assert_eq!(table.len(), 1);

        let live = table.live_workers(Duration::from_secs(10));
        assert_eq!(live, vec![("w1".to_string(), 20.0)]);
        assert_eq!(table.worker_url(&"w1".to_string()).unwrap(), "http://w1:8081");
    }

    #[test]
    fn test_heartbeat_decays_speculative_load() {
        let table = WorkerTable::new();
        table.apply_heartbeat(&heartbeat("w1", 0.0));
        table.add_speculative_load(&"w1".to_string(), 50.0);
        table.add_speculative_load(&"w1".to_string(), 50.0);
        assert_eq!(
            table.live_workers(Duration::from_secs(10))[0].1,
            100.0
        );

        // the authoritative report wins
        table.apply_heartbeat(&heartbeat("w1", 30.0));
        assert_eq!(table.live_workers(Duration::from_secs(10))[0].1, 30.0);
    }

    #[test]
    fn test_unhealthy_worker_excluded_until_reregistered() {
        let table = WorkerTable::new();
        table.apply_heartbeat(&Heartbeat {
            unhealthy: true,
            ..heartbeat("w1", 0.0)
        });
        assert!(table.live_workers(Duration::from_secs(10)).is_empty());
        assert_eq!(table.len(), 1);

        table.mark_registered(&"w1".to_string());
        assert_eq!(table.live_workers(Duration::from_secs(10)).len(), 1);
    }

    #[test]
    fn test_sweep_stale() {
        let table = WorkerTable::new();
        table.apply_heartbeat(&heartbeat("w1", 0.0));
        assert!(table.sweep_stale(Duration::from_secs(10)).is_empty());

        let removed = table.sweep_stale(Duration::ZERO);
        assert_eq!(removed, vec!["w1".to_string()]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_live_workers_sorted() {
        let table = WorkerTable::new();
        table.apply_heartbeat(&heartbeat("w3", 0.0));
        table.apply_heartbeat(&heartbeat("w1", 0.0));
        table.apply_heartbeat(&heartbeat("w2", 0.0));
        let ids: Vec<WorkerId> = table
            .live_workers(Duration::from_secs(10))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["w1", "w2", "w3"]);
    }
}
