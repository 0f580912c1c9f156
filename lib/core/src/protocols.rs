// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3;

/// Seed for XXH3 hashing, shared by router and workers so that both sides
/// derive identical block hashes from the same token run.
pub const XXH3_SEED: u64 = 1337;

/// Compute hash of data using XXH3 with the standard seed.
pub fn compute_hash(data: &[u8]) -> u64 {
    xxh3::xxh3_64_with_seed(data, XXH3_SEED)
}

/// Compute the hash of a single block's token bytes.
pub fn compute_block_hash(data: &[u8]) -> BlockHash {
    BlockHash(compute_hash(data))
}

/// A stable worker identifier, assigned by the operator or generated by the
/// worker on startup (e.g. `worker-4821`).
pub type WorkerId = String;

/// Digest identifying the token content of one fixed-size block.
///
/// Stored as a `u64` internally; on the wire it is an opaque 16-character
/// lowercase hex string so that every hash has uniform length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct BlockHash(pub u64);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for BlockHash {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for BlockHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(BlockHash)
    }
}

impl Serialize for BlockHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

// ------
// Cache events
// ------

/// A cache event on a specific worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterEvent {
    /// The worker whose cache changed.
    pub worker_id: WorkerId,
    /// The cache event associated with the worker.
    pub event: CacheEvent,
}

impl RouterEvent {
    pub fn new(worker_id: WorkerId, event: CacheEvent) -> Self {
        Self { worker_id, event }
    }

    /// Convenience constructor for a store event carrying a full sequence.
    pub fn stored(worker_id: WorkerId, event_id: u64, sequence: Vec<BlockHash>) -> Self {
        Self::new(
            worker_id,
            CacheEvent {
                event_id,
                data: CacheEventData::Stored(StoredSequence { sequence }),
            },
        )
    }

    /// Convenience constructor for a remove event.
    pub fn removed(worker_id: WorkerId, event_id: u64, block_hashes: Vec<BlockHash>) -> Self {
        Self::new(
            worker_id,
            CacheEvent {
                event_id,
                data: CacheEventData::Removed(RemovedBlocks { block_hashes }),
            },
        )
    }
}

/// A single cache event with an ID and associated data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEvent {
    /// Monotonic per-worker event identifier.
    pub event_id: u64,
    /// The data associated with the event.
    pub data: CacheEventData,
}

/// The data associated with a cache event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventData {
    /// A sequence of blocks, ordered from the prompt root, now resident on
    /// the worker.
    Stored(StoredSequence),
    /// Blocks evicted from the worker.
    Removed(RemovedBlocks),
    /// The worker dropped its entire cache (e.g. on restart).
    Cleared,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredSequence {
    pub sequence: Vec<BlockHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemovedBlocks {
    pub block_hashes: Vec<BlockHash>,
}

/// Per-worker overlap scores produced by a prefix-trie walk.
///
/// A worker's score is the number of leading blocks of the query sequence it
/// is believed to hold; the longest match over all workers is the maximum
/// score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlapScores {
    pub scores: HashMap<WorkerId, u32>,
}

impl OverlapScores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the scores with a set of workers seen at the current depth.
    pub fn update_scores<'a, I>(&mut self, workers: I)
    where
        I: IntoIterator<Item = &'a WorkerId>,
    {
        for worker in workers {
            *self.scores.entry(worker.clone()).or_insert(0) += 1;
        }
    }

    /// Depth of the longest matched prefix over all workers.
    pub fn match_length(&self) -> u32 {
        self.scores.values().copied().max().unwrap_or(0)
    }

    /// Workers holding the longest matched prefix, sorted by id so callers
    /// can rotate through ties deterministically.
    pub fn best_workers(&self) -> Vec<WorkerId> {
        let best = self.match_length();
        if best == 0 {
            return Vec::new();
        }
        let mut workers: Vec<WorkerId> = self
            .scores
            .iter()
            .filter(|&(_, &score)| score == best)
            .map(|(worker, _)| worker.clone())
            .collect();
        workers.sort_unstable();
        workers
    }
}

// ------
// Worker -> router reports
// ------

/// Periodic liveness and load report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    /// Sum of remaining estimated latency over the worker's active tasks, in
    /// milliseconds.
    pub current_load: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_url: Option<String>,
    /// Set after a fatal local invariant violation; the router excludes the
    /// worker from routing until it re-registers through a sync.
    #[serde(default)]
    pub unhealthy: bool,
}

/// Push-based eviction notification (fast path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionReport {
    pub worker_id: WorkerId,
    pub block_hash: BlockHash,
}

/// Periodic full-state anti-entropy report (slow path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub worker_id: WorkerId,
    /// Every block currently resident on the worker, evictable or not.
    pub cached_hashes: Vec<BlockHash>,
    /// Ordered block sequences still anchored at the prompt root, for trie
    /// reconstruction. Hashes not covered by any sequence degrade to
    /// set-membership matching on the router.
    #[serde(default)]
    pub sequences: Vec<Vec<BlockHash>>,
}

/// Generic acknowledgement for internal endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

// ------
// Client-facing completion types
// ------

fn default_max_tokens() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

/// Whether the routed prompt's leading blocks were already cached at the
/// chosen worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// The request body was forwarded to the chosen worker.
    Forwarded,
    /// Routing decision only; no worker round trip.
    Simulated,
}

/// The router's answer to a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub assigned_worker: WorkerId,
    pub status: DispatchStatus,
    pub block_hashes: Vec<BlockHash>,
    pub match_length: u32,
    pub cache_status: CacheStatus,
    /// Present in proxy mode: the worker's own completion report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerCompletion>,
}

/// A worker's report for one completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCompletion {
    pub worker_id: WorkerId,
    pub request_id: String,
    pub num_cached_blocks: usize,
    pub num_computed_blocks: usize,
    pub decode_tokens: usize,
    pub latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_wire_format() {
        let hash = BlockHash(0xdead_beef);
        let serialized = serde_json::to_string(&hash).unwrap();
        assert_eq!(serialized, "\"00000000deadbeef\"");

        let deserialized: BlockHash = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, hash);

        // uniform width regardless of value
        assert_eq!(BlockHash(0).to_string().len(), 16);
        assert_eq!(BlockHash(u64::MAX).to_string().len(), 16);
    }

    #[test]
    fn test_cache_status_wire_format() {
        assert_eq!(serde_json::to_string(&CacheStatus::Hit).unwrap(), "\"HIT\"");
        assert_eq!(
            serde_json::to_string(&CacheStatus::Miss).unwrap(),
            "\"MISS\""
        );
    }

    #[test]
    fn test_router_event_serialization() {
        let event = RouterEvent::stored("w1".to_string(), 7, vec![BlockHash(1), BlockHash(2)]);
        let serialized = serde_json::to_string(&event).unwrap();
        let deserialized: RouterEvent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, event);

        let event = RouterEvent::removed("w1".to_string(), 8, vec![BlockHash(1)]);
        let round_trip: RouterEvent =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(round_trip, event);
    }

    #[test]
    fn test_sync_report_sequences_default() {
        let json = r#"{"worker_id":"w1","cached_hashes":["0000000000000001"]}"#;
        let report: SyncReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.cached_hashes, vec![BlockHash(1)]);
        assert!(report.sequences.is_empty());
    }

    #[test]
    fn test_overlap_scores_best_workers() {
        let mut scores = OverlapScores::new();
        let w1 = "w1".to_string();
        let w2 = "w2".to_string();
        scores.update_scores([&w1, &w2]);
        scores.update_scores([&w2]);

        assert_eq!(scores.match_length(), 2);
        assert_eq!(scores.best_workers(), vec![w2.clone()]);

        scores.update_scores([&w1]);
        // both at 2 now; ties come back sorted
        assert_eq!(scores.best_workers(), vec![w1, w2]);
    }

    #[test]
    fn test_overlap_scores_empty() {
        let scores = OverlapScores::new();
        assert_eq!(scores.match_length(), 0);
        assert!(scores.best_workers().is_empty());
    }
}
