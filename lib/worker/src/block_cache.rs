// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity block cache with manual reference counting.
//!
//! Reference counts are tracked by hand rather than through `Arc` so the
//! cache mirrors what a real block manager reports: a block is evictable
//! exactly while its count is zero, and eviction order is decided by a
//! priority queue, not by drop order.
//!
//! The eviction queue tolerates stale entries: membership changes between
//! pushes and pops, so every popped entry is validated against the live
//! block before it is honored.
//!
//! Allocation never fails for a sequence that fits the configured capacity.
//! When every resident block is referenced the cache grows past capacity
//! instead; residency converges back under the cap as later allocations
//! find evictable victims.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use derive_getters::Getters;
use kvflow_core::protocols::BlockHash;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BlockCacheError {
    #[error("request needs {requested} blocks but cache capacity is {capacity}")]
    RequestTooLarge { requested: usize, capacity: usize },

    /// A block with live references surfaced at the head of the eviction
    /// queue. This cannot happen while the evictable flag is maintained;
    /// treat it as fatal corruption of the cache state.
    #[error("block {block_hash} nominated for eviction while still referenced")]
    ReferencedEviction { block_hash: BlockHash },
}

/// A cached block and its bookkeeping.
#[derive(Debug, Clone)]
pub struct Block {
    /// Number of live tasks depending on this block.
    ref_count: usize,
    /// True iff `ref_count == 0`.
    evictable: bool,
    /// Logical timestamp of the most recent acquisition or release.
    /// Advanced once per cache operation, so blocks released together share
    /// a timestamp and fall back to the index tie-break.
    last_used: u64,
    /// Position within the prompt that first produced the block. Fixed at
    /// first insertion.
    sequence_index: usize,
}

/// Min-queue key: oldest `last_used` first; among equals the block deepest
/// in its sequence goes first (later blocks are worth less as shared
/// prefixes); hash as the final disambiguator.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EvictEntry {
    last_used: u64,
    sequence_index: usize,
    block_hash: BlockHash,
}

impl Ord for EvictEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.last_used
            .cmp(&other.last_used)
            .then_with(|| other.sequence_index.cmp(&self.sequence_index))
            .then_with(|| self.block_hash.cmp(&other.block_hash))
    }
}

impl PartialOrd for EvictEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of one allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Length of the longest leading run of the sequence already resident
    /// before the call.
    pub num_cached_prefix: usize,
    /// Blocks newly inserted by the call.
    pub num_new: usize,
    /// Blocks evicted to make room, in eviction order.
    pub evicted: Vec<BlockHash>,
}

#[derive(Getters)]
pub struct BlockCache {
    #[getter(copy)]
    capacity: usize,

    #[getter(skip)]
    blocks: HashMap<BlockHash, Block>,

    #[getter(skip)]
    evictable_queue: BinaryHeap<Reverse<EvictEntry>>,

    /// Monotonic operation clock backing `last_used`.
    #[getter(skip)]
    clock: u64,

    /// Block sequences admitted since startup that may still have resident
    /// blocks; used to transmit ordering to the router at sync time.
    #[getter(skip)]
    sequences: Vec<Vec<BlockHash>>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            blocks: HashMap::new(),
            evictable_queue: BinaryHeap::new(),
            clock: 0,
            sequences: Vec::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, block_hash: &BlockHash) -> bool {
        self.blocks.contains_key(block_hash)
    }

    /// Length of the longest leading run of `sequence` currently resident.
    pub fn cached_prefix_len(&self, sequence: &[BlockHash]) -> usize {
        sequence
            .iter()
            .take_while(|hash| self.blocks.contains_key(hash))
            .count()
    }

    /// Acquire every block of `sequence`, inserting (and evicting) as
    /// needed. Each hash acquired gains one reference, to be returned by a
    /// matching [`release`](Self::release). Never fails for a sequence of
    /// at most `capacity` blocks: with no evictable victim the cache
    /// overflows instead.
    pub fn allocate(&mut self, sequence: &[BlockHash]) -> Result<Allocation, BlockCacheError> {
        if sequence.len() > self.capacity {
            return Err(BlockCacheError::RequestTooLarge {
                requested: sequence.len(),
                capacity: self.capacity,
            });
        }

        let now = self.tick();
        let num_cached_prefix = self.cached_prefix_len(sequence);
        let mut num_new = 0;
        let mut evicted = Vec::new();

        for (index, block_hash) in sequence.iter().enumerate() {
            if let Some(block) = self.blocks.get_mut(block_hash) {
                block.ref_count += 1;
                block.evictable = false;
                block.last_used = now;
                // any queue entry for this block is now stale and will be
                // discarded on pop
                continue;
            }

            while self.blocks.len() >= self.capacity {
                match self.evict_one()? {
                    Some(victim) => {
                        tracing::debug!(block_hash = %victim, "evicted block to make room");
                        evicted.push(victim);
                    }
                    None => {
                        // every resident block is referenced; admit over
                        // capacity and let later allocations evict back down
                        tracing::debug!(
                            resident = self.blocks.len(),
                            capacity = self.capacity,
                            "no evictable block; exceeding capacity"
                        );
                        break;
                    }
                }
            }

            self.blocks.insert(
                *block_hash,
                Block {
                    ref_count: 1,
                    evictable: false,
                    last_used: now,
                    sequence_index: index,
                },
            );
            num_new += 1;
        }

        if !self.sequences.iter().any(|seq| seq.as_slice() == sequence) {
            self.sequences.push(sequence.to_vec());
        }

        Ok(Allocation {
            num_cached_prefix,
            num_new,
            evicted,
        })
    }

    /// Return the references taken by a previous allocate of the same
    /// sequence. Blocks whose count reaches zero become evictable at a
    /// shared timestamp.
    pub fn release(&mut self, sequence: &[BlockHash]) {
        let now = self.tick();
        for block_hash in sequence {
            let Some(block) = self.blocks.get_mut(block_hash) else {
                tracing::warn!(block_hash = %block_hash, "release of non-resident block");
                continue;
            };
            if block.ref_count == 0 {
                tracing::warn!(block_hash = %block_hash, "release of unreferenced block");
                continue;
            }
            block.ref_count -= 1;
            if block.ref_count == 0 {
                block.evictable = true;
                block.last_used = now;
                self.evictable_queue.push(Reverse(EvictEntry {
                    last_used: now,
                    sequence_index: block.sequence_index,
                    block_hash: *block_hash,
                }));
            }
        }
    }

    /// Pop the oldest valid evictable block and drop it from the cache.
    /// Returns `Ok(None)` when every resident block is referenced.
    fn evict_one(&mut self) -> Result<Option<BlockHash>, BlockCacheError> {
        while let Some(Reverse(entry)) = self.evictable_queue.pop() {
            let Some(block) = self.blocks.get(&entry.block_hash) else {
                continue; // already evicted
            };
            if !block.evictable || block.last_used != entry.last_used {
                continue; // reacquired since this entry was pushed
            }
            if block.ref_count > 0 {
                return Err(BlockCacheError::ReferencedEviction {
                    block_hash: entry.block_hash,
                });
            }
            self.blocks.remove(&entry.block_hash);
            return Ok(Some(entry.block_hash));
        }
        Ok(None)
    }

    /// Everything currently resident, for anti-entropy sync.
    pub fn cached_hashes(&self) -> Vec<BlockHash> {
        self.blocks.keys().copied().collect()
    }

    /// Ordered resident prefixes of the sequences seen so far, for trie
    /// reconstruction on the router. Sequences with no resident head are
    /// forgotten.
    pub fn resident_sequences(&mut self) -> Vec<Vec<BlockHash>> {
        let blocks = &self.blocks;
        self.sequences
            .retain(|seq| seq.first().is_some_and(|head| blocks.contains_key(head)));
        self.sequences
            .iter()
            .map(|seq| {
                seq.iter()
                    .take_while(|hash| self.blocks.contains_key(hash))
                    .copied()
                    .collect()
            })
            .collect()
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for (hash, block) in &self.blocks {
            assert_eq!(
                block.evictable,
                block.ref_count == 0,
                "block {hash}: evictable flag out of sync with ref_count"
            );
        }
    }
}
