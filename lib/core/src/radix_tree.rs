// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prefix trie over block hashes - the router's Global Cache Map.
//!
//! Each node corresponds to one block hash at one position and carries the
//! set of workers whose cached sequence reaches at least that node. A
//! per-worker reverse index maps every block hash to the trie nodes holding
//! it, which makes eviction updates O(1) per affected node and full-state
//! sync O(worker's block count) instead of O(total hashes).

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::{Rc, Weak},
};

use crate::protocols::{BlockHash, CacheEventData, OverlapScores, RouterEvent, WorkerId};

/// A shared reference to a [`TrieBlock`].
type SharedBlock = Rc<RefCell<TrieBlock>>;

/// A node in the prefix trie.
#[derive(Debug)]
struct TrieBlock {
    /// The block hash this node represents (None for the root).
    block_hash: Option<BlockHash>,
    /// Child nodes, keyed by the next block hash in sequence.
    children: HashMap<BlockHash, SharedBlock>,
    /// Workers whose cached sequence reaches at least this node.
    workers: HashSet<WorkerId>,
    /// Back-link used to prune empty nodes out of the tree.
    parent: Weak<RefCell<TrieBlock>>,
}

impl TrieBlock {
    fn root() -> Self {
        Self {
            block_hash: None,
            children: HashMap::new(),
            workers: HashSet::new(),
            parent: Weak::new(),
        }
    }

    fn child_of(parent: &SharedBlock, block_hash: BlockHash) -> Self {
        Self {
            block_hash: Some(block_hash),
            children: HashMap::new(),
            workers: HashSet::new(),
            parent: Rc::downgrade(parent),
        }
    }
}

/// Reverse-index entry for one (worker, hash) pair. The same content hash
/// can legitimately appear at several positions of a prompt, so one hash may
/// map to several trie nodes. An empty node list records set-membership
/// only: the hash was reported without enough ordering to anchor it in the
/// trie, so it participates in removals and sync but not in prefix matching.
type LookupNodes = Vec<SharedBlock>;

pub struct RadixTree {
    /// Root of the prefix tree; holds no hash and no workers.
    root: SharedBlock,

    /// Per-worker reverse index: block hash -> trie nodes holding it.
    lookup: HashMap<WorkerId, HashMap<BlockHash, LookupNodes>>,
}

impl Default for RadixTree {
    fn default() -> Self {
        Self::new()
    }
}

// Dropping trie blocks can cascade deeply enough to overflow the stack on
// long prompts. Free them iteratively instead.
impl Drop for RadixTree {
    fn drop(&mut self) {
        let mut stack: Vec<SharedBlock> = Vec::new();
        {
            let mut root = self.root.borrow_mut();
            stack.extend(root.children.drain().map(|(_, child)| child));
        }
        for (_, worker_blocks) in self.lookup.drain() {
            for (_, nodes) in worker_blocks {
                stack.extend(nodes);
            }
        }
        while let Some(block) = stack.pop() {
            match Rc::try_unwrap(block) {
                Ok(cell) => {
                    let mut inner: TrieBlock = cell.into_inner();
                    stack.extend(inner.children.drain().map(|(_, child)| child));
                }
                Err(rc) => drop(rc),
            }
        }
    }
}

impl RadixTree {
    pub fn new() -> Self {
        Self {
            root: Rc::new(RefCell::new(TrieBlock::root())),
            lookup: HashMap::new(),
        }
    }

    /// Walk the trie for the given sequence and score every worker by the
    /// number of leading blocks it holds. The walk stops at the first block
    /// with no matching child; the longest prefix over all workers is the
    /// maximum score.
    pub fn find_matches(&self, sequence: &[BlockHash]) -> OverlapScores {
        let mut scores = OverlapScores::new();
        let mut current = self.root.clone();

        for block_hash in sequence {
            let next = {
                let current_ref = current.borrow();
                current_ref.children.get(block_hash).cloned()
            };
            let Some(block) = next else {
                break;
            };
            scores.update_scores(block.borrow().workers.iter());
            current = block;
        }

        tracing::trace!("RadixTree::find_matches: final scores={:?}", scores.scores);
        scores
    }

    /// Apply a worker cache event to the trie and reverse index.
    ///
    /// Removals for unknown blocks are a no-op so that eviction reports and
    /// syncs can arrive in any order and be applied more than once.
    pub fn apply_event(&mut self, event: RouterEvent) {
        let RouterEvent { worker_id, event } = event;
        tracing::trace!(
            worker_id = %worker_id,
            event_id = event.event_id,
            "RadixTree::apply_event: {:?}",
            event.data
        );

        match event.data {
            CacheEventData::Stored(stored) => self.store_sequence(&worker_id, &stored.sequence),
            CacheEventData::Removed(removed) => {
                for block_hash in removed.block_hashes {
                    self.remove_block(&worker_id, block_hash);
                }
            }
            CacheEventData::Cleared => self.clear_all_blocks(&worker_id),
        }
    }

    /// Insert or extend the path for `sequence`, adding the worker to every
    /// node touched.
    fn store_sequence(&mut self, worker_id: &WorkerId, sequence: &[BlockHash]) {
        let worker_lookup = self.lookup.entry(worker_id.clone()).or_default();

        let mut current = self.root.clone();
        for block_hash in sequence {
            let child = {
                let mut current_mut = current.borrow_mut();
                match current_mut.children.get(block_hash) {
                    Some(block) => block.clone(),
                    None => {
                        let new_block =
                            Rc::new(RefCell::new(TrieBlock::child_of(&current, *block_hash)));
                        current_mut.children.insert(*block_hash, new_block.clone());
                        new_block
                    }
                }
            };

            child.borrow_mut().workers.insert(worker_id.clone());

            let nodes = worker_lookup.entry(*block_hash).or_default();
            if !nodes.iter().any(|node| Rc::ptr_eq(node, &child)) {
                nodes.push(child.clone());
            }

            current = child;
        }
    }

    /// Remove the worker from every trie node holding `block_hash`, pruning
    /// nodes whose worker set empties and which have no children.
    fn remove_block(&mut self, worker_id: &WorkerId, block_hash: BlockHash) {
        let Some(worker_lookup) = self.lookup.get_mut(worker_id) else {
            tracing::trace!(worker_id = %worker_id, %block_hash, "remove for unknown worker; ignoring");
            return;
        };
        let Some(nodes) = worker_lookup.remove(&block_hash) else {
            tracing::trace!(worker_id = %worker_id, %block_hash, "remove for absent block; ignoring");
            return;
        };
        for node in nodes {
            node.borrow_mut().workers.remove(worker_id);
            Self::prune_upward(node);
        }
    }

    /// Remove `node` from its parent if it carries no workers and no
    /// children, repeating up the ancestor chain.
    fn prune_upward(mut node: SharedBlock) {
        loop {
            let (parent, block_hash) = {
                let node_ref = node.borrow();
                if !node_ref.workers.is_empty() || !node_ref.children.is_empty() {
                    return;
                }
                let Some(block_hash) = node_ref.block_hash else {
                    return; // root
                };
                let Some(parent) = node_ref.parent.upgrade() else {
                    return; // already detached
                };
                (parent, block_hash)
            };

            {
                let mut parent_mut = parent.borrow_mut();
                // The same hash may have been re-stored under a fresh node;
                // only unlink if the child is still this node.
                match parent_mut.children.get(&block_hash) {
                    Some(child) if Rc::ptr_eq(child, &node) => {
                        parent_mut.children.remove(&block_hash);
                    }
                    _ => return,
                }
            }

            node = parent;
        }
    }

    fn remove_or_clear_worker_blocks(&mut self, worker_id: &WorkerId, keep_worker: bool) {
        let Some(worker_blocks) = self.lookup.remove(worker_id) else {
            return;
        };
        for (_, nodes) in worker_blocks {
            for node in nodes {
                node.borrow_mut().workers.remove(worker_id);
                Self::prune_upward(node);
            }
        }
        if keep_worker {
            self.lookup.insert(worker_id.clone(), HashMap::new());
        }
    }

    /// Drop every block attributed to the worker but keep the worker known.
    pub fn clear_all_blocks(&mut self, worker_id: &WorkerId) {
        self.remove_or_clear_worker_blocks(worker_id, true);
    }

    /// Forget the worker entirely (operator removal or staleness timeout).
    pub fn remove_worker(&mut self, worker_id: &WorkerId) {
        self.remove_or_clear_worker_blocks(worker_id, false);
    }

    /// Replace the router's belief about a worker's cache with the
    /// authoritative set it reported.
    ///
    /// Ordered `sequences` rebuild trie paths; hashes reported only as set
    /// members are kept in the reverse index without a trie anchor, which
    /// degrades them to membership bookkeeping (they still participate in
    /// removals and future syncs). Applying the same report twice is a
    /// no-op after the first.
    pub fn sync_worker_state(
        &mut self,
        worker_id: &WorkerId,
        cached_hashes: &HashSet<BlockHash>,
        sequences: &[Vec<BlockHash>],
    ) {
        let stale: Vec<BlockHash> = self
            .lookup
            .get(worker_id)
            .map(|blocks| {
                blocks
                    .keys()
                    .filter(|hash| !cached_hashes.contains(hash))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for block_hash in stale {
            self.remove_block(worker_id, block_hash);
        }

        for sequence in sequences {
            // A sequence is only usable up to its first non-resident block;
            // anything past that cannot anchor a prefix match.
            let resident: Vec<BlockHash> = sequence
                .iter()
                .take_while(|hash| cached_hashes.contains(hash))
                .copied()
                .collect();
            if !resident.is_empty() {
                self.store_sequence(worker_id, &resident);
            }
        }

        let worker_lookup = self.lookup.entry(worker_id.clone()).or_default();
        for block_hash in cached_hashes {
            worker_lookup.entry(*block_hash).or_default();
        }
    }

    /// All workers currently tracked, sorted.
    pub fn get_workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self.lookup.keys().cloned().collect();
        workers.sort_unstable();
        workers
    }

    /// Number of distinct block hashes attributed to the worker.
    pub fn worker_block_count(&self, worker_id: &WorkerId) -> usize {
        self.lookup.get(worker_id).map_or(0, |blocks| blocks.len())
    }

    /// Total reverse-index entries across all workers.
    pub fn current_size(&self) -> usize {
        self.lookup.values().map(|blocks| blocks.len()).sum()
    }
}
