// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! kvflow core - wire protocols and the global cache map.
//!
//! This crate provides the shared vocabulary of the router and its workers
//! (block hashes, cache events, report payloads), the deterministic
//! prompt-to-block hashing, and the router-side prefix trie used for
//! cache-aware worker selection.

pub mod indexer;
pub mod protocols;
pub mod radix_tree;
pub mod tokenize;

// Re-export key types for convenience
pub use indexer::{CacheIndexer, IndexerError};
pub use protocols::{BlockHash, CacheEventData, OverlapScores, RouterEvent, WorkerId};
pub use tokenize::{HashedPrompt, hash_prompt};
