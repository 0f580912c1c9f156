// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic prompt-to-block hashing.
//!
//! The real tokenizer lives outside this system; the contract the router and
//! workers rely on is only "same prompt, same ordered block-hash sequence,
//! on any host". The stand-in here splits on whitespace and digests each
//! token, which is stable across platforms and cheap enough to run on both
//! sides of the wire.

use crate::protocols::{BlockHash, compute_block_hash, compute_hash};

/// Number of tokens cached as one block unless configured otherwise.
pub const DEFAULT_BLOCK_SIZE: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TokenizeError {
    #[error("prompt produced no tokens")]
    EmptyPrompt,

    #[error("block size must be non-zero")]
    ZeroBlockSize,
}

/// A prompt reduced to its cacheable form.
#[derive(Debug, Clone, PartialEq)]
pub struct HashedPrompt {
    /// One hash per *full* block of tokens, in prompt order. A trailing
    /// partial block is not cacheable and carries no hash.
    pub block_hashes: Vec<BlockHash>,
    /// Total token count, including any trailing partial block.
    pub total_tokens: usize,
}

/// Tokenizer stand-in: whitespace-split tokens mapped to stable ids.
pub fn tokenize(prompt: &str) -> Vec<u32> {
    prompt
        .split_whitespace()
        .map(|word| compute_hash(word.as_bytes()) as u32)
        .collect()
}

/// Compute block hashes for a token sequence. Only full blocks are hashed;
/// trailing tokens that do not fill a block are dropped.
pub fn compute_block_hashes_for_seq(tokens: &[u32], block_size: usize) -> Vec<BlockHash> {
    tokens
        .chunks_exact(block_size)
        .map(|chunk| {
            let bytes: Vec<u8> = chunk.iter().flat_map(|&tok| tok.to_le_bytes()).collect();
            compute_block_hash(&bytes)
        })
        .collect()
}

/// Split a prompt into an ordered sequence of full-block hashes plus the
/// total token count.
pub fn hash_prompt(prompt: &str, block_size: usize) -> Result<HashedPrompt, TokenizeError> {
    if block_size == 0 {
        return Err(TokenizeError::ZeroBlockSize);
    }
    let tokens = tokenize(prompt);
    if tokens.is_empty() {
        return Err(TokenizeError::EmptyPrompt);
    }
    Ok(HashedPrompt {
        block_hashes: compute_block_hashes_for_seq(&tokens, block_size),
        total_tokens: tokens.len(),
    })
}
