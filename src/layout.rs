/*
 * tagvault - Encrypted text storage on MIFARE Classic cards
 * Copyright (C) 2025  tagvault developers
 *
 * Licensed under the EUPL v1.2
 *
 * This software is distributed under the terms of the European Union
 * Public Licence (EUPL) v1.2. You may obtain a copy of the licence at:
 * https://joinup.ec.europa.eu/collection/eupl/eupl-text-eupl-12
 */

//! Block addressing rules for MIFARE Classic cards.
//!
//! Block 0 holds the UID and manufacturer data and is never writable. Every
//! fourth block (3, 7, 11, ...) is a sector trailer holding the access keys
//! and must never carry payload. Everything else is fair game for storage.

use crate::{StoreError, BLOCK_SIZE, HEADER_SIZE};

/// True for block 0 and every sector trailer.
pub fn is_reserved(block: usize) -> bool {
    block == 0 || (block + 1) % 4 == 0
}

/// Plan the physical blocks for a record: `needed` non-reserved indices
/// starting at `start`, lowest index first, skipping trailers.
///
/// A trailer `start` silently advances to the next block; block 0 is
/// rejected outright. The plan is recomputed identically at read time by
/// replaying the same skip rule, so `start` is the only pointer a caller
/// has to remember.
pub fn plan_blocks(
    start: usize,
    needed: usize,
    block_count: usize,
) -> Result<Vec<usize>, StoreError> {
    if start == 0 || start >= block_count {
        return Err(StoreError::InvalidStart(start));
    }

    let mut plan = Vec::with_capacity(needed);
    let mut current = start;
    while plan.len() < needed && current < block_count {
        if is_reserved(current) {
            current += 1;
            continue;
        }
        plan.push(current);
        current += 1;
    }

    if plan.len() < needed {
        return Err(StoreError::CapacityExceeded {
            needed,
            found: plan.len(),
        });
    }
    Ok(plan)
}

/// First usable payload block at or after `start`.
pub fn first_payload_block(start: usize) -> usize {
    let mut block = start;
    while is_reserved(block) {
        block += 1;
    }
    block
}

/// Storage capacity report for records starting at `start`.
pub struct SpaceInfo {
    pub total_blocks: usize,
    pub available_blocks: usize,
    pub available_bytes: usize,
    pub usable_bytes: usize,
    pub estimated_max_chars: usize,
}

pub fn available_space(start: usize, block_count: usize) -> SpaceInfo {
    let available_blocks = (start.max(1)..block_count)
        .filter(|&b| !is_reserved(b))
        .count();
    let available_bytes = available_blocks * BLOCK_SIZE;
    let usable_bytes = available_bytes.saturating_sub(HEADER_SIZE);
    // Assume ~1.2 bytes per character of UTF-8 on average.
    let estimated_max_chars = usable_bytes * 8 / 10;

    SpaceInfo {
        total_blocks: block_count,
        available_blocks,
        available_bytes,
        usable_bytes,
        estimated_max_chars,
    }
}
