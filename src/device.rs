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

//! Block device abstraction.
//!
//! The codec only ever talks to a [`BlockDevice`]: 16-byte blocks, blocking
//! reads and writes, a known block count. The PC/SC card in `card.rs` is the
//! real one; [`MemoryCard`] backs tests and the self-test.

use anyhow::{anyhow, Result};
use crate::{CardType, BLOCK_SIZE};

pub trait BlockDevice {
    fn block_count(&self) -> usize;
    fn read_block(&mut self, block: usize) -> Result<[u8; BLOCK_SIZE]>;
    fn write_block(&mut self, block: usize, data: &[u8; BLOCK_SIZE]) -> Result<()>;
}

/// In-memory MIFARE Classic stand-in.
pub struct MemoryCard {
    blocks: Vec<u8>,
    block_count: usize,
    pub reads: usize,
    pub writes: usize,
}

impl MemoryCard {
    pub fn new(card_type: CardType) -> Self {
        let block_count = card_type.block_count();
        MemoryCard {
            blocks: vec![0u8; block_count * BLOCK_SIZE],
            block_count,
            reads: 0,
            writes: 0,
        }
    }

    /// Fill a block directly, bypassing the counters. Used by tests to plant
    /// legacy-format records and garbage data.
    pub fn set_block(&mut self, block: usize, data: &[u8; BLOCK_SIZE]) {
        let start = block * BLOCK_SIZE;
        self.blocks[start..start + BLOCK_SIZE].copy_from_slice(data);
    }

    pub fn raw(&self) -> &[u8] {
        &self.blocks
    }
}

impl BlockDevice for MemoryCard {
    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, block: usize) -> Result<[u8; BLOCK_SIZE]> {
        if block >= self.block_count {
            return Err(anyhow!("block {} out of range (0-{})", block, self.block_count - 1));
        }
        self.reads += 1;
        let start = block * BLOCK_SIZE;
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&self.blocks[start..start + BLOCK_SIZE]);
        Ok(out)
    }

    fn write_block(&mut self, block: usize, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        if block >= self.block_count {
            return Err(anyhow!("block {} out of range (0-{})", block, self.block_count - 1));
        }
        if block == 0 {
            return Err(anyhow!("block 0 is read-only (manufacturer data)"));
        }
        self.writes += 1;
        self.set_block(block, data);
        Ok(())
    }
}

/// Whole-card read-through snapshot.
///
/// The first read pulls every block of the underlying device into one
/// snapshot and later reads are served from it, which turns the many
/// single-block reads of a decode walk into one physical transfer. There is
/// no implicit coherency: writes pass through and leave the snapshot stale
/// until the caller invalidates it. Invalidate after any write, and before
/// any read that must observe the latest card state.
pub struct CachedCard<D: BlockDevice> {
    inner: D,
    snapshot: Option<Vec<u8>>,
}

impl<D: BlockDevice> CachedCard<D> {
    pub fn new(inner: D) -> Self {
        CachedCard {
            inner,
            snapshot: None,
        }
    }

    pub fn invalidate(&mut self) {
        self.snapshot = None;
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn fill(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Ok(());
        }
        let count = self.inner.block_count();
        let mut data = Vec::with_capacity(count * BLOCK_SIZE);
        for block in 0..count {
            data.extend_from_slice(&self.inner.read_block(block)?);
        }
        self.snapshot = Some(data);
        Ok(())
    }
}

impl<D: BlockDevice> BlockDevice for CachedCard<D> {
    fn block_count(&self) -> usize {
        self.inner.block_count()
    }

    fn read_block(&mut self, block: usize) -> Result<[u8; BLOCK_SIZE]> {
        if block >= self.block_count() {
            return Err(anyhow!("block {} out of range", block));
        }
        self.fill()?;
        let snapshot = self.snapshot.as_ref().unwrap();
        let start = block * BLOCK_SIZE;
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&snapshot[start..start + BLOCK_SIZE]);
        Ok(out)
    }

    fn write_block(&mut self, block: usize, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.inner.write_block(block, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CardType;

    #[test]
    fn memory_card_round_trips_a_block() {
        let mut card = MemoryCard::new(CardType::Classic1k);
        let data = [0xAB; BLOCK_SIZE];
        card.write_block(5, &data).unwrap();
        assert_eq!(card.read_block(5).unwrap(), data);
    }

    #[test]
    fn memory_card_rejects_block_zero_writes() {
        let mut card = MemoryCard::new(CardType::Classic1k);
        assert!(card.write_block(0, &[0u8; BLOCK_SIZE]).is_err());
    }

    #[test]
    fn memory_card_rejects_out_of_range() {
        let mut card = MemoryCard::new(CardType::Classic1k);
        assert!(card.read_block(64).is_err());
        assert!(card.write_block(64, &[0u8; BLOCK_SIZE]).is_err());
    }

    #[test]
    fn cache_batches_physical_reads() {
        let mut cached = CachedCard::new(MemoryCard::new(CardType::Classic1k));
        cached.read_block(1).unwrap();
        cached.read_block(2).unwrap();
        cached.read_block(40).unwrap();
        // One snapshot fill, no per-block transfers afterwards.
        assert_eq!(cached.into_inner().reads, 64);
    }

    #[test]
    fn cache_is_stale_until_invalidated() {
        let mut cached = CachedCard::new(MemoryCard::new(CardType::Classic1k));
        assert_eq!(cached.read_block(4).unwrap(), [0u8; BLOCK_SIZE]);

        let data = [0x42; BLOCK_SIZE];
        cached.write_block(4, &data).unwrap();
        // Still serving the old snapshot.
        assert_eq!(cached.read_block(4).unwrap(), [0u8; BLOCK_SIZE]);

        cached.invalidate();
        assert_eq!(cached.read_block(4).unwrap(), data);
    }
}
