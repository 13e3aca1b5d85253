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

use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub mod card;
pub mod codec;
pub mod crypto;
pub mod device;
pub mod layout;

/// MIFARE Classic card variants this tool knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Classic1k,
    Classic4k,
}

impl CardType {
    pub fn block_count(self) -> usize {
        match self {
            CardType::Classic1k => 64,
            CardType::Classic4k => 256,
        }
    }

    pub fn size_bytes(self) -> usize {
        self.block_count() * BLOCK_SIZE
    }

    pub fn label(self) -> &'static str {
        match self {
            CardType::Classic1k => "MIFARE Classic 1K",
            CardType::Classic4k => "MIFARE Classic 4K",
        }
    }
}

#[derive(ZeroizeOnDrop)]
pub struct SecureKey {
    #[zeroize(drop)]
    pub key: Vec<u8>,
}

pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Failure taxonomy of the block store.
///
/// `WriteFailure` carries partial-progress counts: callers decide whether to
/// retry from scratch or abandon, the store never retries internally.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block {0} is not a valid start block")]
    InvalidStart(usize),
    #[error("string too long: {len} > {max} characters")]
    TooLong { len: usize, max: usize },
    #[error("not enough writable blocks: need {needed}, only {found} available")]
    CapacityExceeded { needed: usize, found: usize },
    #[error("write to block {block} failed after {written}/{planned} blocks: {reason}")]
    WriteFailure {
        block: usize,
        written: usize,
        planned: usize,
        reason: String,
    },
    #[error("no valid string header in block {0}")]
    NoHeaderFound(usize),
    #[error("read of block {block} failed: {reason}")]
    ReadFailure { block: usize, reason: String },
    #[error("timed out after {0:.1}s while reading string")]
    Timeout(f64),
}

pub const BLOCK_SIZE: usize = 16;
/// 4-byte big-endian character count, current record format.
pub const HEADER_SIZE: usize = 4;
/// 2-byte big-endian character count, written by old firmware. Read-only.
pub const LEGACY_HEADER_SIZE: usize = 2;
/// Old firmware never wrote records past ~900 characters; the sniffer uses
/// this as the acceptance bound for the 2-byte header.
pub const LEGACY_MAX_CHARS: usize = 1000;

pub const MAX_STRING_CHARS: usize = 3000;
pub const MAX_LONG_STRING_CHARS: usize = 10000;

pub const ENVELOPE_PREFIX: &str = "ENCRYPTED:";

pub const AES_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
pub const PBKDF2_ROUNDS: u32 = 100_000;

/// Factory-default MIFARE Key A.
pub const DEFAULT_MIFARE_KEY: [u8; 6] = [0xFF; 6];
