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

//! String records over 16-byte blocks.
//!
//! A record is a length header followed by the UTF-8 bytes of the string,
//! zero-padded to a block boundary. The header stores the **character**
//! count, not the byte count: UTF-8 is variable-width, so the reader
//! re-derives the byte length by decoding as it walks. Two header formats
//! exist on cards in the field: the current 4-byte big-endian one and a
//! legacy 2-byte one that is still accepted on read.

use crate::device::BlockDevice;
use crate::layout::{self, is_reserved};
use crate::{
    StoreError, BLOCK_SIZE, HEADER_SIZE, LEGACY_HEADER_SIZE, LEGACY_MAX_CHARS,
    MAX_LONG_STRING_CHARS,
};
use std::time::{Duration, Instant};

/// Wall-clock budget for a full decode walk.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    /// 4-byte big-endian character count.
    Current,
    /// 2-byte big-endian character count, written by old firmware.
    Legacy,
}

impl HeaderFormat {
    pub fn header_size(self) -> usize {
        match self {
            HeaderFormat::Current => HEADER_SIZE,
            HeaderFormat::Legacy => LEGACY_HEADER_SIZE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HeaderFormat::Current => "current (4-byte header)",
            HeaderFormat::Legacy => "legacy (2-byte header)",
        }
    }
}

/// Sniff which header format a start block carries.
///
/// Heuristic, and deliberately kept bit-for-bit compatible with cards
/// written by earlier versions: a 4-byte header is accepted when the value
/// is a plausible character count and byte 0 is zero, otherwise a small
/// 2-byte value is taken as the legacy format. Pathological payloads can
/// misclassify; that risk is inherited from the on-card format.
pub fn sniff_header(block: &[u8; BLOCK_SIZE], max_length: usize) -> Option<(HeaderFormat, usize)> {
    let l4 = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
    let l2 = u16::from_be_bytes([block[0], block[1]]) as usize;

    if block[0] == 0 && l4 > 0 && l4 <= max_length {
        Some((HeaderFormat::Current, l4))
    } else if l2 > 0 && l2 <= LEGACY_MAX_CHARS {
        Some((HeaderFormat::Legacy, l2))
    } else if l4 == 0 {
        // A zero length field is the empty record.
        Some((HeaderFormat::Current, 0))
    } else {
        None
    }
}

/// The physical writes for one record, in the exact order they must be
/// issued. Produced by [`encode`]; pure planning, no device I/O.
pub struct WritePlan {
    pub chunks: Vec<(usize, [u8; BLOCK_SIZE])>,
    pub char_count: usize,
    pub byte_count: usize,
}

impl WritePlan {
    pub fn blocks_needed(&self) -> usize {
        self.chunks.len()
    }

    pub fn first_block(&self) -> usize {
        self.chunks[0].0
    }

    pub fn last_block(&self) -> usize {
        self.chunks[self.chunks.len() - 1].0
    }
}

/// Turn a string into a write plan starting at `start`.
///
/// Pre-flight failures (`TooLong`, `InvalidStart`, `CapacityExceeded`) are
/// all detected here, before any device I/O is attempted.
pub fn encode(
    text: &str,
    start: usize,
    max_length: usize,
    block_count: usize,
) -> Result<WritePlan, StoreError> {
    let char_count = text.chars().count();
    if char_count > max_length {
        return Err(StoreError::TooLong {
            len: char_count,
            max: max_length,
        });
    }

    let mut data = Vec::with_capacity(HEADER_SIZE + text.len() + BLOCK_SIZE);
    data.extend_from_slice(&(char_count as u32).to_be_bytes());
    data.extend_from_slice(text.as_bytes());
    while data.len() % BLOCK_SIZE != 0 {
        data.push(0);
    }

    let blocks_needed = data.len() / BLOCK_SIZE;
    let blocks = layout::plan_blocks(start, blocks_needed, block_count)?;

    let chunks = blocks
        .into_iter()
        .zip(data.chunks_exact(BLOCK_SIZE))
        .map(|(block, chunk)| {
            let mut buf = [0u8; BLOCK_SIZE];
            buf.copy_from_slice(chunk);
            (block, buf)
        })
        .collect();

    Ok(WritePlan {
        chunks,
        char_count,
        byte_count: text.len(),
    })
}

/// Count the characters a permissive UTF-8 decode of `bytes` would yield,
/// without counting an incomplete multi-byte sequence at the tail. The tail
/// may be completed by the next block, so treating it as decoded would stop
/// the walk one block too early.
fn count_chars_permissive(bytes: &[u8]) -> usize {
    let mut count = 0;
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                count += s.chars().count();
                return count;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                count += std::str::from_utf8(&rest[..valid]).unwrap().chars().count();
                match e.error_len() {
                    // Invalid sequence decodes to one replacement character.
                    Some(len) => {
                        count += 1;
                        rest = &rest[valid + len..];
                    }
                    // Incomplete sequence at the tail: not counted.
                    None => return count,
                }
            }
        }
    }
}

/// Result of a decode walk.
///
/// `fallback` marks a record whose bytes needed lossy UTF-8 substitution;
/// the text is best-effort (nulls stripped) rather than authoritative.
pub struct ReadOutcome {
    pub text: String,
    pub fallback: bool,
    pub blocks_read: usize,
}

/// Metadata probe of a stored record, from the first block only.
///
/// `blocks_needed` and `estimated_end_block` come from an approximate UTF-8
/// expansion ratio, not a full walk, and may be off by a few blocks.
pub struct StringInfo {
    pub char_count: usize,
    pub format: HeaderFormat,
    pub blocks_needed: usize,
    pub start_block: usize,
    pub estimated_end_block: usize,
    pub preview: String,
}

/// Record store over a block device, in the card's native record format.
pub struct CardStore<'a, D: BlockDevice> {
    device: &'a mut D,
    pub verbose: bool,
}

impl<'a, D: BlockDevice> CardStore<'a, D> {
    pub fn new(device: &'a mut D, verbose: bool) -> Self {
        CardStore { device, verbose }
    }

    fn read_device_block(&mut self, block: usize) -> Result<[u8; BLOCK_SIZE], StoreError> {
        self.device
            .read_block(block)
            .map_err(|e| StoreError::ReadFailure {
                block,
                reason: e.to_string(),
            })
    }

    /// Encode `text` and write it block by block starting at `start`.
    ///
    /// Writes are issued in plan order and abort on the first failure; the
    /// resulting `WriteFailure` reports how many blocks made it to the card
    /// so the caller can decide between retry-from-scratch and abandon.
    pub fn write_string(
        &mut self,
        start: usize,
        text: &str,
        max_length: usize,
    ) -> Result<WriteReport, StoreError> {
        let plan = encode(text, start, max_length, self.device.block_count())?;
        let planned = plan.blocks_needed();

        if self.verbose {
            println!(
                "Writing string: {} characters ({} bytes), {} blocks from block {}",
                plan.char_count,
                plan.byte_count,
                planned,
                plan.first_block()
            );
        }

        for (i, (block, chunk)) in plan.chunks.iter().enumerate() {
            if self.verbose {
                println!("Writing chunk {}/{} to block {}...", i + 1, planned, block);
            }
            self.device
                .write_block(*block, chunk)
                .map_err(|e| StoreError::WriteFailure {
                    block: *block,
                    written: i,
                    planned,
                    reason: e.to_string(),
                })?;
        }

        Ok(WriteReport {
            first_block: plan.first_block(),
            last_block: plan.last_block(),
            blocks_written: planned,
            char_count: plan.char_count,
        })
    }

    /// Write a long record addressed by sector instead of block. Sector 0
    /// maps to block 1, everything else to the sector's first data block.
    pub fn write_long_string(&mut self, sector: usize, text: &str) -> Result<WriteReport, StoreError> {
        let start = if sector == 0 { 1 } else { sector * 4 };
        if self.verbose {
            println!("Writing long string from sector {} (block {})", sector, start);
        }
        self.write_string(start, text, MAX_LONG_STRING_CHARS)
    }

    /// Reconstruct the string stored at `start`, auto-detecting the header
    /// format.
    pub fn read_string(&mut self, start: usize, max_length: usize) -> Result<ReadOutcome, StoreError> {
        let started = Instant::now();
        let block_count = self.device.block_count();
        if start == 0 || start >= block_count {
            return Err(StoreError::InvalidStart(start));
        }

        let first = self.read_device_block(start)?;
        let (format, char_count) =
            sniff_header(&first, max_length).ok_or(StoreError::NoHeaderFound(start))?;

        if self.verbose {
            println!("Reading string with {}: {} characters", format.label(), char_count);
        }

        if char_count == 0 {
            return Ok(ReadOutcome {
                text: String::new(),
                fallback: false,
                blocks_read: 1,
            });
        }
        if char_count > max_length {
            return Err(StoreError::TooLong {
                len: char_count,
                max: max_length,
            });
        }

        let header_size = format.header_size();
        let mut raw = Vec::with_capacity((char_count + header_size).next_multiple_of(BLOCK_SIZE));
        raw.extend_from_slice(&first[header_size..]);

        // Safety ceiling: the walk never reads more than the worst-case
        // record size (4 bytes per character) plus one block, even when the
        // header lies about the length.
        let worst_case_bytes = header_size + char_count * 4;
        let max_blocks_to_read =
            (worst_case_bytes.div_ceil(BLOCK_SIZE) + 1).min(block_count - start);

        let mut chars_decoded = count_chars_permissive(&raw);
        let mut blocks_read = 1usize;
        let mut current = start + 1;

        while chars_decoded < char_count && current < block_count && blocks_read < max_blocks_to_read
        {
            if started.elapsed() > READ_TIMEOUT {
                return Err(StoreError::Timeout(started.elapsed().as_secs_f64()));
            }
            if is_reserved(current) {
                current += 1;
                continue;
            }

            // Note: an all-zero block is appended like any other while the
            // decoded character count is still short. Padding is only
            // padding once enough characters are in hand, and the loop
            // condition already ends the walk at that point.
            let block = self.read_device_block(current)?;
            raw.extend_from_slice(&block);
            blocks_read += 1;
            chars_decoded = count_chars_permissive(&raw);

            if self.verbose {
                println!(
                    "Block {}: copied {} bytes, now have {} characters ({} blocks read)",
                    current, BLOCK_SIZE, chars_decoded, blocks_read
                );
            }
            current += 1;
        }

        match std::str::from_utf8(&raw) {
            Ok(s) => Ok(ReadOutcome {
                text: s.chars().take(char_count).collect(),
                fallback: false,
                blocks_read,
            }),
            Err(_) => {
                // Best-effort recovery: permissive decode of whatever was
                // collected, nulls stripped. Flagged so callers can tell it
                // apart from a clean decode.
                let lossy = String::from_utf8_lossy(&raw);
                let text: String = lossy
                    .chars()
                    .filter(|&c| c != '\0')
                    .take(char_count)
                    .collect();
                if self.verbose {
                    println!("Record needed lossy decode, returning {} characters", text.chars().count());
                }
                Ok(ReadOutcome {
                    text,
                    fallback: true,
                    blocks_read,
                })
            }
        }
    }

    /// Probe the record at `start` without walking it: character count,
    /// header format, a rough block estimate and a short content preview.
    pub fn string_info(&mut self, start: usize) -> Result<StringInfo, StoreError> {
        let block_count = self.device.block_count();
        if start == 0 || start >= block_count {
            return Err(StoreError::InvalidStart(start));
        }

        let first = self.read_device_block(start)?;
        let (format, char_count) = sniff_header(&first, MAX_LONG_STRING_CHARS)
            .ok_or(StoreError::NoHeaderFound(start))?;

        let header_size = format.header_size();
        // Exact byte length needs the full walk; assume ~1.1 bytes per
        // character, which is close for mostly-ASCII text.
        let estimated_bytes = char_count + char_count / 10;
        let blocks_needed = (header_size + estimated_bytes).div_ceil(BLOCK_SIZE);
        // One trailer is skipped for every three data blocks.
        let estimated_end_block = start + blocks_needed + blocks_needed / 3;

        let preview_bytes = &first[header_size..];
        let preview: String = String::from_utf8_lossy(preview_bytes)
            .chars()
            .take_while(|&c| c != '\0')
            .collect();

        Ok(StringInfo {
            char_count,
            format,
            blocks_needed,
            start_block: start,
            estimated_end_block,
            preview,
        })
    }

    /// Capacity report for records starting at `start`.
    pub fn available_space(&self, start: usize) -> layout::SpaceInfo {
        layout::available_space(start, self.device.block_count())
    }

    /// Hex + ASCII view of the first `num_blocks` blocks, with reserved
    /// blocks annotated.
    pub fn format_card_display(&mut self, num_blocks: usize) -> Result<String, StoreError> {
        let block_count = self.device.block_count();
        let mut out = String::from("MIFARE Classic card contents:\n");
        out.push_str(&"=".repeat(50));
        out.push('\n');

        for block in 0..num_blocks.min(block_count) {
            let data = self.read_device_block(block)?;
            let hex_str = data
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            let ascii_str: String = data
                .iter()
                .map(|&b| if (32..=126).contains(&b) { b as char } else { '.' })
                .collect();
            let block_type = if block == 0 {
                " (UID/manufacturer)"
            } else if is_reserved(block) {
                " (trailer/keys)"
            } else {
                ""
            };
            out.push_str(&format!("Block {block:3}: {hex_str} | {ascii_str}{block_type}\n"));
        }
        Ok(out)
    }
}

/// Summary of a completed record write.
pub struct WriteReport {
    pub first_block: usize,
    pub last_block: usize,
    pub blocks_written: usize,
    pub char_count: usize,
}
