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

//! PC/SC backed MIFARE Classic card.
//!
//! Talks to the reader with the contactless storage-card pseudo-APDUs
//! (PC/SC part 3): load key, general authenticate, read binary, update
//! binary. Authentication is per sector with Key A and is re-done lazily
//! whenever a block in a different sector is touched.

use crate::device::BlockDevice;
use crate::{CardType, BLOCK_SIZE};
use anyhow::{anyhow, Context as _, Result};
use pcsc::{Card, Context, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};
use std::ffi::CString;
use std::time::{Duration, Instant};

const SW_OK: [u8; 2] = [0x90, 0x00];
/// NXP RID inside a PC/SC part 3 ATR; the card name bytes follow it.
const PCSC_RID: [u8; 5] = [0xA0, 0x00, 0x00, 0x03, 0x06];

pub struct PcscCard {
    card: Card,
    card_type: CardType,
    key_a: [u8; 6],
    authed_sector: Option<usize>,
    verbose: bool,
}

impl PcscCard {
    /// Connect to the first reader (or the first one whose name contains
    /// `reader_filter`) and poll until a card shows up or `wait` elapses.
    pub fn connect(
        reader_filter: Option<&str>,
        key_a: [u8; 6],
        wait: Duration,
        verbose: bool,
    ) -> Result<Self> {
        let ctx = Context::establish(Scope::User).context("Failed to establish PC/SC context")?;

        let mut readers_buf = [0; 2048];
        let reader = ctx
            .list_readers(&mut readers_buf)
            .context("Failed to list PC/SC readers")?
            .find(|r| match reader_filter {
                Some(filter) => r.to_string_lossy().contains(filter),
                None => true,
            })
            .ok_or_else(|| anyhow!("No matching PC/SC reader. Is the reader plugged in?"))?;
        let reader = CString::from(reader);

        if verbose {
            println!("Using reader: {}", reader.to_string_lossy());
        }

        let card = Self::wait_for_card(&ctx, &reader, wait)?;
        let card_type = Self::detect_card_type(&card, verbose)?;

        let mut this = PcscCard {
            card,
            card_type,
            key_a,
            authed_sector: None,
            verbose,
        };
        this.load_key()?;

        if verbose {
            println!(
                "Card: {} ({} blocks), UID {}",
                card_type.label(),
                card_type.block_count(),
                hex::encode(this.uid()?)
            );
        }
        Ok(this)
    }

    fn wait_for_card(ctx: &Context, reader: &CString, wait: Duration) -> Result<Card> {
        let started = Instant::now();
        let mut announced = false;
        loop {
            match ctx.connect(reader, ShareMode::Shared, Protocols::ANY) {
                Ok(card) => return Ok(card),
                Err(pcsc::Error::NoSmartcard) | Err(pcsc::Error::RemovedCard) => {
                    if started.elapsed() >= wait {
                        return Err(anyhow!(
                            "No card on the reader after {:.0}s",
                            wait.as_secs_f64()
                        ));
                    }
                    if !announced {
                        println!("Waiting for card (timeout: {}s)...", wait.as_secs());
                        announced = true;
                    }
                    std::thread::sleep(Duration::from_millis(500));
                }
                Err(e) => return Err(e).context("Failed to connect to card"),
            }
        }
    }

    /// Card type from the ATR card-name bytes: 0x0001 is Classic 1K,
    /// 0x0002 is Classic 4K. Unknown names fall back to 1K, the smaller
    /// geometry, so the codec never addresses blocks the card lacks.
    fn detect_card_type(card: &Card, verbose: bool) -> Result<CardType> {
        let status = card.status2_owned().context("Failed to read card status")?;
        let atr = status.atr();
        if verbose {
            println!("ATR: {}", hex::encode(atr));
        }

        let name = atr
            .windows(PCSC_RID.len())
            .position(|w| w == PCSC_RID)
            .and_then(|pos| {
                // RID, then the standard byte, then the two card-name bytes.
                let name_at = pos + PCSC_RID.len() + 1;
                atr.get(name_at..name_at + 2)
            });

        match name {
            Some([0x00, 0x01]) => Ok(CardType::Classic1k),
            Some([0x00, 0x02]) => Ok(CardType::Classic4k),
            other => {
                if verbose {
                    match other {
                        Some(bytes) => eprintln!(
                            "Unknown PC/SC card name {}, assuming MIFARE Classic 1K",
                            hex::encode(bytes)
                        ),
                        None => eprintln!("ATR carries no PC/SC card name, assuming MIFARE Classic 1K"),
                    }
                }
                Ok(CardType::Classic1k)
            }
        }
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn uid(&self) -> Result<Vec<u8>> {
        let resp = self.transmit(&[0xFF, 0xCA, 0x00, 0x00, 0x00])?;
        Ok(resp)
    }

    pub fn atr(&self) -> Result<Vec<u8>> {
        let status = self.card.status2_owned().context("Failed to read card status")?;
        Ok(status.atr().to_vec())
    }

    /// Transmit an APDU and strip the status word, failing on anything
    /// other than 90 00.
    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>> {
        let mut buf = [0; MAX_BUFFER_SIZE];
        let resp = self
            .card
            .transmit(apdu, &mut buf)
            .context("APDU transmit failed")?;
        if resp.len() < 2 {
            return Err(anyhow!("Short APDU response: {} bytes", resp.len()));
        }
        let (data, sw) = resp.split_at(resp.len() - 2);
        if sw != SW_OK {
            return Err(anyhow!(
                "Card refused command {:02x}{:02x}: SW={}",
                apdu[0],
                apdu[1],
                hex::encode(sw)
            ));
        }
        Ok(data.to_vec())
    }

    /// Load Key A into volatile key slot 0 on the reader.
    fn load_key(&mut self) -> Result<()> {
        let mut apdu = vec![0xFF, 0x82, 0x00, 0x00, 0x06];
        apdu.extend_from_slice(&self.key_a);
        self.transmit(&apdu).context("Failed to load MIFARE key")?;
        Ok(())
    }

    /// Authenticate the sector containing `block` with Key A, skipping the
    /// command if that sector is already open.
    fn authenticate(&mut self, block: usize) -> Result<()> {
        let sector = block / 4;
        if self.authed_sector == Some(sector) {
            return Ok(());
        }
        self.transmit(&[0xFF, 0x86, 0x00, 0x00, 0x05, 0x01, 0x00, block as u8, 0x60, 0x00])
            .with_context(|| format!("Key A authentication failed for block {block}"))?;
        self.authed_sector = Some(sector);
        Ok(())
    }
}

impl BlockDevice for PcscCard {
    fn block_count(&self) -> usize {
        self.card_type.block_count()
    }

    fn read_block(&mut self, block: usize) -> Result<[u8; BLOCK_SIZE]> {
        if block >= self.block_count() {
            return Err(anyhow!("block {} out of range (0-{})", block, self.block_count() - 1));
        }
        self.authenticate(block)?;
        let data = self
            .transmit(&[0xFF, 0xB0, 0x00, block as u8, BLOCK_SIZE as u8])
            .with_context(|| format!("Read of block {block} failed"))?;
        let data: [u8; BLOCK_SIZE] = data
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("Card returned {} bytes for block {}", data.len(), block))?;
        Ok(data)
    }

    fn write_block(&mut self, block: usize, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        if block >= self.block_count() {
            return Err(anyhow!("block {} out of range (0-{})", block, self.block_count() - 1));
        }
        if block == 0 {
            return Err(anyhow!("block 0 is read-only (manufacturer data)"));
        }
        self.authenticate(block)?;

        let mut apdu = vec![0xFF, 0xD6, 0x00, block as u8, BLOCK_SIZE as u8];
        apdu.extend_from_slice(data);
        self.transmit(&apdu)
            .with_context(|| format!("Write of block {block} failed"))?;

        if self.verbose {
            println!("Wrote block {block}");
        }
        Ok(())
    }
}
