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

//! End-to-end record storage scenarios on the in-memory card.

use std::io::Write as _;
use tagvault::codec::{CardStore, HeaderFormat};
use tagvault::crypto;
use tagvault::device::{BlockDevice, CachedCard, MemoryCard};
use tagvault::layout::is_reserved;
use tagvault::{CardType, StoreError, BLOCK_SIZE, MAX_STRING_CHARS};

#[test]
fn hello_world_on_card_bytes() {
    let mut card = MemoryCard::new(CardType::Classic1k);
    {
        let mut store = CardStore::new(&mut card, false);
        store.write_string(4, "Hello, world!", MAX_STRING_CHARS).unwrap();
    }

    // Block 4: 4-byte header 00 00 00 0D, then the first twelve bytes of
    // text. Block 5: the trailing '!' and zero padding.
    let block4 = &card.raw()[4 * BLOCK_SIZE..5 * BLOCK_SIZE];
    assert_eq!(&block4[..4], &[0x00, 0x00, 0x00, 0x0D]);
    assert_eq!(&block4[4..], b"Hello, world");
    let block5 = &card.raw()[5 * BLOCK_SIZE..6 * BLOCK_SIZE];
    assert_eq!(block5[0], b'!');
    assert!(block5[1..].iter().all(|&b| b == 0));

    let mut store = CardStore::new(&mut card, false);
    assert_eq!(store.read_string(4, MAX_STRING_CHARS).unwrap().text, "Hello, world!");
}

#[test]
fn several_records_coexist() {
    let mut card = MemoryCard::new(CardType::Classic1k);
    let mut store = CardStore::new(&mut card, false);

    store.write_string(1, "first", MAX_STRING_CHARS).unwrap();
    store.write_string(8, "second record, a bit longer", MAX_STRING_CHARS).unwrap();
    store.write_string(20, "third", MAX_STRING_CHARS).unwrap();

    assert_eq!(store.read_string(1, MAX_STRING_CHARS).unwrap().text, "first");
    assert_eq!(
        store.read_string(8, MAX_STRING_CHARS).unwrap().text,
        "second record, a bit longer"
    );
    assert_eq!(store.read_string(20, MAX_STRING_CHARS).unwrap().text, "third");
}

#[test]
fn writes_never_touch_reserved_blocks() {
    let mut card = MemoryCard::new(CardType::Classic1k);
    {
        let mut store = CardStore::new(&mut card, false);
        let text = "spill across many sectors ".repeat(10);
        store.write_string(1, &text, MAX_STRING_CHARS).unwrap();
    }

    for block in 0..64 {
        if is_reserved(block) {
            let data = &card.raw()[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE];
            assert!(
                data.iter().all(|&b| b == 0),
                "reserved block {block} was written"
            );
        }
    }
}

#[test]
fn failed_allocation_leaves_card_untouched() {
    let mut card = MemoryCard::new(CardType::Classic1k);
    {
        let mut store = CardStore::new(&mut card, false);
        let text = "a".repeat(2000);
        assert!(matches!(
            store.write_string(1, &text, MAX_STRING_CHARS),
            Err(StoreError::CapacityExceeded { .. })
        ));
    }
    assert_eq!(card.writes, 0);
    assert!(card.raw().iter().all(|&b| b == 0));
}

#[test]
fn cached_re_read_is_idempotent_and_batched() {
    let mut cached = CachedCard::new(MemoryCard::new(CardType::Classic1k));
    let text = "stable under repeated reads";
    {
        let mut store = CardStore::new(&mut cached, false);
        store.write_string(4, text, MAX_STRING_CHARS).unwrap();
    }
    cached.invalidate();

    let first = {
        let mut store = CardStore::new(&mut cached, false);
        store.read_string(4, MAX_STRING_CHARS).unwrap().text
    };
    let second = {
        let mut store = CardStore::new(&mut cached, false);
        store.read_string(4, MAX_STRING_CHARS).unwrap().text
    };
    assert_eq!(first, text);
    assert_eq!(first, second);

    // Both walks were served by one snapshot fill.
    assert_eq!(cached.into_inner().reads, 64);
}

#[test]
fn stale_cache_misses_new_record_until_invalidated() {
    let mut cached = CachedCard::new(MemoryCard::new(CardType::Classic1k));
    // Prime the snapshot on the blank card.
    let _ = cached.read_block(4).unwrap();

    {
        let mut store = CardStore::new(&mut cached, false);
        store.write_string(4, "fresh data", MAX_STRING_CHARS).unwrap();
    }

    // Without invalidation the walk still sees the blank snapshot.
    {
        let mut store = CardStore::new(&mut cached, false);
        let outcome = store.read_string(4, MAX_STRING_CHARS).unwrap();
        assert_eq!(outcome.text, "");
    }

    cached.invalidate();
    let mut store = CardStore::new(&mut cached, false);
    assert_eq!(store.read_string(4, MAX_STRING_CHARS).unwrap().text, "fresh data");
}

#[test]
fn current_and_legacy_records_coexist() {
    let mut card = MemoryCard::new(CardType::Classic1k);
    {
        let mut store = CardStore::new(&mut card, false);
        store.write_string(1, "written today", MAX_STRING_CHARS).unwrap();
    }

    // A legacy record planted at block 8 the way old firmware wrote it.
    let legacy_text = "written years ago";
    let mut data = Vec::new();
    data.extend_from_slice(&(legacy_text.chars().count() as u16).to_be_bytes());
    data.extend_from_slice(legacy_text.as_bytes());
    while data.len() % BLOCK_SIZE != 0 {
        data.push(0);
    }
    let mut block = 8;
    for chunk in data.chunks_exact(BLOCK_SIZE) {
        while is_reserved(block) {
            block += 1;
        }
        card.set_block(block, chunk.try_into().unwrap());
        block += 1;
    }

    let mut store = CardStore::new(&mut card, false);
    let current = store.string_info(1).unwrap();
    assert_eq!(current.format, HeaderFormat::Current);
    let legacy = store.string_info(8).unwrap();
    assert_eq!(legacy.format, HeaderFormat::Legacy);

    assert_eq!(store.read_string(1, MAX_STRING_CHARS).unwrap().text, "written today");
    assert_eq!(store.read_string(8, MAX_STRING_CHARS).unwrap().text, legacy_text);
}

#[test]
fn sealed_message_round_trip_on_card() {
    let key = crypto::derive_key(b"enrolled fingerprint template bytes").unwrap();
    let message = "Launch code is 0000, obviously";
    let envelope = crypto::seal_message(&key, message).unwrap();

    let mut card = MemoryCard::new(CardType::Classic1k);
    let mut store = CardStore::new(&mut card, false);
    store.write_string(4, &envelope, MAX_STRING_CHARS).unwrap();

    let outcome = store.read_string(4, MAX_STRING_CHARS).unwrap();
    assert!(!outcome.fallback);
    assert_eq!(crypto::open_message(&key, &outcome.text).unwrap(), message);

    // The wrong finger must not open it.
    let wrong = crypto::derive_key(b"a different finger").unwrap();
    assert!(crypto::open_message(&wrong, &outcome.text).is_err());
}

#[test]
fn file_loaded_text_round_trips() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let text = "message drafted in an editor,\nwith a second line";
    file.write_all(text.as_bytes()).unwrap();

    let loaded = std::fs::read_to_string(file.path()).unwrap();
    let mut card = MemoryCard::new(CardType::Classic1k);
    let mut store = CardStore::new(&mut card, false);
    store.write_string(1, &loaded, MAX_STRING_CHARS).unwrap();
    assert_eq!(store.read_string(1, MAX_STRING_CHARS).unwrap().text, text);
}

#[test]
fn four_k_card_holds_long_records() {
    let mut card = MemoryCard::new(CardType::Classic4k);
    let text = "long-form payload that a 1K card cannot hold. ".repeat(60);
    assert!(text.chars().count() > 2000);

    let mut store = CardStore::new(&mut card, false);
    let report = store.write_long_string(1, &text).unwrap();
    assert_eq!(report.first_block, 4);
    let outcome = store
        .read_string(4, tagvault::MAX_LONG_STRING_CHARS)
        .unwrap();
    assert_eq!(outcome.text, text);
}
