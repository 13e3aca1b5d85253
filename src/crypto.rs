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

//! Message sealing for card records.
//!
//! The key is derived from an opaque secret (a fingerprint template read
//! back from the sensor, or a passphrase) with PBKDF2-HMAC-SHA256, salted
//! with a digest of the secret itself so the same enrolled finger always
//! yields the same key. Messages are AES-256-CTR with a random nonce
//! prepended, and travel on the card inside a text envelope:
//!
//! `ENCRYPTED:<base64 ciphertext>:<original character count>`

use crate::{
    SecureKey, AES_KEY_SIZE, ENVELOPE_PREFIX, NONCE_SIZE, PBKDF2_ROUNDS, SALT_SIZE,
};
use aes::Aes256;
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::Hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Derive the symmetric key for a secret. Deterministic: the salt is the
/// truncated SHA-256 of the secret, so re-deriving from the same stored
/// template reproduces the key exactly.
pub fn derive_key(secret: &[u8]) -> Result<SecureKey> {
    if secret.is_empty() {
        return Err(anyhow!("Cannot derive a key from an empty secret"));
    }
    let salt = &Sha256::digest(secret)[..SALT_SIZE];

    let mut key = vec![0u8; AES_KEY_SIZE];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(secret, salt, PBKDF2_ROUNDS, &mut key)
        .expect("HMAC key length is valid");
    Ok(SecureKey { key })
}

/// Encrypt a message. Output is `nonce || ciphertext`.
pub fn encrypt(key: &SecureKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut out = Vec::with_capacity(NONCE_SIZE + plaintext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(plaintext);

    let mut cipher = Aes256Ctr::new_from_slices(&key.key, &nonce)
        .map_err(|e| anyhow!("Cipher init failed: {e}"))?;
    cipher.apply_keystream(&mut out[NONCE_SIZE..]);
    Ok(out)
}

/// Decrypt `nonce || ciphertext` produced by [`encrypt`].
pub fn decrypt(key: &SecureKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(anyhow!(
            "Encrypted data too short: {} bytes, need at least {}",
            data.len(),
            NONCE_SIZE
        ));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    let mut out = ciphertext.to_vec();

    let mut cipher = Aes256Ctr::new_from_slices(&key.key, nonce)
        .map_err(|e| anyhow!("Cipher init failed: {e}"))?;
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// Encrypt a message and wrap it in the card envelope.
pub fn seal_message(key: &SecureKey, message: &str) -> Result<String> {
    let encrypted = encrypt(key, message.as_bytes())?;
    Ok(format!(
        "{}{}:{}",
        ENVELOPE_PREFIX,
        BASE64.encode(&encrypted),
        message.chars().count()
    ))
}

/// Parse a card envelope and decrypt the message inside it.
///
/// The stored character count is checked against the decrypted text; a
/// mismatch means the record was truncated or the wrong finger unlocked it.
pub fn open_message(key: &SecureKey, envelope: &str) -> Result<String> {
    let rest = envelope
        .strip_prefix(ENVELOPE_PREFIX)
        .ok_or_else(|| anyhow!("Not an encrypted record (missing {} prefix)", ENVELOPE_PREFIX))?;

    // base64 never contains ':', so the last separator splits payload from
    // the character count.
    let (payload, count) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Malformed envelope: missing character count"))?;
    let expected_chars: usize = count
        .parse()
        .with_context(|| format!("Malformed envelope: bad character count '{count}'"))?;

    let encrypted = BASE64
        .decode(payload)
        .context("Malformed envelope: payload is not valid base64")?;
    let plaintext = decrypt(key, &encrypted)?;
    let message = String::from_utf8(plaintext)
        .map_err(|_| anyhow!("Decryption produced invalid UTF-8 (wrong key?)"))?;

    if message.chars().count() != expected_chars {
        return Err(anyhow!(
            "Decrypted length mismatch: envelope says {} characters, got {} (wrong key?)",
            expected_chars,
            message.chars().count()
        ));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant_time_compare;

    const TEMPLATE: &[u8] = &[0x5A; 512];

    #[test]
    fn key_derivation_is_deterministic() {
        let a = derive_key(TEMPLATE).unwrap();
        let b = derive_key(TEMPLATE).unwrap();
        assert!(constant_time_compare(&a.key, &b.key));
        assert_eq!(a.key.len(), AES_KEY_SIZE);
    }

    #[test]
    fn different_secrets_yield_different_keys() {
        let a = derive_key(b"left index finger").unwrap();
        let b = derive_key(b"right index finger").unwrap();
        assert!(!constant_time_compare(&a.key, &b.key));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(derive_key(b"").is_err());
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = derive_key(TEMPLATE).unwrap();
        let encrypted = encrypt(&key, b"attack at dawn").unwrap();
        assert_eq!(encrypted.len(), NONCE_SIZE + 14);
        let decrypted = decrypt(&key, &encrypted).unwrap();
        assert_eq!(decrypted, b"attack at dawn");
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let key = derive_key(TEMPLATE).unwrap();
        let a = encrypt(&key, b"same message").unwrap();
        let b = encrypt(&key, b"same message").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_truncated_input() {
        let key = derive_key(TEMPLATE).unwrap();
        assert!(decrypt(&key, &[0u8; NONCE_SIZE - 1]).is_err());
    }

    #[test]
    fn envelope_round_trip() {
        let key = derive_key(TEMPLATE).unwrap();
        let sealed = seal_message(&key, "Meet me at the usual place").unwrap();
        assert!(sealed.starts_with(ENVELOPE_PREFIX));
        assert!(sealed.ends_with(":26"));
        assert_eq!(open_message(&key, &sealed).unwrap(), "Meet me at the usual place");
    }

    #[test]
    fn envelope_counts_characters_not_bytes() {
        let key = derive_key(TEMPLATE).unwrap();
        let sealed = seal_message(&key, "abééé").unwrap();
        assert!(sealed.ends_with(":5"));
        assert_eq!(open_message(&key, &sealed).unwrap(), "abééé");
    }

    #[test]
    fn wrong_key_does_not_open() {
        let key = derive_key(TEMPLATE).unwrap();
        let other = derive_key(b"someone else entirely").unwrap();
        let sealed = seal_message(&key, "for your eyes only").unwrap();
        assert!(open_message(&other, &sealed).is_err());
    }

    #[test]
    fn plain_text_is_not_an_envelope() {
        let key = derive_key(TEMPLATE).unwrap();
        assert!(open_message(&key, "just a note").is_err());
        assert!(open_message(&key, "ENCRYPTED:no-count-here").is_err());
    }
}
