//! The two envelope AEAD variants.
//!
//! `legacy` wraps XSalsa20-Poly1305 (NaCl secretbox) under the account
//! secret directly. `data_key` wraps AES-256-GCM under a per-session
//! random key and version-prefixes the bundle so future variants can be
//! added without breaking older readers.
//!
//! Both operate on arbitrary JSON values. Decryption never raises on a
//! malformed or tampered bundle — it returns `None`, mirroring the source
//! behavior of treating an unreadable frame the same as an absent one.

use aes_gcm::aead::{Aead as _, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key as AesKey};
use crypto_secretbox::{
    aead::{Aead as SecretboxAead, KeyInit as SecretboxKeyInit},
    Key as SecretboxKey, Nonce as SecretboxNonce, XSalsa20Poly1305,
};
use rand_core::{OsRng as RandCoreOsRng, RngCore};
use serde_json::Value;

use crate::error::CryptoError;

/// Nonce length for the `dataKey` (AES-256-GCM) variant.
const DATA_KEY_NONCE_LEN: usize = 12;
/// Nonce length for the `legacy` (XSalsa20-Poly1305) variant.
const LEGACY_NONCE_LEN: usize = 24;
/// Version byte prefixing every `dataKey` bundle.
const DATA_KEY_VERSION: u8 = 0x00;
/// Minimum valid `dataKey` bundle length: version(1) + nonce(12) + tag(16).
const DATA_KEY_MIN_LEN: usize = 1 + DATA_KEY_NONCE_LEN + 16;

/// Encrypt `value` under `key` using the legacy XSalsa20-Poly1305 secretbox.
///
/// Bundle layout: `nonce(24) || ciphertext+tag`.
pub fn encrypt_legacy(key: &[u8; 32], value: &Value) -> Result<Vec<u8>, CryptoError> {
    let plaintext = serde_json::to_vec(value)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(key));
    let mut nonce_bytes = [0u8; LEGACY_NONCE_LEN];
    RandCoreOsRng.fill_bytes(&mut nonce_bytes);
    let nonce = SecretboxNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut bundle = Vec::with_capacity(LEGACY_NONCE_LEN + ciphertext.len());
    bundle.extend_from_slice(&nonce_bytes);
    bundle.extend_from_slice(&ciphertext);
    Ok(bundle)
}

/// Decrypt a legacy secretbox bundle. Returns `None` on any failure —
/// truncated input, tampered ciphertext, or wrong key.
pub fn decrypt_legacy(key: &[u8; 32], bundle: &[u8]) -> Option<Value> {
    if bundle.len() < LEGACY_NONCE_LEN {
        return None;
    }
    let (nonce_bytes, ciphertext) = bundle.split_at(LEGACY_NONCE_LEN);
    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(key));
    let nonce = SecretboxNonce::from_slice(nonce_bytes);

    let plaintext = cipher.decrypt(nonce, ciphertext).ok()?;
    serde_json::from_slice(&plaintext).ok()
}

/// Encrypt `value` under `key` using AES-256-GCM, the `dataKey` variant.
///
/// Bundle layout: `0x00 || nonce(12) || ciphertext+tag(16)`.
pub fn encrypt_data_key(key: &[u8; 32], value: &Value) -> Result<Vec<u8>, CryptoError> {
    let plaintext = serde_json::to_vec(value)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut bundle = Vec::with_capacity(1 + DATA_KEY_NONCE_LEN + ciphertext.len());
    bundle.push(DATA_KEY_VERSION);
    bundle.extend_from_slice(nonce.as_slice());
    bundle.extend_from_slice(&ciphertext);
    Ok(bundle)
}

/// Decrypt a `dataKey` bundle. Returns `None` if the bundle is too short,
/// the version byte is unrecognized, or GCM authentication fails.
pub fn decrypt_data_key(key: &[u8; 32], bundle: &[u8]) -> Option<Value> {
    if bundle.len() < DATA_KEY_MIN_LEN || bundle[0] != DATA_KEY_VERSION {
        return None;
    }
    let nonce_bytes = &bundle[1..1 + DATA_KEY_NONCE_LEN];
    let ciphertext = &bundle[1 + DATA_KEY_NONCE_LEN..];

    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
    let nonce = aes_gcm::Nonce::<<Aes256Gcm as AeadCore>::NonceSize>::from_slice(nonce_bytes);
    let plaintext = cipher.decrypt(nonce, ciphertext).ok()?;
    serde_json::from_slice(&plaintext).ok()
}

/// Which AEAD variant an `EncryptionContext` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AeadVariant {
    Legacy,
    DataKey,
}

/// Encrypt `value` under `key` with the given variant.
pub fn encrypt(variant: AeadVariant, key: &[u8; 32], value: &Value) -> Result<Vec<u8>, CryptoError> {
    match variant {
        AeadVariant::Legacy => encrypt_legacy(key, value),
        AeadVariant::DataKey => encrypt_data_key(key, value),
    }
}

/// Decrypt `bundle` under `key` with the given variant.
pub fn decrypt(variant: AeadVariant, key: &[u8; 32], bundle: &[u8]) -> Option<Value> {
    match variant {
        AeadVariant::Legacy => decrypt_legacy(key, bundle),
        AeadVariant::DataKey => decrypt_data_key(key, bundle),
    }
}
