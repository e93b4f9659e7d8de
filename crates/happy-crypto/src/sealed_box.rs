//! Sealed-box wrapping of per-session symmetric keys.
//!
//! Used to hand a freshly generated `dataKey` session/machine key to the
//! server without the server ever seeing it in the clear: the sender
//! generates a one-time X25519 keypair, boxes the key to the recipient's
//! long-lived content public key, and throws the ephemeral secret away.
//! Bundle layout: `ephemeralPublic(32) || nonce(24) || box-ciphertext`.

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

type SealedNonce = GenericArray<u8, <SalsaBox as AeadCore>::NonceSize>;

const EPHEMERAL_PUBLIC_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Seal `data_key` to `recipient_public`. Returns the unprefixed bundle.
pub fn seal(data_key: &[u8; 32], recipient_public: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_secret = BoxSecretKey::generate(&mut OsRng);
    let ephemeral_public = *ephemeral_secret.public_key().as_bytes();

    let recipient = BoxPublicKey::from(*recipient_public.as_bytes());
    let cipher = SalsaBox::new(&recipient, &ephemeral_secret);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, data_key.as_slice())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut bundle = Vec::with_capacity(EPHEMERAL_PUBLIC_LEN + NONCE_LEN + ciphertext.len());
    bundle.extend_from_slice(&ephemeral_public);
    bundle.extend_from_slice(&nonce);
    bundle.extend_from_slice(&ciphertext);
    Ok(bundle)
}

/// Seal `data_key` to `recipient_public`, prefixed with the `0x00` version
/// byte used when the wrapped key is stored server-side.
pub fn seal_versioned(data_key: &[u8; 32], recipient_public: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let mut bundle = seal(data_key, recipient_public)?;
    bundle.insert(0, 0x00);
    Ok(bundle)
}

/// Open a sealed-box `bundle` (no version prefix) using `recipient_secret`.
pub fn open(recipient_secret: &StaticSecret, bundle: &[u8]) -> Result<[u8; 32], CryptoError> {
    if bundle.len() < EPHEMERAL_PUBLIC_LEN + NONCE_LEN {
        return Err(CryptoError::InvalidBundle("sealed box too short".into()));
    }
    let (ephemeral_public_bytes, rest) = bundle.split_at(EPHEMERAL_PUBLIC_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let mut eph_arr = [0u8; 32];
    eph_arr.copy_from_slice(ephemeral_public_bytes);
    let ephemeral_public = BoxPublicKey::from(eph_arr);

    let secret = BoxSecretKey::from(recipient_secret.to_bytes());
    let cipher = SalsaBox::new(&ephemeral_public, &secret);
    let nonce = SealedNonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

    if plaintext.len() != 32 {
        return Err(CryptoError::InvalidBundle(format!(
            "expected 32-byte key, got {}",
            plaintext.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&plaintext);
    Ok(key)
}

/// Open a version-prefixed sealed-box bundle, checking the `0x00` version byte.
pub fn open_versioned(recipient_secret: &StaticSecret, bundle: &[u8]) -> Result<[u8; 32], CryptoError> {
    match bundle.split_first() {
        Some((0x00, rest)) => open(recipient_secret, rest),
        Some((other, _)) => Err(CryptoError::InvalidBundle(format!(
            "unsupported sealed box version {other}"
        ))),
        None => Err(CryptoError::InvalidBundle("empty bundle".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng as RandOsRng;

    #[test]
    fn seal_open_roundtrip() {
        let secret = StaticSecret::random_from_rng(RandOsRng);
        let public = PublicKey::from(&secret);

        let data_key = [42u8; 32];
        let bundle = seal(&data_key, &public).unwrap();
        let opened = open(&secret, &bundle).unwrap();
        assert_eq!(opened, data_key);
    }

    #[test]
    fn versioned_roundtrip_has_version_prefix() {
        let secret = StaticSecret::random_from_rng(RandOsRng);
        let public = PublicKey::from(&secret);

        let data_key = [7u8; 32];
        let bundle = seal_versioned(&data_key, &public).unwrap();
        assert_eq!(bundle[0], 0x00);
        assert_eq!(open_versioned(&secret, &bundle).unwrap(), data_key);
    }

    #[test]
    fn open_with_wrong_secret_fails() {
        let secret = StaticSecret::random_from_rng(RandOsRng);
        let public = PublicKey::from(&secret);
        let other_secret = StaticSecret::random_from_rng(RandOsRng);

        let bundle = seal(&[1u8; 32], &public).unwrap();
        assert!(open(&other_secret, &bundle).is_err());
    }

    #[test]
    fn open_versioned_rejects_bad_version() {
        let secret = StaticSecret::random_from_rng(RandOsRng);
        let public = PublicKey::from(&secret);
        let mut bundle = seal_versioned(&[1u8; 32], &public).unwrap();
        bundle[0] = 0x01;
        assert!(open_versioned(&secret, &bundle).is_err());
    }
}
