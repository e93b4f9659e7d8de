//! Deterministic content keypair derivation.
//!
//! Every account has exactly one "content" keypair, derived from the
//! account secret so it never needs to be transmitted or stored separately.
//! Derivation is two steps: a key-derivation-tree pass turns the account
//! secret plus a fixed usage/path label into a 32-byte seed, then the seed
//! is turned into an X25519 keypair the same way libsodium's
//! `crypto_box_seed_keypair` does — hash the seed with SHA-512 and take the
//! first 32 bytes as the scalar. `x25519-dalek` clamps the scalar per
//! RFC 7748 on construction, matching libsodium's clamping step.

use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// Usage label for the fixed key-derivation tree path this crate consumes.
const KDF_USAGE: &str = "Happy EnCoder";

/// A deterministic X25519 keypair derived from the account secret.
pub struct ContentKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ContentKeyPair {
    /// Derive the content keypair from a 32-byte account secret.
    pub fn derive(account_secret: &[u8; 32]) -> Result<Self, CryptoError> {
        let seed = derive_seed(account_secret, &["content"])?;
        Ok(seeded_keypair(&seed))
    }

    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub const fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for ContentKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKeyPair")
            .field("public", &crate::encoding::encode_standard(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Apply the key-derivation tree to `account_secret` under `usage` / `path`,
/// producing a 32-byte seed. Implemented as HKDF-SHA256 with the usage and
/// path segments folded into the info parameter for domain separation.
fn derive_seed(account_secret: &[u8; 32], path: &[&str]) -> Result<[u8; 32], CryptoError> {
    let mut info = Vec::with_capacity(KDF_USAGE.len() + 1 + path.iter().map(|p| p.len() + 1).sum::<usize>());
    info.extend_from_slice(KDF_USAGE.as_bytes());
    for segment in path {
        info.push(0x00);
        info.extend_from_slice(segment.as_bytes());
    }

    let hk = Hkdf::<Sha256>::new(None, account_secret);
    let mut seed = [0u8; 32];
    hk.expand(&info, &mut seed)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(seed)
}

/// Turn a 32-byte seed into an X25519 keypair exactly as libsodium's
/// `crypto_box_seed_keypair` does: SHA-512(seed), take the first 32 bytes
/// as the (to-be-clamped) scalar.
fn seeded_keypair(seed: &[u8; 32]) -> ContentKeyPair {
    let hash = Sha512::digest(seed);
    let mut scalar_bytes = [0u8; 32];
    scalar_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(scalar_bytes);
    let public = PublicKey::from(&secret);
    ContentKeyPair { secret, public }
}

/// Colon-separated hex fingerprint of a public key, for logging.
pub fn fingerprint_of(pubkey_bytes: &[u8; 32]) -> String {
    let hash = Sha256::digest(pubkey_bytes);
    hash.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let secret = [7u8; 32];
        let a = ContentKeyPair::derive(&secret).unwrap();
        let b = ContentKeyPair::derive(&secret).unwrap();
        assert_eq!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn different_secrets_derive_different_keys() {
        let a = ContentKeyPair::derive(&[1u8; 32]).unwrap();
        let b = ContentKeyPair::derive(&[2u8; 32]).unwrap();
        assert_ne!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn matches_seeded_keypair_construction() {
        let secret = [9u8; 32];
        let seed = derive_seed(&secret, &["content"]).unwrap();
        let expected = seeded_keypair(&seed);
        let actual = ContentKeyPair::derive(&secret).unwrap();
        assert_eq!(actual.public_bytes(), expected.public_bytes());
    }

    #[test]
    fn debug_impl_redacts_secret() {
        let kp = ContentKeyPair::derive(&[3u8; 32]).unwrap();
        let debug_output = format!("{kp:?}");
        assert!(debug_output.contains("[REDACTED]"));
    }
}
