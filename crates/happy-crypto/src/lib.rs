//! Happy session-sync envelope cryptography.
//!
//! Everything the server stores or relays is opaque ciphertext. This crate
//! provides the three primitives the rest of the client builds on:
//!
//! - **AEAD envelopes** (`aead`): two variants, `legacy` (XSalsa20-Poly1305
//!   under the account secret) and `dataKey` (AES-256-GCM under a random
//!   per-session key).
//! - **Sealed boxes** (`sealed_box`): anonymous public-key wrapping, used to
//!   hand the server a `dataKey` session key it can store but never read.
//! - **Content keypair derivation** (`keypair`): a deterministic X25519
//!   keypair derived from the account secret, matching libsodium's
//!   `crypto_box_seed_keypair`.

pub mod aead;
pub mod encoding;
pub mod error;
pub mod keypair;
pub mod sealed_box;

pub use aead::{decrypt, decrypt_data_key, decrypt_legacy, encrypt, encrypt_data_key, encrypt_legacy, AeadVariant};
pub use error::CryptoError;
pub use keypair::{fingerprint_of, ContentKeyPair};
