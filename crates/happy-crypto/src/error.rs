//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
