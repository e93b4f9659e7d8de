//! Base64 framing helpers.
//!
//! The wire protocol carries ciphertext as base64 in two flavors: standard
//! (padded, used for JSON envelope fields) and URL-safe unpadded (used in
//! a handful of path-embedded identifiers). Decoders are tolerant of the
//! padding the encoder on the other end may or may not have emitted.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::error::CryptoError;

/// Encode bytes as standard base64 (with padding).
pub fn encode_standard(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode standard base64, tolerating missing padding.
pub fn decode_standard(s: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(s)
        .or_else(|_| STANDARD_NO_PAD.decode(s.trim_end_matches('=')))
        .map_err(|e| CryptoError::Base64Decode(e.to_string()))
}

/// Encode bytes as URL-safe base64 with no padding.
pub fn encode_url_safe(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode URL-safe base64, stripping any padding first.
pub fn decode_url_safe(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| CryptoError::Base64Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_roundtrip() {
        let data = b"hello world, this is a test payload";
        let encoded = encode_standard(data);
        assert_eq!(decode_standard(&encoded).unwrap(), data);
    }

    #[test]
    fn standard_decode_tolerates_stripped_padding() {
        let data = b"abc";
        let encoded = encode_standard(data);
        let stripped = encoded.trim_end_matches('=');
        assert_eq!(decode_standard(stripped).unwrap(), data);
    }

    #[test]
    fn url_safe_roundtrip() {
        let data = b"\xff\xfe\xfd binary data \x00\x01";
        let encoded = encode_url_safe(data);
        assert!(!encoded.contains('='));
        assert_eq!(decode_url_safe(&encoded).unwrap(), data.to_vec());
    }

    #[test]
    fn url_safe_decode_tolerates_padding() {
        let data = b"abc";
        let encoded = encode_url_safe(data);
        let padded = format!("{encoded}==");
        assert_eq!(decode_url_safe(&padded).unwrap(), data);
    }
}
