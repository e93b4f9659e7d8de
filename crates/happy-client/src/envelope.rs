//! Base64 glue around `happy_crypto`'s AEAD envelopes (§4.1/C1).
//!
//! Every field this client writes crosses the wire as a base64 string; this
//! module is the one place that combines "encrypt" with "encode" so the
//! rest of the crate never touches raw ciphertext bytes.

use happy_crypto::AeadVariant;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Encrypt `value` under `(variant, key)` and base64-encode the bundle.
pub fn seal<T: Serialize>(variant: AeadVariant, key: &[u8; 32], value: &T) -> Result<String> {
    let json = serde_json::to_value(value)?;
    let bundle = happy_crypto::encrypt(variant, key, &json)?;
    Ok(happy_crypto::encoding::encode_standard(&bundle))
}

/// Decode and decrypt a base64 envelope. `None` on any malformed, tampered,
/// or wrong-key input — matches `happy_crypto::decrypt`'s own tolerance.
pub fn open<T: DeserializeOwned>(variant: AeadVariant, key: &[u8; 32], encoded: &str) -> Option<T> {
    let bundle = happy_crypto::encoding::decode_standard(encoded).ok()?;
    let value = happy_crypto::decrypt(variant, key, &bundle)?;
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Demo {
        n: u32,
        s: String,
    }

    #[test]
    fn roundtrips_legacy() {
        let key = [1u8; 32];
        let demo = Demo { n: 7, s: "hi".into() };
        let sealed = seal(AeadVariant::Legacy, &key, &demo).unwrap();
        let opened: Demo = open(AeadVariant::Legacy, &key, &sealed).unwrap();
        assert_eq!(opened, demo);
    }

    #[test]
    fn roundtrips_data_key() {
        let key = [2u8; 32];
        let demo = Demo { n: 1, s: "x".into() };
        let sealed = seal(AeadVariant::DataKey, &key, &demo).unwrap();
        let opened: Demo = open(AeadVariant::DataKey, &key, &sealed).unwrap();
        assert_eq!(opened, demo);
    }

    #[test]
    fn open_rejects_wrong_key() {
        let demo = Demo { n: 1, s: "x".into() };
        let sealed = seal(AeadVariant::Legacy, &[3u8; 32], &demo).unwrap();
        assert!(open::<Demo>(AeadVariant::Legacy, &[4u8; 32], &sealed).is_none());
    }

    #[test]
    fn open_rejects_garbage() {
        assert!(open::<Demo>(AeadVariant::Legacy, &[0u8; 32], "not-base64!!").is_none());
    }
}
