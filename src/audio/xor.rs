//! Repeating-key XOR de-obfuscation for audio payloads.
//!
//! Some clients obfuscate uploaded audio with a repeating XOR key before
//! base64-encoding it into the form body. This is transport obfuscation
//! only and must never be treated as encryption.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};

/// Apply a repeating-key XOR to `data`. Involutive: applying twice with the
/// same key returns the original bytes.
pub fn xor_cipher(data: &[u8], key: &str) -> Vec<u8> {
    let key_bytes = key.as_bytes();
    if key_bytes.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key_bytes[i % key_bytes.len()])
        .collect()
}

/// Decode a base64 payload and undo the repeating-key XOR.
pub fn decode_obfuscated(encoded: &str, key: &str) -> Result<Vec<u8>> {
    let obfuscated = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::bad_audio(format!("failed to decode audio payload: {}", e)))?;
    Ok(xor_cipher(&obfuscated, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_round_trips() {
        let data = b"RIFF....WAVEfmt ";
        let once = xor_cipher(data, "s3cret");
        assert_ne!(once.as_slice(), data.as_slice());
        let twice = xor_cipher(&once, "s3cret");
        assert_eq!(twice.as_slice(), data.as_slice());
    }

    #[test]
    fn empty_key_is_identity() {
        let data = vec![1u8, 2, 3, 4];
        assert_eq!(xor_cipher(&data, ""), data);
    }

    #[test]
    fn decode_obfuscated_round_trips() {
        let original = b"not really audio".to_vec();
        let obfuscated = xor_cipher(&original, "key");
        let encoded = STANDARD.encode(&obfuscated);
        let decoded = decode_obfuscated(&encoded, "key").unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn invalid_base64_is_bad_audio() {
        let err = decode_obfuscated("@@not base64@@", "key").unwrap_err();
        assert_eq!(err.code(), "bad_audio");
    }
}
