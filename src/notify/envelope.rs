//! Notification payload envelope: gzip, AES-256-GCM, base64.
//!
//! Wire form is `base64(nonce || ciphertext)` with a 12-byte random nonce.
//! The key is the 32-byte salt from configuration.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;

use crate::errors::AgentError;

const NONCE_LEN: usize = 12;

fn cipher(key: &str) -> Result<Aes256Gcm, AgentError> {
    let key_bytes = key.as_bytes();
    if key_bytes.len() != 32 {
        return Err(AgentError::CryptoError(format!(
            "encryption salt must be 32 bytes, got {}",
            key_bytes.len()
        )));
    }
    Aes256Gcm::new_from_slice(key_bytes)
        .map_err(|e| AgentError::CryptoError(format!("invalid AES key: {}", e)))
}

/// Gzip, encrypt and base64-encode a payload.
pub fn compress_and_encrypt(key: &str, data: &[u8]) -> Result<String, AgentError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| AgentError::CryptoError(format!("gzip failed: {}", e)))
        .and_then(|compressed| {
            let cipher = cipher(key)?;
            let mut nonce_bytes = [0u8; NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut nonce_bytes);
            let nonce = Nonce::from_slice(&nonce_bytes);

            let ciphertext = cipher
                .encrypt(nonce, compressed.as_ref())
                .map_err(|e| AgentError::CryptoError(format!("AES-GCM encrypt failed: {}", e)))?;

            let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            out.extend_from_slice(&nonce_bytes);
            out.extend_from_slice(&ciphertext);
            Ok(BASE64.encode(out))
        })
}

/// Reverse of [`compress_and_encrypt`].
pub fn decrypt_and_decompress(key: &str, data: &str) -> Result<Vec<u8>, AgentError> {
    let raw = BASE64
        .decode(data)
        .map_err(|e| AgentError::CryptoError(format!("base64 decode failed: {}", e)))?;
    if raw.len() < NONCE_LEN {
        return Err(AgentError::CryptoError("ciphertext too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = cipher(key)?;
    let compressed = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| AgentError::CryptoError(format!("AES-GCM decrypt failed: {}", e)))?;

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AgentError::CryptoError(format!("gunzip failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "DqJHGSTaw11yWhyjhMmiX1hgd3AoYARg";

    #[test]
    fn test_round_trip() {
        let plaintext = b"{\"isset\":true,\"id\":\"task-1\"}";
        let wire = compress_and_encrypt(KEY, plaintext).unwrap();
        let back = decrypt_and_decompress(KEY, &wire).unwrap();
        assert_eq!(back, plaintext);
    }

    #[test]
    fn test_round_trip_arbitrary_bytes() {
        let plaintext: Vec<u8> = (0u16..4096).map(|i| (i % 251) as u8).collect();
        let wire = compress_and_encrypt(KEY, &plaintext).unwrap();
        assert_eq!(decrypt_and_decompress(KEY, &wire).unwrap(), plaintext);
    }

    #[test]
    fn test_nonce_randomised() {
        let a = compress_and_encrypt(KEY, b"same").unwrap();
        let b = compress_and_encrypt(KEY, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let wire = compress_and_encrypt(KEY, b"secret").unwrap();
        let err = decrypt_and_decompress("AqJHGSTaw11yWhyjhMmiX1hgd3AoYARg", &wire).unwrap_err();
        assert!(matches!(err, AgentError::CryptoError(_)));
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(compress_and_encrypt("short", b"x").is_err());
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        assert!(decrypt_and_decompress(KEY, "AAAA").is_err());
    }
}
