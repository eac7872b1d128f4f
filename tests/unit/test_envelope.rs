//! Notification envelope round-trip tests.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cicd_agent::notify::envelope::{compress_and_encrypt, decrypt_and_decompress};

const KEY: &str = "DqJHGSTaw11yWhyjhMmiX1hgd3AoYARg";

#[test]
fn test_notification_payload_round_trip() {
    let payload = serde_json::json!({
        "isset": true,
        "id": "svc-a-1.2.3-1700000000",
        "step": 9,
        "step_type": "pullOnline",
        "step_status": "running",
        "remote": "agent",
        "duration": 0.0,
        "last_duration": 12.34,
    });
    let bytes = serde_json::to_vec(&payload).unwrap();

    let wire = compress_and_encrypt(KEY, &bytes).unwrap();
    let back = decrypt_and_decompress(KEY, &wire).unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&back).unwrap();
    assert_eq!(parsed, payload);
}

#[test]
fn test_wire_format_has_nonce_prefix() {
    let wire = compress_and_encrypt(KEY, b"payload").unwrap();
    let raw = BASE64.decode(&wire).unwrap();
    // 12-byte nonce, then ciphertext with a 16-byte GCM tag
    assert!(raw.len() > 12 + 16);
}

#[test]
fn test_tampered_ciphertext_rejected() {
    let wire = compress_and_encrypt(KEY, b"payload").unwrap();
    let mut raw = BASE64.decode(&wire).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    let tampered = BASE64.encode(&raw);

    assert!(decrypt_and_decompress(KEY, &tampered).is_err());
}

#[test]
fn test_empty_payload_round_trip() {
    let wire = compress_and_encrypt(KEY, b"").unwrap();
    assert_eq!(decrypt_and_decompress(KEY, &wire).unwrap(), b"");
}
