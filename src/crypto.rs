//! Per-node message encryption for the node session bus and flow-upload
//! endpoints (§4.1, §4.4). Grounded literally in
//! `original_source/go-backend/pkg/aes.go` and `pkg/secret.go`: the key is
//! SHA-256 of the node secret, nonces are random and prepended to the
//! ciphertext, and the AES context is memoised per secret for reuse.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::Engine as _;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock};

const NONCE_LEN: usize = 12;

#[derive(Debug)]
pub enum CryptoError {
    Base64,
    Decrypt,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base64 => write!(f, "invalid base64 payload"),
            Self::Decrypt => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

static CIPHER_CACHE: LazyLock<DashMap<String, Arc<Aes256Gcm>>> = LazyLock::new(DashMap::new);

fn cipher_for_secret(secret: &str) -> Arc<Aes256Gcm> {
    if let Some(existing) = CIPHER_CACHE.get(secret) {
        return existing.clone();
    }
    let digest = Sha256::digest(secret.as_bytes());
    let key = Key::<Aes256Gcm>::from_slice(&digest);
    let cipher = Arc::new(Aes256Gcm::new(key));
    CIPHER_CACHE.insert(secret.to_string(), cipher.clone());
    cipher
}

/// `base64(nonce || AES256-GCM(plaintext))`.
pub fn encrypt(secret: &str, plaintext: &str) -> String {
    let cipher = cipher_for_secret(secret);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .expect("AES-GCM encryption does not fail for in-memory buffers");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    base64::engine::general_purpose::STANDARD.encode(out)
}

pub fn decrypt(secret: &str, data_b64: &str) -> Result<String, CryptoError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(data_b64)
        .map_err(|_| CryptoError::Base64)?;
    if raw.len() < NONCE_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = cipher_for_secret(secret);
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
}

/// 32 random bytes as 64 hex chars — the node control-secret format (§3).
pub fn generate_node_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(serde::Deserialize, serde::Serialize)]
pub struct EncryptedEnvelope {
    pub encrypted: bool,
    pub data: String,
    pub timestamp: i64,
}

/// Unwraps an inbound message if it is the `{encrypted:true,...}` envelope
/// shape, otherwise returns the raw payload unchanged (§4.1 "non-encrypted
/// messages are accepted verbatim").
pub fn decrypt_if_needed(raw: &str, secret: &str) -> String {
    if raw.is_empty() || secret.is_empty() {
        return raw.to_string();
    }
    let Ok(envelope) = serde_json::from_str::<EncryptedEnvelope>(raw) else {
        return raw.to_string();
    };
    if !envelope.encrypted || envelope.data.is_empty() {
        return raw.to_string();
    }
    decrypt(secret, &envelope.data).unwrap_or_else(|_| raw.to_string())
}

pub fn wrap_encrypted(secret: &str, plaintext: &str, now_ms: i64) -> String {
    let envelope = EncryptedEnvelope {
        encrypted: true,
        data: encrypt(secret, plaintext),
        timestamp: now_ms,
    };
    serde_json::to_string(&envelope).expect("envelope serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrips() {
        let secret = "node-secret-123";
        let plaintext = r#"{"n":"17_5_7","u":100,"d":200}"#;
        let encrypted = encrypt(secret, plaintext);
        let decrypted = decrypt(secret, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn each_call_uses_a_fresh_nonce() {
        let secret = "node-secret-123";
        let a = encrypt(secret, "hello");
        let b = encrypt(secret, "hello");
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_secret_fails_to_decrypt() {
        let encrypted = encrypt("secret-a", "hello");
        assert!(decrypt("secret-b", &encrypted).is_err());
    }

    #[test]
    fn decrypt_if_needed_passes_through_plain_json() {
        let raw = r#"{"n":"17_5_7","u":1,"d":2}"#;
        assert_eq!(decrypt_if_needed(raw, "secret"), raw);
    }

    #[test]
    fn decrypt_if_needed_unwraps_encrypted_envelope() {
        let secret = "node-secret-123";
        let plaintext = r#"{"n":"17_5_7","u":1,"d":2}"#;
        let wrapped = wrap_encrypted(secret, plaintext, 1234);
        assert_eq!(decrypt_if_needed(&wrapped, secret), plaintext);
    }

    #[test]
    fn generated_node_secret_is_64_hex_chars() {
        let secret = generate_node_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
