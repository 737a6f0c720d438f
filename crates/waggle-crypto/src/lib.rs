//! Symmetric encryption for user-supplied LLM API keys.
//!
//! - **Key derivation**: PBKDF2-HMAC-SHA256, fixed salt, 100 000 iterations
//! - **Encryption**: AES-256-GCM with a random 96-bit nonce per call
//! - **Token format**: URL-safe base64 of nonce ‖ ciphertext
//!
//! The derived key never leaves the process; only the token is stored.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT: &[u8] = b"waggle-key-derivation-v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Tampered, truncated, malformed, or wrong-key ciphertext. The causes
    /// are deliberately collapsed so callers cannot distinguish them.
    #[error("invalid ciphertext")]
    InvalidCiphertext,
}

/// Cipher derived from a passphrase; encrypts and decrypts API-key tokens.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(passphrase: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(
            passphrase.as_bytes(),
            SALT,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key is valid for AES-256");
        Self { cipher }
    }

    /// Encrypt a plaintext string into a URL-safe base64 token.
    /// Empty input round-trips to an empty token.
    pub fn encrypt(&self, plaintext: &str) -> String {
        if plaintext.is_empty() {
            return String::new();
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption is infallible for in-memory buffers");

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(combined)
    }

    /// Decrypt a token produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, token: &str) -> Result<String, CryptoError> {
        if token.is_empty() {
            return Ok(String::new());
        }

        let combined = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        if combined.len() <= NONCE_LEN {
            return Err(CryptoError::InvalidCiphertext);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::InvalidCiphertext)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidCiphertext)
    }
}

/// Generate a fresh random passphrase, URL-safe base64 of 32 bytes.
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
