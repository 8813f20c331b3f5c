//! AES-256-GCM cipher for connection parameters at rest.
//!
//! The blob layout is `base64(nonce || ciphertext)` with a fresh random
//! 96-bit nonce per encryption. The key is derived from an operator-supplied
//! secret via SHA-256, so any secret length works while the cipher always
//! gets exactly 32 bytes.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("sealed parameters are not valid base64")]
    Encoding,
    #[error("sealed parameters are truncated")]
    Truncated,
    #[error("decryption failed: wrong key or corrupted blob")]
    Unauthenticated,
    #[error("encryption failed")]
    Seal,
}

/// Seals and unseals connector parameter blobs. Plaintext parameters exist
/// only in memory; everything that reaches the database goes through here.
pub struct ParamsCipher {
    cipher: Aes256Gcm,
}

impl ParamsCipher {
    pub fn from_secret(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        // SHA-256 output is always 32 bytes, the exact AES-256 key size.
        let cipher = Aes256Gcm::new_from_slice(&key).expect("digest length matches key length");
        Self { cipher }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Seal)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String, CipherError> {
        let raw = STANDARD.decode(sealed).map_err(|_| CipherError::Encoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Unauthenticated)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Unauthenticated)
    }
}
