//! # Payload Cipher
//!
//! AES-256-GCM over Data payloads with a fabric-wide shared key. Each sealed
//! payload is `nonce(12) || ciphertext+tag`, with a fresh random nonce per
//! message; tampering or a foreign key fails authentication on open.
//!
//! Only Data payloads are encrypted. Control messages travel in the clear,
//! and the broker forwards sealed payloads opaquely — it never holds the key
//! in the data path.
//!
//! The process-wide cipher is installed once at startup (the agent derives
//! the key from its provisioned secret); a built-in development key is the
//! fallback so tests and broker-only deployments work without provisioning.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use rand::RngCore;
use sha3::{Digest, Sha3_256};

use crate::error::ProtocolError;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Bytes added to a plaintext by [`PayloadCipher::seal`].
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Development fallback key, replaced by provisioning in any real deployment.
const DEV_FABRIC_KEY: [u8; 32] = *b"lattice-dev-fabric-key-000000000";

/// Authenticated encryption for tunneled payloads.
pub struct PayloadCipher {
    inner: Aes256Gcm,
}

impl PayloadCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            inner: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Derives the fabric key from a provisioned secret string: a 64-char hex
    /// secret is decoded directly, anything else is hashed to 32 bytes.
    pub fn from_secret(secret: &str) -> Self {
        let mut key = [0u8; 32];
        if secret.len() == 64 {
            if let Ok(raw) = hex::decode(secret) {
                key.copy_from_slice(&raw);
                return Self::new(&key);
            }
        }
        key.copy_from_slice(&Sha3_256::digest(secret.as_bytes()));
        Self::new(&key)
    }

    /// Encrypts `plain` into `nonce || ciphertext+tag`.
    pub fn seal(&self, plain: &[u8]) -> Result<Bytes, ProtocolError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .inner
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| ProtocolError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(Bytes::from(out))
    }

    /// Opens a sealed payload, authenticating the tag.
    pub fn open(&self, sealed: &[u8]) -> Result<Bytes, ProtocolError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(ProtocolError::DecryptFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plain = self
            .inner
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptFailed)?;
        Ok(Bytes::from(plain))
    }
}

static FABRIC_CIPHER: OnceCell<PayloadCipher> = OnceCell::new();

/// Installs the fabric cipher. Returns false if one was already installed;
/// the first installation wins and later calls leave it untouched.
pub fn install_cipher(cipher: PayloadCipher) -> bool {
    FABRIC_CIPHER.set(cipher).is_ok()
}

/// The process-wide payload cipher, falling back to the development key.
pub fn cipher() -> &'static PayloadCipher {
    FABRIC_CIPHER.get_or_init(|| PayloadCipher::new(&DEV_FABRIC_KEY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let sealed = cipher.seal(b"Hello from Client A!").unwrap();
        assert_eq!(sealed.len(), 20 + SEAL_OVERHEAD);
        assert_eq!(cipher.open(&sealed).unwrap().as_ref(), b"Hello from Client A!");
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let a = cipher.seal(b"same payload").unwrap();
        let b = cipher.seal(b"same payload").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let mut sealed = cipher.seal(b"payload").unwrap().to_vec();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(cipher.open(&sealed), Err(ProtocolError::DecryptFailed));
    }

    #[test]
    fn flipped_nonce_fails_open() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let mut sealed = cipher.seal(b"payload").unwrap().to_vec();
        sealed[0] ^= 0x01;
        assert_eq!(cipher.open(&sealed), Err(ProtocolError::DecryptFailed));
    }

    #[test]
    fn wrong_key_fails_open() {
        let sealed = PayloadCipher::new(&[1u8; 32]).seal(b"secret").unwrap();
        assert_eq!(
            PayloadCipher::new(&[2u8; 32]).open(&sealed),
            Err(ProtocolError::DecryptFailed)
        );
    }

    #[test]
    fn short_input_fails_open() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        assert_eq!(cipher.open(&[0u8; 5]), Err(ProtocolError::DecryptFailed));
    }

    #[test]
    fn hex_secret_decodes_to_raw_key() {
        let hex_key = "00".repeat(32);
        let from_hex = PayloadCipher::from_secret(&hex_key);
        let direct = PayloadCipher::new(&[0u8; 32]);
        let sealed = from_hex.seal(b"x").unwrap();
        assert!(direct.open(&sealed).is_ok());
    }

    #[test]
    fn text_secret_is_hashed() {
        let a = PayloadCipher::from_secret("token-abc");
        let b = PayloadCipher::from_secret("token-abc");
        let sealed = a.seal(b"x").unwrap();
        assert!(b.open(&sealed).is_ok());
    }
}
