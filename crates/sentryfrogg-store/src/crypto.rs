use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use sentryfrogg_types::SealedValue;
use std::path::Path;
use zeroize::Zeroize;

use crate::{fsio, StoreError};

// ── Master key ───────────────────────────────────────────────────
//
// 32-byte key obtained from ENCRYPTION_KEY (hex / base64 / raw), else a
// persisted key file created 0600 on first run with 256 bits of CSPRNG.

/// Holds the master encryption key and zeroizes it on drop.
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Resolve the key from the environment or the key file, generating
    /// and persisting a fresh key on first run.
    pub fn load_or_create(key_file: &Path) -> Result<Self, StoreError> {
        if let Ok(raw) = std::env::var("ENCRYPTION_KEY") {
            if !raw.is_empty() {
                return Self::parse(&raw);
            }
        }

        if key_file.exists() {
            let contents = std::fs::read_to_string(key_file)
                .map_err(|e| StoreError::Io(format!("failed to read key file: {e}")))?;
            return Self::parse(contents.trim());
        }

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        fsio::atomic_write(key_file, hex::encode(key).as_bytes())?;
        Ok(Self::new(key))
    }

    /// Accept a 64-char hex string, a base64 string decoding to 32 bytes,
    /// or a raw 32-byte string.
    fn parse(raw: &str) -> Result<Self, StoreError> {
        if raw.len() == 64 {
            if let Ok(bytes) = hex::decode(raw) {
                if bytes.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&bytes);
                    return Ok(Self::new(key));
                }
            }
        }
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw) {
            if bytes.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                return Ok(Self::new(key));
            }
        }
        if raw.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(raw.as_bytes());
            return Ok(Self::new(key));
        }
        Err(StoreError::Crypto(
            "ENCRYPTION_KEY must be 64 hex chars, base64 of 32 bytes, or 32 raw bytes".to_string(),
        ))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedValue, StoreError> {
        seal(&self.key, plaintext)
    }

    pub fn open(&self, sealed: &SealedValue) -> Result<Vec<u8>, StoreError> {
        open(&self.key, sealed)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Encrypt plaintext with AES-256-GCM using a unique random nonce.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<SealedValue, StoreError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("cipher init failed: {e}")))?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| StoreError::Crypto(format!("encryption failed: {e}")))?;

    Ok(SealedValue {
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

/// Decrypt an AES-256-GCM sealed value, verifying the authentication tag.
pub fn open(key: &[u8; 32], sealed: &SealedValue) -> Result<Vec<u8>, StoreError> {
    if sealed.nonce.len() != 12 {
        return Err(StoreError::Corrupt("sealed value has invalid nonce length".to_string()));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("cipher init failed: {e}")))?;

    let nonce = Nonce::from_slice(&sealed.nonce);
    cipher
        .decrypt(nonce, sealed.ciphertext.as_ref())
        .map_err(|_| StoreError::Corrupt("ciphertext failed authentication".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [42u8; 32];
        let sealed = seal(&key, b"hello, world!").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"hello, world!");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[1u8; 32], b"secret").unwrap();
        assert!(open(&[2u8; 32], &sealed).is_err());
    }

    #[test]
    fn test_unique_nonces() {
        let key = [42u8; 32];
        let a = seal(&key, b"data").unwrap();
        let b = seal(&key, b"data").unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = [7u8; 32];
        let mut sealed = seal(&key, b"data").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(matches!(open(&key, &sealed), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_parse_hex_key() {
        let hex_key = hex::encode([9u8; 32]);
        let mk = MasterKey::parse(&hex_key).unwrap();
        assert_eq!(mk.key, [9u8; 32]);
    }

    #[test]
    fn test_parse_base64_key() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([5u8; 32]);
        let mk = MasterKey::parse(&b64).unwrap();
        assert_eq!(mk.key, [5u8; 32]);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(MasterKey::parse("short").is_err());
    }

    #[test]
    fn test_key_file_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join(".mcp_profiles.key");

        let a = MasterKey::load_or_create(&key_file).unwrap();
        assert!(key_file.exists());
        let b = MasterKey::load_or_create(&key_file).unwrap();
        assert_eq!(a.key, b.key);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join(".mcp_profiles.key");
        MasterKey::load_or_create(&key_file).unwrap();
        let mode = std::fs::metadata(&key_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
