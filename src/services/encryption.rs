use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing of short secrets (notification addresses) kept on disk.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        let key = STANDARD
            .decode(key_base64.trim())
            .map_err(|_| EncryptionError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| EncryptionError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Seal `plaintext`; output is base64 of nonce || ciphertext.
    pub fn seal(&self, plaintext: &str) -> Result<String, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend(ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, EncryptionError> {
        let data = STANDARD
            .decode(sealed)
            .map_err(|_| EncryptionError::DecryptFailed)?;
        if data.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| EncryptionError::DecryptFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::new(&STANDARD.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn test_seal_then_open() {
        let svc = service();
        let sealed = svc.seal("surgeon@example.org").unwrap();
        assert!(!sealed.contains("surgeon"));
        assert_eq!(svc.open(&sealed).unwrap(), "surgeon@example.org");
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(matches!(
            EncryptionService::new(&STANDARD.encode([1u8; 16])),
            Err(EncryptionError::InvalidKey)
        ));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let svc = service();
        assert!(svc.open("AAAA").is_err());
        let other = EncryptionService::new(&STANDARD.encode([9u8; 32])).unwrap();
        let sealed = svc.seal("a@b.c").unwrap();
        assert!(other.open(&sealed).is_err());
    }
}
