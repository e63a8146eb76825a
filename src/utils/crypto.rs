use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Malformed encrypted payload: {0}")]
    Malformed(String),

    #[error("Encryption failed")]
    Seal,

    #[error("Decryption failed, wrong key or corrupted data")]
    Open,
}

/// Encrypts session credentials at rest.
pub trait SessionCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;
    fn decrypt(&self, stored: &str) -> Result<String, CipherError>;
}

/// AES-256-GCM; stored form is `base64(nonce || ciphertext || tag)`.
pub struct AesGcmCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCipher {
    pub fn from_base64_key(encoded: &str) -> Result<Self, CipherError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| CipherError::InvalidKey(err.to_string()))?;
        if bytes.len() != 32 {
            return Err(CipherError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes)
            .map_err(|_| CipherError::InvalidKey("failed to create AES-256-GCM key".to_string()))?;
        Ok(AesGcmCipher {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl SessionCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| CipherError::Seal)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::Seal)?;

        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&in_out);
        Ok(STANDARD.encode(payload))
    }

    fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        let payload = STANDARD
            .decode(stored.trim())
            .map_err(|err| CipherError::Malformed(err.to_string()))?;
        if payload.len() <= NONCE_LEN {
            return Err(CipherError::Malformed("payload too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CipherError::Malformed("bad nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::Open)?;
        String::from_utf8(plaintext.to_vec()).map_err(|err| CipherError::Malformed(err.to_string()))
    }
}

/// Used when no key is configured: sessions are stored as given.
pub struct PlaintextCipher;

impl SessionCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        Ok(stored.to_string())
    }
}

pub fn build_session_cipher(encoded_key: &str) -> Result<Arc<dyn SessionCipher>, CipherError> {
    if encoded_key.trim().is_empty() {
        warn!("SESSION_ENCRYPTION_KEY is not set; session strings are stored unencrypted");
        return Ok(Arc::new(PlaintextCipher));
    }
    Ok(Arc::new(AesGcmCipher::from_base64_key(encoded_key)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        STANDARD.encode([7u8; 32])
    }

    #[test]
    fn seal_open_roundtrip() {
        let cipher = AesGcmCipher::from_base64_key(&test_key()).unwrap();
        let stored = cipher.encrypt("session-token").unwrap();
        assert_ne!(stored, "session-token");
        assert_eq!(cipher.decrypt(&stored).unwrap(), "session-token");
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let cipher = AesGcmCipher::from_base64_key(&test_key()).unwrap();
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn wrong_key_and_tampering_fail() {
        let cipher = AesGcmCipher::from_base64_key(&test_key()).unwrap();
        let other = AesGcmCipher::from_base64_key(&STANDARD.encode([9u8; 32])).unwrap();
        let stored = cipher.encrypt("secret").unwrap();
        assert!(matches!(other.decrypt(&stored), Err(CipherError::Open)));

        let mut raw = STANDARD.decode(&stored).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(cipher.decrypt(&STANDARD.encode(raw)).is_err());
        assert!(matches!(
            cipher.decrypt("!!not base64!!"),
            Err(CipherError::Malformed(_))
        ));
    }

    #[test]
    fn short_keys_are_rejected() {
        assert!(matches!(
            AesGcmCipher::from_base64_key(&STANDARD.encode([1u8; 16])),
            Err(CipherError::InvalidKey(_))
        ));
    }

    #[test]
    fn empty_key_means_plaintext() {
        let cipher = build_session_cipher("").unwrap();
        assert_eq!(cipher.decrypt("raw").unwrap(), "raw");
    }
}
