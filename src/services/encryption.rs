use crate::models::EncryptionMetadata;
use bytes::Bytes;
use aes_gcm::{
    AesGcm,
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng, consts::U16, generic_array::GenericArray},
    aes::Aes256,
};
use std::time::Duration;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext, nonce or tag were altered, or the wrong key was used.
    #[error("integrity violation: ciphertext failed authentication")]
    IntegrityViolation,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unknown encryption key id '{0}'")]
    UnknownKeyId(String),

    #[error("encryption operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("encryption failure: {0}")]
    Internal(String),
}

/// Ciphertext plus the parameters needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    pub auth_tag: [u8; TAG_LEN],
}

impl EncryptedPayload {
    pub fn metadata(&self, key_id: &str) -> EncryptionMetadata {
        EncryptionMetadata {
            key_id: key_id.to_string(),
            iv: hex::encode(self.iv),
            auth_tag: hex::encode(self.auth_tag),
        }
    }
}

/// AES-256-GCM keyed for a 128-bit IV.
type Cipher = AesGcm<Aes256, U16>;

fn cipher(key: &[u8; KEY_LEN]) -> Result<Cipher, CryptoError> {
    Cipher::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Authenticated encryption of whole buffers with AES-256-GCM. A fresh
/// random 16-byte IV is drawn for every call and the tag is kept detached so
/// it can be stored alongside the IV in the file record.
pub struct EncryptionService;

impl EncryptionService {
    pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<EncryptedPayload, CryptoError> {
        let cipher = cipher(key)?;
        let nonce = Cipher::generate_nonce(&mut OsRng);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(&nonce, b"", &mut buffer)
            .map_err(|e| CryptoError::Internal(e.to_string()))?;

        let mut iv = [0u8; NONCE_LEN];
        iv.copy_from_slice(nonce.as_slice());
        let mut auth_tag = [0u8; TAG_LEN];
        auth_tag.copy_from_slice(tag.as_slice());

        Ok(EncryptedPayload {
            ciphertext: buffer,
            iv,
            auth_tag,
        })
    }

    /// Any tampering with the ciphertext, nonce or tag yields
    /// [`CryptoError::IntegrityViolation`]; no partial plaintext is returned.
    pub fn decrypt(
        ciphertext: &[u8],
        key: &[u8; KEY_LEN],
        iv: &[u8],
        auth_tag: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if iv.len() != NONCE_LEN || auth_tag.len() != TAG_LEN {
            return Err(CryptoError::IntegrityViolation);
        }

        let cipher = cipher(key)?;
        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(auth_tag),
            )
            .map_err(|_| CryptoError::IntegrityViolation)?;

        Ok(buffer)
    }

    /// Decrypts using hex-encoded parameters as stored in a file record.
    pub fn decrypt_with_metadata(
        ciphertext: &[u8],
        key: &[u8; KEY_LEN],
        meta: &EncryptionMetadata,
    ) -> Result<Vec<u8>, CryptoError> {
        let iv = hex::decode(&meta.iv).map_err(|_| CryptoError::IntegrityViolation)?;
        let tag = hex::decode(&meta.auth_tag).map_err(|_| CryptoError::IntegrityViolation)?;
        Self::decrypt(ciphertext, key, &iv, &tag)
    }

    /// Runs [`Self::encrypt`] on the blocking pool, bounded by `timeout`.
    pub async fn encrypt_with_timeout(
        plaintext: Bytes,
        key: [u8; KEY_LEN],
        timeout: Duration,
    ) -> Result<EncryptedPayload, CryptoError> {
        let task = tokio::task::spawn_blocking(move || Self::encrypt(&plaintext, &key));
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined.map_err(|e| CryptoError::Internal(e.to_string()))?,
            Err(_) => Err(CryptoError::Timeout(timeout)),
        }
    }

    /// Runs [`Self::decrypt_with_metadata`] on the blocking pool, bounded by `timeout`.
    pub async fn decrypt_with_timeout(
        ciphertext: Vec<u8>,
        key: [u8; KEY_LEN],
        meta: EncryptionMetadata,
        timeout: Duration,
    ) -> Result<Vec<u8>, CryptoError> {
        let task = tokio::task::spawn_blocking(move || {
            Self::decrypt_with_metadata(&ciphertext, &key, &meta)
        });
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined.map_err(|e| CryptoError::Internal(e.to_string()))?,
            Err(_) => Err(CryptoError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    #[test]
    fn nonces_are_unique_per_call() {
        let a = EncryptionService::encrypt(b"same input", &KEY).unwrap();
        let b = EncryptionService::encrypt(b"same input", &KEY).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn truncated_tag_is_an_integrity_violation() {
        let enc = EncryptionService::encrypt(b"data", &KEY).unwrap();
        let err = EncryptionService::decrypt(&enc.ciphertext, &KEY, &enc.iv, &enc.auth_tag[..8])
            .unwrap_err();
        assert_eq!(err, CryptoError::IntegrityViolation);
    }

    #[test]
    fn iv_is_sixteen_random_bytes() {
        let enc = EncryptionService::encrypt(b"data", &KEY).unwrap();
        assert_eq!(enc.iv.len(), 16);
        assert_eq!(enc.auth_tag.len(), 16);
        assert_eq!(enc.ciphertext.len(), 4);

        // A 12-byte IV from another cipher is never accepted.
        let err = EncryptionService::decrypt(&enc.ciphertext, &KEY, &enc.iv[..12], &enc.auth_tag)
            .unwrap_err();
        assert_eq!(err, CryptoError::IntegrityViolation);
    }

    #[test]
    fn metadata_is_hex() {
        let enc = EncryptionService::encrypt(b"data", &KEY).unwrap();
        let meta = enc.metadata("mk-1");
        assert_eq!(meta.iv.len(), 32);
        assert_eq!(meta.auth_tag.len(), TAG_LEN * 2);
        let plain = EncryptionService::decrypt_with_metadata(&enc.ciphertext, &KEY, &meta).unwrap();
        assert_eq!(plain, b"data");
    }

    #[tokio::test]
    async fn async_wrappers_round_trip() {
        let enc = EncryptionService::encrypt_with_timeout(
            Bytes::from_static(b"payload"),
            KEY,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let plain = EncryptionService::decrypt_with_timeout(
            enc.ciphertext.clone(),
            KEY,
            enc.metadata("mk-1"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(plain, b"payload");
    }
}
