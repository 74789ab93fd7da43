use crate::services::encryption::{CryptoError, KEY_LEN};
use blake3::Hasher;
use std::collections::HashSet;

/// Resolves encryption key ids to key material. Files only ever record the
/// key id; the material stays with the provider.
pub trait KeyProvider: Send + Sync {
    /// Id of the key new files are encrypted with.
    fn active_key_id(&self) -> &str;

    fn key(&self, key_id: &str) -> Result<[u8; KEY_LEN], CryptoError>;

    fn active_key(&self) -> Result<(String, [u8; KEY_LEN]), CryptoError> {
        let id = self.active_key_id().to_string();
        let key = self.key(&id)?;
        Ok((id, key))
    }
}

/// Derives per-id keys from a single master secret. Retired ids stay
/// decryptable after rotation; unknown ids are refused.
pub struct MasterKeyProvider {
    secret: Vec<u8>,
    active_key_id: String,
    known_ids: HashSet<String>,
}

impl MasterKeyProvider {
    pub fn new(secret: &[u8], active_key_id: &str, retired_ids: &[String]) -> Result<Self, CryptoError> {
        if secret.len() < 16 {
            return Err(CryptoError::InvalidKey(
                "master secret must be at least 16 bytes".to_string(),
            ));
        }
        if active_key_id.trim().is_empty() {
            return Err(CryptoError::InvalidKey("empty key id".to_string()));
        }

        let mut known_ids: HashSet<String> = retired_ids.iter().cloned().collect();
        known_ids.insert(active_key_id.to_string());

        Ok(Self {
            secret: secret.to_vec(),
            active_key_id: active_key_id.to_string(),
            known_ids,
        })
    }

    /// Reads MASTER_KEY_SECRET. Without it a random secret is generated, which
    /// makes stored files unreadable after a restart.
    pub fn from_env(active_key_id: &str, retired_ids: &[String]) -> Result<Self, CryptoError> {
        match std::env::var("MASTER_KEY_SECRET") {
            Ok(secret) => Self::new(secret.as_bytes(), active_key_id, retired_ids),
            Err(_) => {
                tracing::warn!(
                    "⚠️  MASTER_KEY_SECRET not set, using an ephemeral master key (development only)"
                );
                let secret: [u8; 32] = rand::random();
                Self::new(&secret, active_key_id, retired_ids)
            }
        }
    }

    fn derive(&self, key_id: &str) -> [u8; KEY_LEN] {
        let mut hasher = Hasher::new_derive_key("sheet-ingest file encryption key v1");
        hasher.update(&self.secret);
        hasher.update(key_id.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl KeyProvider for MasterKeyProvider {
    fn active_key_id(&self) -> &str {
        &self.active_key_id
    }

    fn key(&self, key_id: &str) -> Result<[u8; KEY_LEN], CryptoError> {
        if !self.known_ids.contains(key_id) {
            return Err(CryptoError::UnknownKeyId(key_id.to_string()));
        }
        Ok(self.derive(key_id))
    }
}
